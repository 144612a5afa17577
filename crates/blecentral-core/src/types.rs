//! Peripheral identities, advertisement data and UUID helpers

use std::collections::BTreeMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{BleError, BleResult};

// ----------------------------------------------------------------------------
// UUID Helpers
// ----------------------------------------------------------------------------

/// Bluetooth base UUID `00000000-0000-1000-8000-00805f9b34fb`
pub const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned number onto the Bluetooth base UUID
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Expand a 32-bit assigned number onto the Bluetooth base UUID
pub const fn uuid_from_u32(short: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}

/// Parse a UUID in full, 16-bit (`"180D"`) or 32-bit (`"0000180d"`) form.
pub fn parse_uuid(input: &str) -> BleResult<Uuid> {
    let trimmed = input.trim();
    let hex_only = trimmed.strip_prefix("0x").unwrap_or(trimmed);

    let invalid = || BleError::InvalidUuid {
        input: input.to_string(),
    };

    match hex_only.len() {
        4 => u16::from_str_radix(hex_only, 16)
            .map(uuid_from_u16)
            .map_err(|_| invalid()),
        8 => u32::from_str_radix(hex_only, 16)
            .map(uuid_from_u32)
            .map_err(|_| invalid()),
        _ => Uuid::parse_str(trimmed).map_err(|_| invalid()),
    }
}

/// The 16-bit short form, if `uuid` sits on the Bluetooth base UUID.
pub fn short_uuid(uuid: &Uuid) -> Option<u16> {
    let value = uuid.as_u128();
    let mask: u128 = !(0xffff_ffffu128 << 96);
    if value & mask != BLUETOOTH_BASE_UUID {
        return None;
    }
    u16::try_from(value >> 96).ok()
}

/// Compact rendering used in logs and error messages (`2a37` instead of the full form)
pub fn display_uuid(uuid: &Uuid) -> String {
    match short_uuid(uuid) {
        Some(short) => format!("{:04x}", short),
        None => uuid.to_string(),
    }
}

// ----------------------------------------------------------------------------
// Peripheral Identity
// ----------------------------------------------------------------------------

/// Stable peripheral identity: a platform address (`AA:BB:CC:DD:EE:FF`) or a
/// backend-assigned identifier where the platform hides addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Case-insensitive comparison against an address string
    pub fn matches_address(&self, address: &str) -> bool {
        self.0.eq_ignore_ascii_case(address.trim())
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeripheralId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ----------------------------------------------------------------------------
// Advertisement Data
// ----------------------------------------------------------------------------

/// Most recent advertisement observed for a peripheral
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvertisementData {
    /// Advertised local name
    pub local_name: Option<String>,
    /// Advertised service UUIDs
    pub service_uuids: Vec<Uuid>,
    /// Manufacturer specific data keyed by company identifier
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    /// Service data keyed by service UUID
    pub service_data: BTreeMap<Uuid, Vec<u8>>,
    /// Advertised transmit power in dBm
    pub tx_power: Option<i16>,
    /// Received signal strength in dBm
    pub rssi: Option<i16>,
    /// Raw advertising payload, when the platform exposes it
    pub raw: Vec<u8>,
}

impl AdvertisementData {
    pub fn advertises_any(&self, services: &[Uuid]) -> bool {
        services.iter().any(|s| {
            self.service_uuids.contains(s) || self.service_data.contains_key(s)
        })
    }

    /// Fold a newer partial sighting into this one.
    ///
    /// Several stacks split one advertisement across multiple callbacks
    /// (scan response, manufacturer data, service list); fields missing from
    /// `newer` keep their previous value.
    pub fn merge(&mut self, newer: AdvertisementData) {
        if newer.local_name.is_some() {
            self.local_name = newer.local_name;
        }
        for uuid in newer.service_uuids {
            if !self.service_uuids.contains(&uuid) {
                self.service_uuids.push(uuid);
            }
        }
        self.manufacturer_data.extend(newer.manufacturer_data);
        self.service_data.extend(newer.service_data);
        if newer.tx_power.is_some() {
            self.tx_power = newer.tx_power;
        }
        if newer.rssi.is_some() {
            self.rssi = newer.rssi;
        }
        if !newer.raw.is_empty() {
            self.raw = newer.raw;
        }
    }

    /// Short hex summary of manufacturer data for logging
    pub fn manufacturer_summary(&self) -> String {
        self.manufacturer_data
            .iter()
            .map(|(company, data)| format!("0x{:04X}={}", company, hex::encode(data)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

// ----------------------------------------------------------------------------
// Peripheral Handle
// ----------------------------------------------------------------------------

/// A peripheral seen by the scanner, with its latest advertisement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeripheralHandle {
    /// Stable identity
    pub id: PeripheralId,
    /// Human-readable name (alias or advertised name)
    pub name: Option<String>,
    /// Last-seen advertisement payload
    pub advertisement: AdvertisementData,
    /// When the advertisement was observed
    pub last_seen: SystemTime,
}

impl PeripheralHandle {
    pub fn new(id: PeripheralId, advertisement: AdvertisementData) -> Self {
        Self {
            name: advertisement.local_name.clone(),
            id,
            advertisement,
            last_seen: SystemTime::now(),
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn rssi(&self) -> Option<i16> {
        self.advertisement.rssi
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unknown>")
    }
}

impl fmt::Display for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.display_name())
    }
}
