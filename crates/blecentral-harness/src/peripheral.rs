//! Simulated peripherals
//!
//! A [`SimulatedPeripheral`] is an advertisement plus a GATT database with
//! handles assigned in declaration order. Characteristic values live in the
//! database and survive reconnects; with `echo_writes` enabled a write
//! replaces the stored value, so a following read returns the written bytes.

use std::collections::HashMap;

use blecentral_core::{
    uuid_from_u16, AdvertisementData, AttributeHandle, CharacteristicDefinition,
    CharacteristicProperties, DescriptorDefinition, PeripheralHandle, PeripheralId,
    ServiceDefinition,
};
use uuid::Uuid;

/// Client Characteristic Configuration descriptor
pub const CCCD_UUID: Uuid = uuid_from_u16(0x2902);

// ----------------------------------------------------------------------------
// Peripheral Definition
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    pub id: PeripheralId,
    pub advertisement: AdvertisementData,
    pub services: Vec<ServiceDefinition>,
    /// Initial attribute values
    pub values: HashMap<AttributeHandle, Vec<u8>>,
    /// Store written values so reads return them
    pub echo_writes: bool,
    /// MTU reported at connect time
    pub mtu: Option<u16>,
    next_handle: u16,
}

impl SimulatedPeripheral {
    pub fn new<I: Into<PeripheralId>>(id: I) -> Self {
        Self {
            id: id.into(),
            advertisement: AdvertisementData::default(),
            services: Vec::new(),
            values: HashMap::new(),
            echo_writes: true,
            mtu: None,
            next_handle: 1,
        }
    }

    pub fn named<S: Into<String>>(mut self, name: S) -> Self {
        self.advertisement.local_name = Some(name.into());
        self
    }

    /// Add 16-bit service UUIDs to the advertisement
    pub fn advertising(mut self, services: &[u16]) -> Self {
        self.advertisement
            .service_uuids
            .extend(services.iter().copied().map(uuid_from_u16));
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.advertisement.rssi = Some(rssi);
        self
    }

    pub fn with_manufacturer_data(mut self, company: u16, data: &[u8]) -> Self {
        self.advertisement
            .manufacturer_data
            .insert(company, data.to_vec());
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn with_echo_writes(mut self, enabled: bool) -> Self {
        self.echo_writes = enabled;
        self
    }

    /// Append a service; characteristics are added with [`Self::characteristic`]
    pub fn service(mut self, uuid: Uuid) -> Self {
        let handle = self.allocate();
        self.services.push(ServiceDefinition {
            uuid,
            handle,
            primary: true,
            characteristics: Vec::new(),
        });
        self
    }

    /// Append a characteristic to the most recently added service.
    ///
    /// Notifiable characteristics get a CCCD descriptor.
    pub fn characteristic(
        mut self,
        uuid: Uuid,
        properties: CharacteristicProperties,
        initial: &[u8],
    ) -> Self {
        if self.services.is_empty() {
            self = self.service(uuid_from_u16(0x1800));
        }

        let handle = self.allocate();
        let descriptors = if properties.can_subscribe() {
            let cccd = self.allocate();
            self.values.insert(cccd, vec![0x00, 0x00]);
            vec![DescriptorDefinition {
                uuid: CCCD_UUID,
                handle: cccd,
            }]
        } else {
            Vec::new()
        };

        if let Some(service) = self.services.last_mut() {
            service.characteristics.push(CharacteristicDefinition {
                uuid,
                handle,
                properties,
                descriptors,
            });
        }
        self.values.insert(handle, initial.to_vec());
        self
    }

    /// Handles of every characteristic with this UUID, in declaration order
    pub fn handles_of(&self, uuid: Uuid) -> Vec<AttributeHandle> {
        self.characteristics()
            .filter(|c| c.uuid == uuid)
            .map(|c| c.handle)
            .collect()
    }

    /// First handle for this UUID
    pub fn handle_of(&self, uuid: Uuid) -> Option<AttributeHandle> {
        self.handles_of(uuid).into_iter().next()
    }

    pub fn characteristic_definition(
        &self,
        handle: AttributeHandle,
    ) -> Option<&CharacteristicDefinition> {
        self.characteristics().find(|c| c.handle == handle)
    }

    pub fn is_descriptor(&self, handle: AttributeHandle) -> bool {
        self.characteristics()
            .flat_map(|c| c.descriptors.iter())
            .any(|d| d.handle == handle)
    }

    /// The sighting a scanner would report for this peripheral
    pub fn sighting(&self) -> PeripheralHandle {
        PeripheralHandle::new(self.id.clone(), self.advertisement.clone())
    }

    fn characteristics(&self) -> impl Iterator<Item = &CharacteristicDefinition> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }

    fn allocate(&mut self) -> AttributeHandle {
        let handle = AttributeHandle(self.next_handle);
        self.next_handle += 1;
        handle
    }
}

// ----------------------------------------------------------------------------
// Property Shorthands
// ----------------------------------------------------------------------------

pub fn read_only() -> CharacteristicProperties {
    CharacteristicProperties {
        read: true,
        ..Default::default()
    }
}

pub fn read_write() -> CharacteristicProperties {
    CharacteristicProperties {
        read: true,
        write: true,
        write_without_response: true,
        ..Default::default()
    }
}

pub fn notify_only() -> CharacteristicProperties {
    CharacteristicProperties {
        notify: true,
        ..Default::default()
    }
}

pub fn read_notify() -> CharacteristicProperties {
    CharacteristicProperties {
        read: true,
        notify: true,
        ..Default::default()
    }
}

// ----------------------------------------------------------------------------
// Presets
// ----------------------------------------------------------------------------

/// Heart-rate service (0x180D) with measurement (0x2A37, notify), body
/// sensor location (0x2A38, read) and battery service (0x180F)
pub fn heart_rate_monitor<I: Into<PeripheralId>>(id: I) -> SimulatedPeripheral {
    SimulatedPeripheral::new(id)
        .named("HRM")
        .advertising(&[0x180d])
        .with_rssi(-55)
        .service(uuid_from_u16(0x180d))
        .characteristic(uuid_from_u16(0x2a37), notify_only(), &[0x00, 0x48])
        .characteristic(uuid_from_u16(0x2a38), read_only(), &[0x01])
        .service(uuid_from_u16(0x180f))
        .characteristic(uuid_from_u16(0x2a19), read_notify(), &[0x64])
}

/// Nordic UART-style peripheral whose writable characteristic echoes writes
pub fn echo_peripheral<I: Into<PeripheralId>>(id: I) -> SimulatedPeripheral {
    SimulatedPeripheral::new(id)
        .named("Echo")
        .with_rssi(-60)
        .service(ECHO_SERVICE_UUID)
        .characteristic(ECHO_CHARACTERISTIC_UUID, read_write(), &[])
}

pub const ECHO_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
pub const ECHO_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_assigned_in_declaration_order() {
        let hrm = heart_rate_monitor("AA:BB:CC:DD:EE:01");
        let measurement = hrm.handle_of(uuid_from_u16(0x2a37)).unwrap();
        let location = hrm.handle_of(uuid_from_u16(0x2a38)).unwrap();
        assert!(measurement < location);

        let definition = hrm.characteristic_definition(measurement).unwrap();
        assert_eq!(definition.descriptors.len(), 1);
        assert!(hrm.is_descriptor(definition.descriptors[0].handle));
        assert_eq!(hrm.values.get(&location), Some(&vec![0x01]));
    }
}
