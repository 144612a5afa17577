//! Configuration for scanning, sessions and backend selection
//!
//! All structures are serde-serialisable so that they can be layered from
//! defaults, a TOML file and `BLECENTRAL_*` environment variables through
//! [`ClientConfig::load`].

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{BleError, BleResult};
use crate::types::{parse_uuid, PeripheralHandle};

// ----------------------------------------------------------------------------
// Scan Configuration
// ----------------------------------------------------------------------------

/// Radio scanning mode requested from the native stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ScanningMode {
    /// Send scan requests and collect scan responses
    #[default]
    Active,
    /// Listen only
    Passive,
}

/// One advertisement data pattern for passive scanning.
///
/// Matches when the AD structure of type `data_type` carries `content`
/// starting at byte `start_position`. A passive scan reports a peripheral
/// when any of its patterns match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrPattern {
    pub start_position: u8,
    /// AD type, e.g. `0xff` for manufacturer specific data
    pub data_type: u8,
    pub content: Vec<u8>,
}

impl OrPattern {
    pub fn new(start_position: u8, data_type: u8, content: &[u8]) -> Self {
        Self {
            start_position,
            data_type,
            content: content.to_vec(),
        }
    }
}

/// Options for one scan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFilter {
    /// Restrict to peripherals advertising any of these services
    pub service_uuids: Vec<Uuid>,
    /// Stop automatically after this duration
    pub timeout: Option<Duration>,
    /// Re-emit repeated sightings of the same peripheral
    pub duplicates: bool,
    /// Ignore sightings weaker than this RSSI (dBm)
    pub min_rssi: Option<i16>,
    /// Only peripherals whose name starts with this prefix
    pub name_prefix: Option<String>,
    /// Active or passive scanning
    pub scanning_mode: ScanningMode,
    /// Advertisement patterns a passive scan listens for
    pub or_patterns: Vec<OrPattern>,
}

impl ScanFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a filter from UUID strings in full or short form
    pub fn services<S: AsRef<str>>(uuids: &[S]) -> BleResult<Self> {
        let service_uuids = uuids
            .iter()
            .map(|u| parse_uuid(u.as_ref()))
            .collect::<BleResult<Vec<_>>>()?;
        Ok(Self {
            service_uuids,
            ..Self::default()
        })
    }

    pub fn with_service_uuids<I: IntoIterator<Item = Uuid>>(mut self, uuids: I) -> Self {
        self.service_uuids.extend(uuids);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_duplicates(mut self, enabled: bool) -> Self {
        self.duplicates = enabled;
        self
    }

    pub fn with_min_rssi(mut self, rssi: i16) -> Self {
        self.min_rssi = Some(rssi);
        self
    }

    pub fn with_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn with_scanning_mode(mut self, mode: ScanningMode) -> Self {
        self.scanning_mode = mode;
        self
    }

    /// Passive scan reporting peripherals that match any of `patterns`
    pub fn passive<I: IntoIterator<Item = OrPattern>>(patterns: I) -> Self {
        Self {
            scanning_mode: ScanningMode::Passive,
            or_patterns: patterns.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_or_pattern(mut self, pattern: OrPattern) -> Self {
        self.or_patterns.push(pattern);
        self
    }

    /// Patterns for a passive scan.
    ///
    /// Passive scans are driven by advertisement monitors, which filter on
    /// patterns only: service UUID filters are rejected and at least one
    /// pattern is required.
    pub fn passive_patterns(&self) -> BleResult<&[OrPattern]> {
        if !self.service_uuids.is_empty() {
            return Err(BleError::config_error(
                "service UUID filters are not supported with passive scanning",
            ));
        }
        if self.or_patterns.is_empty() {
            return Err(BleError::config_error(
                "passive scanning requires at least one or_pattern",
            ));
        }
        Ok(&self.or_patterns)
    }

    /// Whether a sighting passes this filter.
    ///
    /// Native stacks apply service filters with varying fidelity, so the
    /// scanner re-checks every sighting here.
    pub fn matches(&self, peripheral: &PeripheralHandle) -> bool {
        if !self.service_uuids.is_empty()
            && !peripheral.advertisement.advertises_any(&self.service_uuids)
        {
            return false;
        }

        if let Some(min) = self.min_rssi {
            match peripheral.advertisement.rssi {
                Some(rssi) if rssi >= min => {}
                _ => return false,
            }
        }

        if let Some(prefix) = &self.name_prefix {
            let name = peripheral
                .name
                .as_deref()
                .or(peripheral.advertisement.local_name.as_deref());
            if !name.is_some_and(|n| n.starts_with(prefix.as_str())) {
                return false;
            }
        }

        true
    }
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// How a bare UUID is resolved when a peripheral exposes it more than once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DuplicateUuidPolicy {
    /// First match in discovery order
    #[default]
    FirstMatch,
    /// Last match in discovery order
    LastMatch,
    /// Refuse to guess; the caller must use a qualified selector
    Reject,
}

/// Per-session behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Deadline for the native connect call
    pub connect_timeout: Duration,
    /// Deadline for the service discovery pass
    pub discovery_timeout: Duration,
    /// Deadline applied to GATT commands without an explicit timeout
    pub default_command_timeout: Option<Duration>,
    /// Resolution of duplicate characteristic UUIDs
    pub duplicate_uuid_policy: DuplicateUuidPolicy,
    /// Allow several handlers per characteristic
    pub allow_fan_out: bool,
    /// Capacity of the request channel into the session task
    pub request_buffer_size: usize,
    /// Number of state transitions kept in the audit trail
    pub audit_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(10),
            default_command_timeout: Some(Duration::from_secs(5)),
            duplicate_uuid_policy: DuplicateUuidPolicy::FirstMatch,
            allow_fan_out: false,
            request_buffer_size: 32,
            audit_capacity: 64,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short deadlines suited to simulated adapters
    pub fn testing() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            discovery_timeout: Duration::from_millis(500),
            default_command_timeout: Some(Duration::from_millis(500)),
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_command_timeout = timeout;
        self
    }

    pub fn with_duplicate_uuid_policy(mut self, policy: DuplicateUuidPolicy) -> Self {
        self.duplicate_uuid_policy = policy;
        self
    }

    pub fn with_fan_out(mut self, enabled: bool) -> Self {
        self.allow_fan_out = enabled;
        self
    }

    pub fn validate(&self) -> BleResult<()> {
        if self.connect_timeout.is_zero() {
            return Err(BleError::config_error("connect timeout cannot be zero"));
        }
        if self.discovery_timeout.is_zero() {
            return Err(BleError::config_error("discovery timeout cannot be zero"));
        }
        if self.default_command_timeout.is_some_and(|t| t.is_zero()) {
            return Err(BleError::config_error("command timeout cannot be zero"));
        }
        if self.request_buffer_size == 0 {
            return Err(BleError::config_error("request buffer size cannot be zero"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Client Configuration
// ----------------------------------------------------------------------------

/// Which native stack to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendPreference {
    /// BlueZ on Linux, btleplug elsewhere
    #[default]
    Auto,
    /// BlueZ over D-Bus (Linux only)
    BlueZ,
    /// btleplug (CoreBluetooth, WinRT, or BlueZ)
    Btleplug,
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Adapter to use, e.g. `hci0`; the default adapter when unset
    pub adapter: Option<String>,
    /// Native stack selection
    pub backend: BackendPreference,
    /// Defaults for new sessions
    pub session: SessionConfig,
    /// Defaults for scans started without an explicit filter
    pub scan: ScanFilter,
}

impl ClientConfig {
    /// Load defaults, then `blecentral.toml`, then `BLECENTRAL_*` variables
    pub fn load() -> BleResult<Self> {
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file("blecentral.toml"))
                .merge(Env::prefixed("BLECENTRAL_").split("__")),
        )
    }

    /// Load defaults overlaid with a specific TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> BleResult<Self> {
        Self::extract(
            Figment::new()
                .merge(Serialized::defaults(Self::default()))
                .merge(Toml::file(path.as_ref())),
        )
    }

    fn extract(figment: Figment) -> BleResult<Self> {
        let config: ClientConfig = figment
            .extract()
            .map_err(|e| BleError::config_error(format!("failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> BleResult<()> {
        if self.adapter.as_deref().is_some_and(str::is_empty) {
            return Err(BleError::config_error("adapter name cannot be empty"));
        }
        self.session.validate()
    }
}
