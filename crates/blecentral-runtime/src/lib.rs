//! blecentral runtime
//!
//! Tokio execution layer for the BLE central client:
//! - [`Scanner`]: filtered, de-duplicated advertisement streams
//! - [`Session`]: one connection per peripheral, driven by a dedicated task
//!   that owns the state machine, command queue and attribute cache
//! - Notification dispatch on a separate task so handlers never stall commands
//! - [`Central`]: adapter plus configuration, handing out scanners and sessions
//!
//! Backends plug in through [`NativeAdapter`]; `blecentral-ble` provides the
//! native ones and `blecentral-harness` a simulated one.

mod actor;
pub mod central;
pub mod dispatcher;
pub mod scanner;
pub mod session;

pub use actor::{SessionNotice, SessionSnapshot};
pub use central::Central;
pub use dispatcher::{NotificationHandler, NotificationStream, Subscription};
pub use scanner::{ScanStream, Scanner, DEFAULT_DISCOVERY_WINDOW};
pub use session::Session;

// Re-export core types for convenience
pub use blecentral_core::{
    uuid_from_u16, AdvertisementData, AttributeHandle, AuditEntry, BackendKind, BleError,
    BleResult, CharacteristicProperties, CharacteristicRef, CharacteristicSelector,
    ClientConfig, ConnectionState, DescriptorRef, DescriptorSelector, DuplicateUuidPolicy,
    GattCharacteristic, GattDescriptor, GattService, GattTree, NativeAdapter, OrPattern,
    PeripheralHandle, PeripheralId, ScanFilter, ScanningMode, SessionConfig, SubscriptionId,
    WriteMode,
};
