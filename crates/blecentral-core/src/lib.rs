//! blecentral core
//!
//! Platform-independent building blocks of the BLE central client: peripheral
//! identities and advertisement data, configuration, the error taxonomy, the
//! [`NativeAdapter`] capability contract, the session state machine, the
//! command queue, the GATT attribute cache and the subscription registry.
//!
//! Nothing in this crate spawns tasks; the runtime crate drives these types
//! from one execution context per session.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod backend;
pub mod config;
pub mod errors;
pub mod gatt;
pub mod queue;
pub mod state;
pub mod subscription;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use backend::{
    BackendEvent, BackendEventReceiver, BackendEventSender, BackendKind, ConnectionHandle,
    NativeAdapter, NativeConnection, ScanEvent, ScanEventReceiver, ScanEventSender,
    ATT_WRITE_OVERHEAD, DEFAULT_ATT_MTU,
};
pub use config::{
    BackendPreference, ClientConfig, DuplicateUuidPolicy, OrPattern, ScanFilter, ScanningMode,
    SessionConfig,
};
pub use errors::{BleError, BleResult, GattOperation};
pub use gatt::{
    AttributeCache, AttributeHandle, CharacteristicDefinition, CharacteristicProperties,
    CharacteristicRef, CharacteristicSelector, DescriptorDefinition, DescriptorRef,
    DescriptorSelector, GattCharacteristic, GattDescriptor, GattService, GattTree,
    ServiceDefinition, WriteMode,
};
pub use queue::{CommandId, CommandKind, CommandQueue, Completion, QueuedCommand};
pub use state::{
    AuditEntry, ConnectionState, SessionEvent, SessionMachine, StateTransitionError, Transition,
};
pub use subscription::{Registration, SubscriptionId, SubscriptionRegistry};
pub use types::{
    display_uuid, parse_uuid, short_uuid, uuid_from_u16, uuid_from_u32, AdvertisementData,
    PeripheralHandle, PeripheralId,
};
