//! Backend Adapter Interface
//!
//! [`NativeAdapter`] is the capability contract every native stack satisfies.
//! Implementations translate their own threading and callback model into two
//! ordered channels: [`ScanEvent`]s for a running scan and [`BackendEvent`]s
//! for one connection. The core never assumes an ordering between those events
//! and the completion of a command issued on the same connection.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ScanFilter;
use crate::errors::BleResult;
use crate::gatt::{AttributeHandle, ServiceDefinition, WriteMode};
use crate::types::{PeripheralHandle, PeripheralId};

/// ATT MTU assumed until the backend reports a negotiated value
pub const DEFAULT_ATT_MTU: u16 = 23;

/// ATT opcode + handle overhead subtracted from the MTU for write payloads
pub const ATT_WRITE_OVERHEAD: u16 = 3;

// ----------------------------------------------------------------------------
// Backend Kinds
// ----------------------------------------------------------------------------

/// Which native stack an adapter drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    BlueZ,
    CoreBluetooth,
    WinRt,
    Simulated,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::BlueZ => "bluez",
            BackendKind::CoreBluetooth => "corebluetooth",
            BackendKind::WinRt => "winrt",
            BackendKind::Simulated => "simulated",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Events
// ----------------------------------------------------------------------------

/// Scan results delivered by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// An advertisement (or scan response) was observed
    Advertisement(PeripheralHandle),
    /// The stack forgot a previously reported peripheral
    DeviceRemoved(PeripheralId),
}

/// Asynchronous events for one native connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// Link dropped (remote, supervision timeout, adapter powered off, ...)
    Disconnected { reason: String },
    /// Notification or indication payload
    ValueChanged {
        handle: AttributeHandle,
        value: Vec<u8>,
    },
    /// Negotiated ATT MTU
    MtuChanged { mtu: u16 },
}

pub type ScanEventReceiver = mpsc::UnboundedReceiver<ScanEvent>;
pub type ScanEventSender = mpsc::UnboundedSender<ScanEvent>;
pub type BackendEventReceiver = mpsc::UnboundedReceiver<BackendEvent>;
pub type BackendEventSender = mpsc::UnboundedSender<BackendEvent>;

// ----------------------------------------------------------------------------
// Connections
// ----------------------------------------------------------------------------

/// Backend token for an established native connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub peripheral: PeripheralId,
    /// Backend-assigned value distinguishing successive connections
    pub token: u64,
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peripheral, self.token)
    }
}

/// Result of a successful `connect`
#[derive(Debug)]
pub struct NativeConnection {
    pub handle: ConnectionHandle,
    /// Ordered event channel for this connection; closes when the backend
    /// forgets the connection
    pub events: BackendEventReceiver,
    /// ATT MTU, when already known at connect time
    pub mtu: Option<u16>,
}

// ----------------------------------------------------------------------------
// Adapter Trait
// ----------------------------------------------------------------------------

/// Capability contract implemented once per native stack.
///
/// Characteristic and descriptor arguments are backend handles taken from the
/// [`ServiceDefinition`]s returned by `discover_services` on the same
/// connection.
#[async_trait]
pub trait NativeAdapter: Send + Sync + 'static {
    /// Stack driven by this adapter
    fn kind(&self) -> BackendKind;

    /// Activate the radio receiver and stream sightings.
    ///
    /// The backend filters on `filter.service_uuids` and
    /// `filter.scanning_mode` where it can; the scanner re-checks every
    /// sighting regardless.
    async fn start_scan(&self, filter: &ScanFilter) -> BleResult<ScanEventReceiver>;

    /// Deactivate the radio receiver. No-op when not scanning.
    async fn stop_scan(&self) -> BleResult<()>;

    async fn connect(&self, peripheral: &PeripheralId) -> BleResult<NativeConnection>;

    async fn disconnect(&self, connection: &ConnectionHandle) -> BleResult<()>;

    /// Enumerate services, characteristics and descriptors
    async fn discover_services(
        &self,
        connection: &ConnectionHandle,
    ) -> BleResult<Vec<ServiceDefinition>>;

    async fn read(
        &self,
        connection: &ConnectionHandle,
        characteristic: AttributeHandle,
    ) -> BleResult<Vec<u8>>;

    /// Write a value. `WithoutResponse` returns once the stack accepted the
    /// packet; `WithResponse` returns on the peripheral's acknowledgement.
    async fn write(
        &self,
        connection: &ConnectionHandle,
        characteristic: AttributeHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> BleResult<()>;

    /// Enable or disable notifications/indications
    async fn set_notify(
        &self,
        connection: &ConnectionHandle,
        characteristic: AttributeHandle,
        enabled: bool,
    ) -> BleResult<()>;

    async fn read_descriptor(
        &self,
        connection: &ConnectionHandle,
        descriptor: AttributeHandle,
    ) -> BleResult<Vec<u8>>;

    async fn write_descriptor(
        &self,
        connection: &ConnectionHandle,
        descriptor: AttributeHandle,
        value: &[u8],
    ) -> BleResult<()>;
}
