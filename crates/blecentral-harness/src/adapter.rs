//! Simulated Native Adapter
//!
//! Deterministic [`NativeAdapter`] for testing sessions and scanners without
//! radio hardware. Supports scripted advertisements, per-peripheral GATT
//! databases, fault injection (failed or hanging connects, discovery and
//! operations), holding acks behind a gate, and injecting unsolicited
//! backend events. Every call is recorded so tests can assert what the
//! backend observed and how many operations overlapped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use blecentral_core::{
    AttributeHandle, BackendEvent, BackendEventSender, BackendKind, BleError, BleResult,
    ConnectionHandle, GattOperation, NativeAdapter, NativeConnection, PeripheralHandle,
    PeripheralId, ScanEvent, ScanEventReceiver, ScanEventSender, ScanFilter, ServiceDefinition,
    WriteMode,
};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::peripheral::SimulatedPeripheral;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Timing behaviour of the simulated stack
#[derive(Debug, Clone)]
pub struct SimulatedAdapterConfig {
    /// Delay before a connect resolves
    pub connect_latency: Duration,
    /// Delay before a discovery pass resolves
    pub discovery_latency: Duration,
    /// Delay before each GATT operation resolves
    pub op_latency: Duration,
    /// Apply the service UUID filter inside the backend as well
    pub filter_in_backend: bool,
}

impl Default for SimulatedAdapterConfig {
    fn default() -> Self {
        Self {
            connect_latency: Duration::from_millis(5),
            discovery_latency: Duration::from_millis(5),
            op_latency: Duration::from_millis(1),
            filter_in_backend: false,
        }
    }
}

impl SimulatedAdapterConfig {
    /// No artificial latency
    pub fn ideal() -> Self {
        Self {
            connect_latency: Duration::ZERO,
            discovery_latency: Duration::ZERO,
            op_latency: Duration::ZERO,
            filter_in_backend: false,
        }
    }

    /// Latencies in the range of a real link with a busy peripheral
    pub fn slow() -> Self {
        Self {
            connect_latency: Duration::from_millis(100),
            discovery_latency: Duration::from_millis(80),
            op_latency: Duration::from_millis(30),
            filter_in_backend: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Recorded Calls and Faults
// ----------------------------------------------------------------------------

/// One call observed by the simulated backend
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterCall {
    StartScan(ScanFilter),
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId),
    Read(AttributeHandle),
    Write {
        handle: AttributeHandle,
        value: Vec<u8>,
        mode: WriteMode,
    },
    SetNotify {
        handle: AttributeHandle,
        enabled: bool,
    },
    ReadDescriptor(AttributeHandle),
    WriteDescriptor {
        handle: AttributeHandle,
        value: Vec<u8>,
    },
}

impl AdapterCall {
    /// Whether this call is a GATT transaction on an established link
    pub fn is_gatt(&self) -> bool {
        matches!(
            self,
            AdapterCall::DiscoverServices(_)
                | AdapterCall::Read(_)
                | AdapterCall::Write { .. }
                | AdapterCall::SetNotify { .. }
                | AdapterCall::ReadDescriptor(_)
                | AdapterCall::WriteDescriptor { .. }
        )
    }
}

#[derive(Debug, Clone, Default)]
struct FaultPlan {
    scan_error: Option<String>,
    connect_error: Option<String>,
    connect_hang: bool,
    discovery_error: Option<String>,
    discovery_hang: bool,
    op_errors: HashMap<AttributeHandle, String>,
    hanging_ops: HashSet<AttributeHandle>,
}

#[derive(Debug, Clone)]
struct ScriptedScanEvent {
    delay: Duration,
    event: ScanEvent,
}

// ----------------------------------------------------------------------------
// Internal State
// ----------------------------------------------------------------------------

struct Connection {
    peripheral: PeripheralId,
    events: BackendEventSender,
    notifying: HashSet<AttributeHandle>,
}

struct ScanSession {
    sender: ScanEventSender,
    filter: ScanFilter,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct AdapterState {
    peripherals: HashMap<PeripheralId, SimulatedPeripheral>,
    script: Vec<ScriptedScanEvent>,
    scan: Option<ScanSession>,
    connections: HashMap<u64, Connection>,
    faults: FaultPlan,
    calls: Vec<AdapterCall>,
    gate: Option<Arc<Semaphore>>,
}

/// Decrements the in-flight counter when an operation finishes or is dropped
struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

// ----------------------------------------------------------------------------
// Simulated Adapter
// ----------------------------------------------------------------------------

pub struct SimulatedAdapter {
    config: SimulatedAdapterConfig,
    state: Mutex<AdapterState>,
    next_token: AtomicU64,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: AtomicUsize,
    discovery_calls: AtomicUsize,
}

impl Default for SimulatedAdapter {
    fn default() -> Self {
        Self::new(SimulatedAdapterConfig::default())
    }
}

impl SimulatedAdapter {
    pub fn new(config: SimulatedAdapterConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AdapterState::default()),
            next_token: AtomicU64::new(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: AtomicUsize::new(0),
            discovery_calls: AtomicUsize::new(0),
        }
    }

    pub fn ideal() -> Self {
        Self::new(SimulatedAdapterConfig::ideal())
    }

    fn state(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Setup
    // ------------------------------------------------------------------------

    /// Register a peripheral that can be connected to
    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        debug!("Simulated adapter: added peripheral {}", peripheral.id);
        self.state()
            .peripherals
            .insert(peripheral.id.clone(), peripheral);
    }

    pub fn with_peripheral(self, peripheral: SimulatedPeripheral) -> Self {
        self.add_peripheral(peripheral);
        self
    }

    /// Append an advertisement to the scan script, `delay` after the previous one
    pub fn script_advertisement(&self, delay: Duration, sighting: PeripheralHandle) {
        self.state().script.push(ScriptedScanEvent {
            delay,
            event: ScanEvent::Advertisement(sighting),
        });
    }

    /// Script the sighting of a registered (or unregistered) peripheral
    pub fn script_peripheral(&self, delay: Duration, peripheral: &SimulatedPeripheral) {
        self.script_advertisement(delay, peripheral.sighting());
    }

    /// Append a `DeviceRemoved` to the scan script
    pub fn script_removal(&self, delay: Duration, id: PeripheralId) {
        self.state().script.push(ScriptedScanEvent {
            delay,
            event: ScanEvent::DeviceRemoved(id),
        });
    }

    /// Deliver an advertisement to the running scan immediately
    pub fn advertise_now(&self, sighting: PeripheralHandle) -> bool {
        let state = self.state();
        match &state.scan {
            Some(scan) if backend_accepts(&scan.filter, &sighting, self.config.filter_in_backend) => {
                scan.sender.send(ScanEvent::Advertisement(sighting)).is_ok()
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------------
    // Fault Injection
    // ------------------------------------------------------------------------

    pub fn fail_scan<R: Into<String>>(&self, reason: R) {
        self.state().faults.scan_error = Some(reason.into());
    }

    pub fn fail_connect<R: Into<String>>(&self, reason: R) {
        self.state().faults.connect_error = Some(reason.into());
    }

    /// Connect attempts never resolve
    pub fn hang_connect(&self) {
        self.state().faults.connect_hang = true;
    }

    pub fn fail_discovery<R: Into<String>>(&self, reason: R) {
        self.state().faults.discovery_error = Some(reason.into());
    }

    pub fn hang_discovery(&self) {
        self.state().faults.discovery_hang = true;
    }

    /// Operations on `handle` are rejected with `reason`
    pub fn fail_operation<R: Into<String>>(&self, handle: AttributeHandle, reason: R) {
        self.state().faults.op_errors.insert(handle, reason.into());
    }

    /// Operations on `handle` never resolve
    pub fn hang_operation(&self, handle: AttributeHandle) {
        self.state().faults.hanging_ops.insert(handle);
    }

    pub fn clear_faults(&self) {
        self.state().faults = FaultPlan::default();
    }

    /// Hold every GATT ack until released
    pub fn hold_acks(&self) {
        self.state().gate = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let `count` held acks through
    pub fn release_acks(&self, count: usize) {
        if let Some(gate) = &self.state().gate {
            gate.add_permits(count);
        }
    }

    /// Stop holding acks and release every waiting operation
    pub fn open_gate(&self) {
        if let Some(gate) = self.state().gate.take() {
            gate.close();
        }
    }

    // ------------------------------------------------------------------------
    // Event Injection
    // ------------------------------------------------------------------------

    /// Drop every link to `id` as if the peripheral went away
    pub fn inject_disconnect<R: Into<String>>(&self, id: &PeripheralId, reason: R) -> bool {
        let reason = reason.into();
        let mut state = self.state();
        let tokens: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| &c.peripheral == id)
            .map(|(token, _)| *token)
            .collect();

        for token in &tokens {
            if let Some(connection) = state.connections.remove(token) {
                info!("Simulated adapter: link to {} lost ({})", id, reason);
                let _ = connection.events.send(BackendEvent::Disconnected {
                    reason: reason.clone(),
                });
            }
        }
        !tokens.is_empty()
    }

    /// Emit a notification if the characteristic is subscribed.
    ///
    /// The stored value is updated either way.
    pub fn notify(&self, id: &PeripheralId, handle: AttributeHandle, value: &[u8]) -> bool {
        let mut state = self.state();
        if let Some(peripheral) = state.peripherals.get_mut(id) {
            peripheral.values.insert(handle, value.to_vec());
        }
        let mut delivered = false;
        for connection in state.connections.values() {
            if &connection.peripheral == id && connection.notifying.contains(&handle) {
                delivered |= connection
                    .events
                    .send(BackendEvent::ValueChanged {
                        handle,
                        value: value.to_vec(),
                    })
                    .is_ok();
            }
        }
        delivered
    }

    /// Emit a raw backend event on every link to `id`
    pub fn inject_event(&self, id: &PeripheralId, event: BackendEvent) -> bool {
        let state = self.state();
        let mut delivered = false;
        for connection in state.connections.values() {
            if &connection.peripheral == id {
                delivered |= connection.events.send(event.clone()).is_ok();
            }
        }
        delivered
    }

    pub fn change_mtu(&self, id: &PeripheralId, mtu: u16) -> bool {
        self.inject_event(id, BackendEvent::MtuChanged { mtu })
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn calls(&self) -> Vec<AdapterCall> {
        self.state().calls.clone()
    }

    /// GATT transactions only, in the order the backend received them
    pub fn gatt_calls(&self) -> Vec<AdapterCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.is_gatt())
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Highest number of GATT operations observed outstanding at once
    pub fn max_concurrent_ops(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn ops_in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn discovery_count(&self) -> usize {
        self.discovery_calls.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.state().connections.len()
    }

    pub fn is_scanning(&self) -> bool {
        self.state().scan.is_some()
    }

    pub fn is_notifying(&self, id: &PeripheralId, handle: AttributeHandle) -> bool {
        self.state()
            .connections
            .values()
            .any(|c| &c.peripheral == id && c.notifying.contains(&handle))
    }

    pub fn stored_value(&self, id: &PeripheralId, handle: AttributeHandle) -> Option<Vec<u8>> {
        self.state()
            .peripherals
            .get(id)
            .and_then(|p| p.values.get(&handle).cloned())
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn record(&self, call: AdapterCall) {
        self.state().calls.push(call);
    }

    fn begin_op(&self) -> InFlightGuard {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard {
            counter: Arc::clone(&self.in_flight),
        }
    }

    async fn pause(duration: Duration) {
        if duration.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(duration).await;
        }
    }

    /// Shared preamble of every GATT operation: latency, faults, gate, link check
    async fn gatt_preamble(
        &self,
        call: AdapterCall,
        connection: &ConnectionHandle,
        handle: AttributeHandle,
        operation: GattOperation,
    ) -> BleResult<InFlightGuard> {
        self.record(call);
        let guard = self.begin_op();

        let (hang, error, gate) = {
            let state = self.state();
            (
                state.faults.hanging_ops.contains(&handle),
                state.faults.op_errors.get(&handle).cloned(),
                state.gate.clone(),
            )
        };

        if hang {
            debug!("Simulated adapter: {} on {} will never resolve", operation, handle);
            std::future::pending::<()>().await;
        }

        Self::pause(self.config.op_latency).await;

        if let Some(gate) = gate {
            // A closed gate lets everything through
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        if !self.state().connections.contains_key(&connection.token) {
            return Err(BleError::disconnected(format!("link {} is gone", connection)));
        }
        if let Some(reason) = error {
            return Err(BleError::operation(operation, handle.to_string(), reason));
        }
        Ok(guard)
    }

    fn with_peripheral_mut<T>(
        &self,
        connection: &ConnectionHandle,
        operation: GattOperation,
        handle: AttributeHandle,
        f: impl FnOnce(&mut SimulatedPeripheral, &mut Connection) -> BleResult<T>,
    ) -> BleResult<T> {
        let mut state = self.state();
        let state = &mut *state;
        let link = state
            .connections
            .get_mut(&connection.token)
            .ok_or_else(|| BleError::disconnected(format!("link {} is gone", connection)))?;
        let peripheral = state.peripherals.get_mut(&link.peripheral).ok_or_else(|| {
            BleError::operation(operation, handle.to_string(), "peripheral vanished")
        })?;
        f(peripheral, link)
    }
}

fn backend_accepts(filter: &ScanFilter, sighting: &PeripheralHandle, enabled: bool) -> bool {
    !enabled
        || filter.service_uuids.is_empty()
        || sighting.advertisement.advertises_any(&filter.service_uuids)
}

fn invalid_handle(operation: GattOperation, handle: AttributeHandle) -> BleError {
    BleError::operation(operation, handle.to_string(), "invalid handle")
}

// ----------------------------------------------------------------------------
// NativeAdapter Implementation
// ----------------------------------------------------------------------------

#[async_trait]
impl NativeAdapter for SimulatedAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Simulated
    }

    async fn start_scan(&self, filter: &ScanFilter) -> BleResult<ScanEventReceiver> {
        self.record(AdapterCall::StartScan(filter.clone()));

        let mut state = self.state();
        if let Some(reason) = state.faults.scan_error.clone() {
            return Err(BleError::scan(reason));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let script = state.script.clone();
        let task_sender = sender.clone();
        let task_filter = filter.clone();
        let filter_in_backend = self.config.filter_in_backend;

        let task = tokio::spawn(async move {
            for entry in script {
                tokio::time::sleep(entry.delay).await;
                if let ScanEvent::Advertisement(sighting) = &entry.event {
                    if !backend_accepts(&task_filter, sighting, filter_in_backend) {
                        continue;
                    }
                }
                if task_sender.send(entry.event).is_err() {
                    return;
                }
            }
        });

        if let Some(previous) = state.scan.replace(ScanSession {
            sender,
            filter: filter.clone(),
            task,
        }) {
            previous.task.abort();
        }

        info!("Simulated adapter: scan started");
        Ok(receiver)
    }

    async fn stop_scan(&self) -> BleResult<()> {
        self.record(AdapterCall::StopScan);
        if let Some(scan) = self.state().scan.take() {
            scan.task.abort();
            info!("Simulated adapter: scan stopped");
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> BleResult<NativeConnection> {
        self.record(AdapterCall::Connect(peripheral.clone()));

        let (hang, error) = {
            let state = self.state();
            (state.faults.connect_hang, state.faults.connect_error.clone())
        };
        if hang {
            std::future::pending::<()>().await;
        }

        Self::pause(self.config.connect_latency).await;

        if let Some(reason) = error {
            return Err(BleError::connect(peripheral.as_str(), reason));
        }

        let mut state = self.state();
        let mtu = state
            .peripherals
            .get(peripheral)
            .ok_or_else(|| BleError::connect(peripheral.as_str(), "peripheral not in range"))?
            .mtu;

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let (events, receiver) = mpsc::unbounded_channel();
        state.connections.insert(
            token,
            Connection {
                peripheral: peripheral.clone(),
                events,
                notifying: HashSet::new(),
            },
        );

        info!("Simulated adapter: connected to {} (token {})", peripheral, token);
        Ok(NativeConnection {
            handle: ConnectionHandle {
                peripheral: peripheral.clone(),
                token,
            },
            events: receiver,
            mtu,
        })
    }

    async fn disconnect(&self, connection: &ConnectionHandle) -> BleResult<()> {
        self.record(AdapterCall::Disconnect(connection.peripheral.clone()));
        Self::pause(self.config.op_latency).await;

        if let Some(link) = self.state().connections.remove(&connection.token) {
            info!("Simulated adapter: disconnected {}", connection);
            let _ = link.events.send(BackendEvent::Disconnected {
                reason: "local disconnect".into(),
            });
        }
        Ok(())
    }

    async fn discover_services(
        &self,
        connection: &ConnectionHandle,
    ) -> BleResult<Vec<ServiceDefinition>> {
        self.record(AdapterCall::DiscoverServices(connection.peripheral.clone()));
        self.discovery_calls.fetch_add(1, Ordering::SeqCst);
        let _guard = self.begin_op();

        let (hang, error) = {
            let state = self.state();
            (
                state.faults.discovery_hang,
                state.faults.discovery_error.clone(),
            )
        };
        if hang {
            std::future::pending::<()>().await;
        }

        Self::pause(self.config.discovery_latency).await;

        if let Some(reason) = error {
            return Err(BleError::discovery(reason));
        }

        self.with_peripheral_mut(
            connection,
            GattOperation::Discover,
            AttributeHandle(0),
            |peripheral, _| Ok(peripheral.services.clone()),
        )
    }

    async fn read(
        &self,
        connection: &ConnectionHandle,
        characteristic: AttributeHandle,
    ) -> BleResult<Vec<u8>> {
        let _guard = self
            .gatt_preamble(
                AdapterCall::Read(characteristic),
                connection,
                characteristic,
                GattOperation::Read,
            )
            .await?;

        self.with_peripheral_mut(connection, GattOperation::Read, characteristic, |p, _| {
            let definition = p
                .characteristic_definition(characteristic)
                .ok_or_else(|| invalid_handle(GattOperation::Read, characteristic))?;
            if !definition.properties.read {
                return Err(BleError::operation(
                    GattOperation::Read,
                    characteristic.to_string(),
                    "read not permitted",
                ));
            }
            Ok(p.values.get(&characteristic).cloned().unwrap_or_default())
        })
    }

    async fn write(
        &self,
        connection: &ConnectionHandle,
        characteristic: AttributeHandle,
        value: &[u8],
        mode: WriteMode,
    ) -> BleResult<()> {
        let _guard = self
            .gatt_preamble(
                AdapterCall::Write {
                    handle: characteristic,
                    value: value.to_vec(),
                    mode,
                },
                connection,
                characteristic,
                GattOperation::Write,
            )
            .await?;

        self.with_peripheral_mut(connection, GattOperation::Write, characteristic, |p, _| {
            let definition = p
                .characteristic_definition(characteristic)
                .ok_or_else(|| invalid_handle(GattOperation::Write, characteristic))?;
            if !definition.properties.supports_write(mode) {
                return Err(BleError::operation(
                    GattOperation::Write,
                    characteristic.to_string(),
                    "write not permitted",
                ));
            }
            if p.echo_writes {
                p.values.insert(characteristic, value.to_vec());
            }
            Ok(())
        })
    }

    async fn set_notify(
        &self,
        connection: &ConnectionHandle,
        characteristic: AttributeHandle,
        enabled: bool,
    ) -> BleResult<()> {
        let operation = if enabled {
            GattOperation::Subscribe
        } else {
            GattOperation::Unsubscribe
        };
        let _guard = self
            .gatt_preamble(
                AdapterCall::SetNotify {
                    handle: characteristic,
                    enabled,
                },
                connection,
                characteristic,
                operation,
            )
            .await?;

        self.with_peripheral_mut(connection, operation, characteristic, |p, link| {
            let definition = p
                .characteristic_definition(characteristic)
                .ok_or_else(|| invalid_handle(operation, characteristic))?;
            if !definition.properties.can_subscribe() {
                return Err(BleError::operation(
                    operation,
                    characteristic.to_string(),
                    "notifications not supported",
                ));
            }
            if enabled {
                link.notifying.insert(characteristic);
            } else {
                link.notifying.remove(&characteristic);
            }
            Ok(())
        })
    }

    async fn read_descriptor(
        &self,
        connection: &ConnectionHandle,
        descriptor: AttributeHandle,
    ) -> BleResult<Vec<u8>> {
        let _guard = self
            .gatt_preamble(
                AdapterCall::ReadDescriptor(descriptor),
                connection,
                descriptor,
                GattOperation::ReadDescriptor,
            )
            .await?;

        self.with_peripheral_mut(connection, GattOperation::ReadDescriptor, descriptor, |p, _| {
            if !p.is_descriptor(descriptor) {
                return Err(invalid_handle(GattOperation::ReadDescriptor, descriptor));
            }
            Ok(p.values.get(&descriptor).cloned().unwrap_or_default())
        })
    }

    async fn write_descriptor(
        &self,
        connection: &ConnectionHandle,
        descriptor: AttributeHandle,
        value: &[u8],
    ) -> BleResult<()> {
        let _guard = self
            .gatt_preamble(
                AdapterCall::WriteDescriptor {
                    handle: descriptor,
                    value: value.to_vec(),
                },
                connection,
                descriptor,
                GattOperation::WriteDescriptor,
            )
            .await?;

        self.with_peripheral_mut(
            connection,
            GattOperation::WriteDescriptor,
            descriptor,
            |p, _| {
                if !p.is_descriptor(descriptor) {
                    return Err(invalid_handle(GattOperation::WriteDescriptor, descriptor));
                }
                p.values.insert(descriptor, value.to_vec());
                Ok(())
            },
        )
    }
}
