//! Session Task
//!
//! One task per session owns the state machine, command queue, attribute
//! cache and subscription registry. Every input reaches it through one of two
//! channels: requests from the [`Session`](crate::Session) handle, and a single
//! ordered inbound channel carrying backend events, command completions,
//! deadlines and teardown results. The task never awaits backend I/O itself;
//! each native call runs on a spawned task that reports back through the
//! inbound channel, tagged with the generation or command id it belongs to.
//! Inputs whose tag no longer matches are discarded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use blecentral_core::{
    AttributeCache, AttributeHandle, AuditEntry, BackendEvent, BackendEventReceiver, BleError,
    BleResult, CharacteristicRef, CharacteristicSelector, CommandId, CommandKind, CommandQueue,
    Completion, ConnectionHandle, ConnectionState, DescriptorRef, DescriptorSelector, GattOperation,
    GattTree, NativeAdapter, NativeConnection, PeripheralId, QueuedCommand, Registration,
    ServiceDefinition, SessionConfig, SessionEvent, SessionMachine, SubscriptionRegistry,
    Transition, WriteMode, DEFAULT_ATT_MTU,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::dispatcher::{HandlerSlot, NotificationDispatcher, NotificationHandler, Subscription};

pub(crate) type Reply<T> = oneshot::Sender<BleResult<T>>;

// ----------------------------------------------------------------------------
// Requests and Notices
// ----------------------------------------------------------------------------

/// Requests sent from the session handle
pub(crate) enum SessionRequest {
    Connect {
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    Discover {
        reply: Reply<Arc<GattTree>>,
    },
    Read {
        selector: CharacteristicSelector,
        timeout: Option<Duration>,
        reply: Reply<Vec<u8>>,
    },
    Write {
        selector: CharacteristicSelector,
        value: Vec<u8>,
        mode: WriteMode,
        timeout: Option<Duration>,
        reply: Reply<()>,
    },
    Subscribe {
        selector: CharacteristicSelector,
        handler: NotificationHandler,
        reply: Reply<Subscription>,
    },
    Unsubscribe {
        selector: CharacteristicSelector,
        reply: Reply<()>,
    },
    RemoveHandler {
        subscription: Subscription,
        reply: Reply<()>,
    },
    ReadDescriptor {
        selector: DescriptorSelector,
        timeout: Option<Duration>,
        reply: Reply<Vec<u8>>,
    },
    WriteDescriptor {
        selector: DescriptorSelector,
        value: Vec<u8>,
        timeout: Option<Duration>,
        reply: Reply<()>,
    },
    CachedValue {
        selector: CharacteristicSelector,
        reply: Reply<Option<Vec<u8>>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
}

/// Broadcast notifications about a session's lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        generation: u64,
    },
    /// Unsolicited disconnection reported by the backend
    Disconnected { reason: String },
    MtuChanged { mtu: u16 },
    /// The backend broke the adapter contract; the session is unusable
    ContractViolation { detail: String },
}

/// Point-in-time view of a session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: ConnectionState,
    pub generation: u64,
    pub mtu: u16,
    pub tree: Option<Arc<GattTree>>,
    pub queued_commands: usize,
    pub subscriptions: usize,
    pub audit_trail: Vec<AuditEntry>,
}

// ----------------------------------------------------------------------------
// Internal Messages
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Operation {
    Discover,
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

impl Operation {
    fn kind(&self) -> CommandKind {
        match self {
            Operation::Discover => CommandKind::Discover,
            Operation::Read(_) => CommandKind::Read,
            Operation::Write {
                mode: WriteMode::WithResponse,
                ..
            } => CommandKind::Write,
            Operation::Write {
                mode: WriteMode::WithoutResponse,
                ..
            } => CommandKind::WriteWithoutResponse,
            Operation::SetNotify { enabled: true, .. } => CommandKind::Subscribe,
            Operation::SetNotify { enabled: false, .. } => CommandKind::Unsubscribe,
            Operation::ReadDescriptor(_) => CommandKind::ReadDescriptor,
            Operation::WriteDescriptor { .. } => CommandKind::WriteDescriptor,
        }
    }

    fn target(&self) -> Option<AttributeHandle> {
        match self {
            Operation::Discover => None,
            Operation::Read(handle) | Operation::ReadDescriptor(handle) => Some(*handle),
            Operation::Write { handle, .. }
            | Operation::SetNotify { handle, .. }
            | Operation::WriteDescriptor { handle, .. } => Some(*handle),
        }
    }
}

enum Output {
    Value(Vec<u8>),
    Done,
    Services(Vec<ServiceDefinition>),
}

/// Where a command's result goes
enum Responder {
    Value(Reply<Vec<u8>>),
    Unit(Reply<()>),
    Subscribe {
        reply: Reply<Subscription>,
        characteristic: CharacteristicRef,
        slot: Arc<HandlerSlot>,
    },
    Discovery,
}

impl Responder {
    fn fail(self, err: BleError) {
        match self {
            Responder::Value(reply) => {
                let _ = reply.send(Err(err));
            }
            Responder::Unit(reply) => {
                let _ = reply.send(Err(err));
            }
            Responder::Subscribe { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Responder::Discovery => {}
        }
    }
}

struct PendingCommand {
    op: Operation,
    responder: Responder,
}

/// Inputs funnelled into the session task
enum Inbound {
    Backend {
        generation: u64,
        event: Option<BackendEvent>,
    },
    ConnectFinished {
        generation: u64,
        result: BleResult<NativeConnection>,
    },
    ConnectDeadline {
        generation: u64,
    },
    CommandFinished {
        id: CommandId,
        outcome: BleResult<Output>,
    },
    CommandDeadline {
        id: CommandId,
    },
    TeardownFinished {
        generation: u64,
    },
}

/// Whether teardown waits for a native disconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NativeTeardown {
    Await,
    Skip,
}

// ----------------------------------------------------------------------------
// Session Actor
// ----------------------------------------------------------------------------

pub(crate) struct SessionActor {
    peripheral: PeripheralId,
    adapter: Arc<dyn NativeAdapter>,
    config: SessionConfig,
    machine: SessionMachine,
    queue: CommandQueue<PendingCommand>,
    cache: Option<AttributeCache>,
    subscriptions: SubscriptionRegistry<Arc<HandlerSlot>>,
    /// Native enables queued or in flight, per characteristic
    pending_enables: HashMap<AttributeHandle, Vec<CommandId>>,
    /// Enables overtaken by an `unsubscribe`; they never register a handler
    cancelled_enables: HashSet<CommandId>,
    dispatcher: NotificationDispatcher,
    connection: Option<ConnectionHandle>,
    mtu: u16,
    forwarder: Option<JoinHandle<()>>,
    command_deadline: Option<JoinHandle<()>>,
    connect_deadline: Option<JoinHandle<()>>,
    connect_reply: Option<Reply<()>>,
    discover_waiters: Vec<Reply<Arc<GattTree>>>,
    /// Replies resolved once the session is back in `Disconnected`
    settle_waiters: Vec<(Reply<()>, BleResult<()>)>,
    poisoned: Option<String>,
    requests: mpsc::Receiver<SessionRequest>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    state_tx: watch::Sender<ConnectionState>,
    notices: broadcast::Sender<SessionNotice>,
}

impl SessionActor {
    pub(crate) fn new(
        peripheral: PeripheralId,
        adapter: Arc<dyn NativeAdapter>,
        config: SessionConfig,
        requests: mpsc::Receiver<SessionRequest>,
        state_tx: watch::Sender<ConnectionState>,
        notices: broadcast::Sender<SessionNotice>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            peripheral,
            adapter,
            machine: SessionMachine::new(config.audit_capacity),
            queue: CommandQueue::new(0),
            cache: None,
            subscriptions: SubscriptionRegistry::new(config.allow_fan_out),
            pending_enables: HashMap::new(),
            cancelled_enables: HashSet::new(),
            dispatcher: NotificationDispatcher::spawn(),
            connection: None,
            mtu: DEFAULT_ATT_MTU,
            forwarder: None,
            command_deadline: None,
            connect_deadline: None,
            connect_reply: None,
            discover_waiters: Vec::new(),
            settle_waiters: Vec::new(),
            poisoned: None,
            requests,
            inbound_tx,
            inbound_rx,
            state_tx,
            notices,
            config,
        }
    }

    /// Run until the session handle is dropped
    pub(crate) async fn run(mut self) {
        debug!(peripheral = %self.peripheral, "Session task starting");

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => {
                        debug!(peripheral = %self.peripheral, "Session handle dropped, shutting down");
                        break;
                    }
                },
                Some(inbound) = self.inbound_rx.recv() => self.handle_inbound(inbound),
            }
        }

        self.shutdown();
        debug!(peripheral = %self.peripheral, "Session task stopped");
    }

    // ------------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------------

    fn handle_request(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Connect { reply } => self.begin_connect(reply),
            SessionRequest::Disconnect { reply } => self.request_disconnect(reply),
            SessionRequest::Discover { reply } => self.discover(reply),
            SessionRequest::Read {
                selector,
                timeout,
                reply,
            } => match self.resolve_characteristic(&selector) {
                Ok(c) => {
                    self.enqueue(Operation::Read(c.handle), timeout, Responder::Value(reply));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            SessionRequest::Write {
                selector,
                value,
                mode,
                timeout,
                reply,
            } => match self.resolve_characteristic(&selector) {
                Ok(c) => {
                    self.enqueue(
                        Operation::Write {
                            handle: c.handle,
                            value,
                            mode,
                        },
                        timeout,
                        Responder::Unit(reply),
                    );
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            SessionRequest::Subscribe {
                selector,
                handler,
                reply,
            } => self.subscribe(selector, handler, reply),
            SessionRequest::Unsubscribe { selector, reply } => self.unsubscribe(selector, reply),
            SessionRequest::RemoveHandler {
                subscription,
                reply,
            } => self.remove_handler(subscription, reply),
            SessionRequest::ReadDescriptor {
                selector,
                timeout,
                reply,
            } => match self.resolve_descriptor(&selector) {
                Ok(d) => {
                    self.enqueue(
                        Operation::ReadDescriptor(d.handle),
                        timeout,
                        Responder::Value(reply),
                    );
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            SessionRequest::WriteDescriptor {
                selector,
                value,
                timeout,
                reply,
            } => match self.resolve_descriptor(&selector) {
                Ok(d) => {
                    self.enqueue(
                        Operation::WriteDescriptor {
                            handle: d.handle,
                            value,
                        },
                        timeout,
                        Responder::Unit(reply),
                    );
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            SessionRequest::CachedValue { selector, reply } => {
                let result = self.resolve_characteristic(&selector).map(|c| {
                    self.cache
                        .as_ref()
                        .and_then(|cache| cache.value(c.handle))
                        .map(<[u8]>::to_vec)
                });
                let _ = reply.send(result);
            }
            SessionRequest::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn begin_connect(&mut self, reply: Reply<()>) {
        if let Some(detail) = &self.poisoned {
            let _ = reply.send(Err(BleError::contract(detail.clone())));
            return;
        }

        let state = self.machine.state();
        if state != ConnectionState::Disconnected {
            let _ = reply.send(Err(BleError::AlreadyConnecting { state }));
            return;
        }

        if let Err(e) = self.transition(SessionEvent::ConnectRequested) {
            let _ = reply.send(Err(e));
            return;
        }

        let generation = self.machine.generation();
        self.queue.reset(generation);
        self.mtu = DEFAULT_ATT_MTU;
        self.connect_reply = Some(reply);
        info!(peripheral = %self.peripheral, generation, "Connecting");

        let adapter = Arc::clone(&self.adapter);
        let peripheral = self.peripheral.clone();
        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            let result = adapter.connect(&peripheral).await;
            let _ = inbound.send(Inbound::ConnectFinished { generation, result });
        });

        let inbound = self.inbound_tx.clone();
        let deadline = self.config.connect_timeout;
        self.connect_deadline = Some(tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let _ = inbound.send(Inbound::ConnectDeadline { generation });
        }));
    }

    fn request_disconnect(&mut self, reply: Reply<()>) {
        match self.machine.state() {
            ConnectionState::Disconnected => {
                let _ = reply.send(Ok(()));
            }
            ConnectionState::Disconnecting | ConnectionState::Error => {
                self.settle_waiters.push((reply, Ok(())));
            }
            ConnectionState::Connecting
            | ConnectionState::ServiceDiscovery
            | ConnectionState::Ready => {
                info!(peripheral = %self.peripheral, "Disconnect requested");
                self.settle_waiters.push((reply, Ok(())));
                self.teardown(
                    SessionEvent::DisconnectRequested,
                    BleError::disconnected("disconnect requested"),
                    NativeTeardown::Await,
                );
            }
        }
    }

    fn discover(&mut self, reply: Reply<Arc<GattTree>>) {
        match (self.machine.state(), &self.cache) {
            (ConnectionState::Ready, Some(cache)) => {
                trace!(peripheral = %self.peripheral, "Discovery already complete");
                let _ = reply.send(Ok(Arc::clone(cache.tree())));
            }
            (ConnectionState::Connecting | ConnectionState::ServiceDiscovery, _) => {
                self.discover_waiters.push(reply);
            }
            (state, _) => {
                let err = state
                    .command_rejection()
                    .unwrap_or_else(|| BleError::disconnected("no GATT tree"));
                let _ = reply.send(Err(err));
            }
        }
    }

    fn subscribe(
        &mut self,
        selector: CharacteristicSelector,
        handler: NotificationHandler,
        reply: Reply<Subscription>,
    ) {
        let characteristic = match self.resolve_characteristic(&selector) {
            Ok(c) => c,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };
        let slot = HandlerSlot::new(handler);

        if self.subscriptions.is_subscribed(characteristic.handle) {
            // Native notifications are already on for this characteristic
            let (id, registration) = self.subscriptions.register(characteristic.handle, slot);
            if let Registration::Replaced(previous) = registration {
                previous.deactivate();
                debug!(handle = %characteristic.handle, "Replaced notification handler");
            }
            let _ = reply.send(Ok(Subscription { id, characteristic }));
            return;
        }

        let id = self.enqueue(
            Operation::SetNotify {
                handle: characteristic.handle,
                enabled: true,
            },
            None,
            Responder::Subscribe {
                reply,
                characteristic,
                slot,
            },
        );
        self.pending_enables
            .entry(characteristic.handle)
            .or_default()
            .push(id);
    }

    fn unsubscribe(&mut self, selector: CharacteristicSelector, reply: Reply<()>) {
        let characteristic = match self.resolve_characteristic(&selector) {
            Ok(c) => c,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let removed = self.subscriptions.remove_all(characteristic.handle);
        let overtaken = self
            .pending_enables
            .remove(&characteristic.handle)
            .unwrap_or_default();
        if removed.is_empty() && overtaken.is_empty() {
            let _ = reply.send(Ok(()));
            return;
        }
        for (_, slot) in removed {
            slot.deactivate();
        }
        if !overtaken.is_empty() {
            debug!(
                handle = %characteristic.handle,
                count = overtaken.len(),
                "Unsubscribe overtakes pending enable"
            );
            self.cancelled_enables.extend(overtaken);
        }

        // Queued behind any pending enable, so the link ends up disabled
        self.enqueue(
            Operation::SetNotify {
                handle: characteristic.handle,
                enabled: false,
            },
            None,
            Responder::Unit(reply),
        );
    }

    fn remove_handler(&mut self, subscription: Subscription, reply: Reply<()>) {
        if subscription.characteristic.generation != self.machine.generation()
            || !self.machine.state().is_ready()
        {
            // Subscriptions die with the generation that created them
            let _ = reply.send(Ok(()));
            return;
        }

        let handle = subscription.characteristic.handle;
        match self.subscriptions.remove(handle, subscription.id) {
            Some((slot, now_empty)) => {
                slot.deactivate();
                if now_empty {
                    self.enqueue(
                        Operation::SetNotify {
                            handle,
                            enabled: false,
                        },
                        None,
                        Responder::Unit(reply),
                    );
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            None => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------------

    fn command_gate(&self) -> BleResult<&AttributeCache> {
        if let Some(detail) = &self.poisoned {
            return Err(BleError::contract(detail.clone()));
        }
        if let Some(err) = self.machine.state().command_rejection() {
            return Err(err);
        }
        self.cache
            .as_ref()
            .ok_or_else(|| BleError::disconnected("no GATT tree"))
    }

    fn resolve_characteristic(
        &self,
        selector: &CharacteristicSelector,
    ) -> BleResult<CharacteristicRef> {
        let cache = self.command_gate()?;
        cache
            .tree()
            .resolve(selector, self.config.duplicate_uuid_policy)
            .map(|c| c.reference())
    }

    fn resolve_descriptor(&self, selector: &DescriptorSelector) -> BleResult<DescriptorRef> {
        let cache = self.command_gate()?;
        cache
            .tree()
            .resolve_descriptor(selector, self.config.duplicate_uuid_policy)
            .map(|d| d.reference())
    }

    // ------------------------------------------------------------------------
    // Command Queue
    // ------------------------------------------------------------------------

    fn enqueue(
        &mut self,
        op: Operation,
        timeout: Option<Duration>,
        responder: Responder,
    ) -> CommandId {
        let timeout = timeout.or(self.config.default_command_timeout);
        let kind = op.kind();
        let id = self
            .queue
            .enqueue(kind, timeout, PendingCommand { op, responder });
        trace!(command = %id, %kind, queued = self.queue.len(), "Command queued");
        self.pump();
        id
    }

    /// Dispatch the next command if the link is idle
    fn pump(&mut self) {
        let Some(connection) = self.connection.clone() else {
            return;
        };
        let Some(command) = self.queue.start_next() else {
            return;
        };
        let id = command.id;
        let kind = command.kind;
        let timeout = command.timeout;
        let op = command.payload.op.clone();

        debug!(peripheral = %self.peripheral, command = %id, %kind, "Dispatching command");

        let adapter = Arc::clone(&self.adapter);
        let inbound = self.inbound_tx.clone();
        tokio::spawn(async move {
            let outcome = execute(adapter.as_ref(), &connection, op).await;
            let _ = inbound.send(Inbound::CommandFinished { id, outcome });
        });

        self.command_deadline = timeout.map(|duration| {
            let inbound = self.inbound_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                let _ = inbound.send(Inbound::CommandDeadline { id });
            })
        });
    }

    fn command_finished(&mut self, id: CommandId, outcome: BleResult<Output>) {
        match self.queue.complete(id) {
            Completion::Resolved(command) => {
                if let Some(deadline) = self.command_deadline.take() {
                    deadline.abort();
                }
                self.resolve(command, outcome);
                self.pump();
            }
            Completion::Stale => {
                trace!(command = %id, "Ignoring completion for retired command");
            }
            Completion::Unknown => {
                self.contract_violation(format!("completion for unknown command {}", id));
            }
        }
    }

    fn command_expired(&mut self, id: CommandId) {
        let Some(command) = self.queue.expire(id) else {
            trace!(command = %id, "Deadline fired after completion");
            return;
        };
        self.command_deadline = None;

        let duration = command.timeout.unwrap_or_default();
        warn!(
            peripheral = %self.peripheral,
            command = %id,
            kind = %command.kind,
            "Command timed out after {:?}",
            duration
        );
        let err = BleError::timeout(command.kind.to_string(), duration);
        self.resolve(command, Err(err));
        self.pump();
    }

    fn resolve(&mut self, command: QueuedCommand<PendingCommand>, outcome: BleResult<Output>) {
        let QueuedCommand {
            id, kind, payload, ..
        } = command;
        let PendingCommand { op, responder } = payload;

        if let Err(e) = &outcome {
            debug!(command = %id, %kind, "Command failed: {}", e);
        }

        match responder {
            Responder::Value(reply) => {
                let result = match outcome {
                    Ok(Output::Value(value)) => {
                        if let (Some(cache), Some(handle)) = (self.cache.as_mut(), op.target()) {
                            cache.record_value(handle, &value);
                        }
                        Ok(value)
                    }
                    Ok(_) => Err(unexpected_output(kind)),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Responder::Unit(reply) => {
                let result = match outcome {
                    Ok(Output::Done) => Ok(()),
                    Ok(_) => Err(unexpected_output(kind)),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Responder::Subscribe {
                reply,
                characteristic,
                slot,
            } => {
                self.forget_enable(characteristic.handle, id);
                let cancelled = self.cancelled_enables.remove(&id);
                let result = match outcome {
                    Ok(Output::Done) if cancelled => {
                        slot.deactivate();
                        debug!(handle = %characteristic.handle, command = %id, "Enable cancelled by unsubscribe");
                        Err(BleError::operation(
                            GattOperation::Subscribe,
                            characteristic.handle.to_string(),
                            "cancelled by unsubscribe",
                        ))
                    }
                    Ok(Output::Done) => {
                        let (sub_id, registration) =
                            self.subscriptions.register(characteristic.handle, slot);
                        if let Registration::Replaced(previous) = registration {
                            previous.deactivate();
                        }
                        debug!(handle = %characteristic.handle, subscription = %sub_id, "Notifications enabled");
                        Ok(Subscription {
                            id: sub_id,
                            characteristic,
                        })
                    }
                    Ok(_) => Err(unexpected_output(kind)),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Responder::Discovery => self.discovery_finished(outcome),
        }
    }

    fn forget_enable(&mut self, handle: AttributeHandle, id: CommandId) {
        if let Some(ids) = self.pending_enables.get_mut(&handle) {
            ids.retain(|pending| *pending != id);
            if ids.is_empty() {
                self.pending_enables.remove(&handle);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Backend { generation, event } => {
                if generation != self.machine.generation() {
                    trace!(generation, "Ignoring backend event from earlier generation");
                    return;
                }
                match event {
                    Some(event) => self.handle_backend_event(event),
                    None if self.machine.state().is_active() => {
                        self.link_lost("backend event channel closed".to_string());
                    }
                    None => {}
                }
            }
            Inbound::ConnectFinished { generation, result } => {
                self.connect_finished(generation, result)
            }
            Inbound::ConnectDeadline { generation } => {
                if generation == self.machine.generation()
                    && self.machine.state() == ConnectionState::Connecting
                {
                    warn!(peripheral = %self.peripheral, "Connect timed out");
                    self.fail_connect(BleError::timeout("connect", self.config.connect_timeout));
                }
            }
            Inbound::CommandFinished { id, outcome } => self.command_finished(id, outcome),
            Inbound::CommandDeadline { id } => self.command_expired(id),
            Inbound::TeardownFinished { generation } => {
                if generation == self.machine.generation() {
                    self.settle();
                }
            }
        }
    }

    fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Disconnected { reason } => {
                if self.machine.state().is_active() {
                    self.link_lost(reason);
                }
            }
            BackendEvent::ValueChanged { handle, value } => {
                let Some(cache) = self.cache.as_mut() else {
                    trace!(%handle, "Value change before discovery completed");
                    return;
                };
                if !cache.record_value(handle, &value) {
                    warn!(peripheral = %self.peripheral, %handle, "Value change for unknown handle ignored");
                    return;
                }
                self.dispatcher
                    .deliver(handle, &value, self.subscriptions.handlers(handle));
            }
            BackendEvent::MtuChanged { mtu } => {
                debug!(peripheral = %self.peripheral, mtu, "MTU changed");
                self.mtu = mtu;
                let _ = self.notices.send(SessionNotice::MtuChanged { mtu });
            }
        }
    }

    fn connect_finished(&mut self, generation: u64, result: BleResult<NativeConnection>) {
        if generation != self.machine.generation()
            || self.machine.state() != ConnectionState::Connecting
        {
            if let Ok(orphan) = result {
                warn!(
                    peripheral = %self.peripheral,
                    "Connect completed after the attempt was abandoned; disconnecting"
                );
                let adapter = Arc::clone(&self.adapter);
                tokio::spawn(async move {
                    if let Err(e) = adapter.disconnect(&orphan.handle).await {
                        warn!("Failed to release abandoned connection: {}", e);
                    }
                });
            }
            return;
        }

        if let Some(deadline) = self.connect_deadline.take() {
            deadline.abort();
        }

        match result {
            Ok(native) => {
                if let Some(mtu) = native.mtu {
                    self.mtu = mtu;
                }
                self.forwarder = Some(spawn_forwarder(
                    generation,
                    native.events,
                    self.inbound_tx.clone(),
                ));
                self.connection = Some(native.handle);

                if self.transition(SessionEvent::LinkEstablished).is_err() {
                    return;
                }
                info!(peripheral = %self.peripheral, generation, "Link established, discovering services");
                let discovery_timeout = Some(self.config.discovery_timeout);
                self.enqueue(Operation::Discover, discovery_timeout, Responder::Discovery);
            }
            Err(e) => {
                warn!(peripheral = %self.peripheral, "Connect failed: {}", e);
                self.fail_connect(e);
            }
        }
    }

    fn fail_connect(&mut self, err: BleError) {
        self.teardown(
            SessionEvent::ConnectFailed {
                reason: err.to_string(),
            },
            err,
            NativeTeardown::Await,
        );
    }

    fn discovery_finished(&mut self, outcome: BleResult<Output>) {
        if self.machine.state() != ConnectionState::ServiceDiscovery {
            return;
        }
        let generation = self.machine.generation();

        let built = outcome.and_then(|output| match output {
            Output::Services(definitions) => GattTree::build(generation, definitions),
            _ => Err(unexpected_output(CommandKind::Discover)),
        });

        match built {
            Ok(tree) => {
                let services = tree.services().len();
                let characteristics = tree.characteristic_count();
                let cache = AttributeCache::new(tree);
                let tree = Arc::clone(cache.tree());
                self.cache = Some(cache);

                if self.transition(SessionEvent::DiscoveryComplete).is_err() {
                    return;
                }
                info!(
                    peripheral = %self.peripheral,
                    generation,
                    services,
                    characteristics,
                    "Session ready"
                );

                if let Some(reply) = self.connect_reply.take() {
                    let _ = reply.send(Ok(()));
                }
                for waiter in self.discover_waiters.drain(..) {
                    let _ = waiter.send(Ok(Arc::clone(&tree)));
                }
            }
            Err(e) => {
                let err = match e {
                    BleError::Discovery { .. }
                    | BleError::Timeout { .. }
                    | BleError::Disconnected { .. }
                    | BleError::AdapterContract { .. } => e,
                    other => BleError::discovery(other.to_string()),
                };
                warn!(peripheral = %self.peripheral, "Service discovery failed: {}", err);
                self.teardown(
                    SessionEvent::DiscoveryFailed {
                        reason: err.to_string(),
                    },
                    err,
                    NativeTeardown::Await,
                );
            }
        }
    }

    fn link_lost(&mut self, reason: String) {
        info!(peripheral = %self.peripheral, %reason, "Link lost");
        let _ = self.notices.send(SessionNotice::Disconnected {
            reason: reason.clone(),
        });
        self.teardown(
            SessionEvent::LinkLost {
                reason: reason.clone(),
            },
            BleError::disconnected(reason),
            NativeTeardown::Skip,
        );
    }

    fn contract_violation(&mut self, detail: String) {
        error!(peripheral = %self.peripheral, %detail, "Adapter contract violation");
        self.poisoned = Some(detail.clone());
        let _ = self.notices.send(SessionNotice::ContractViolation {
            detail: detail.clone(),
        });
        if self.machine.state().is_active() {
            self.teardown(
                SessionEvent::DisconnectRequested,
                BleError::contract(detail),
                NativeTeardown::Await,
            );
        }
    }

    /// Leave the current generation.
    ///
    /// `event` moves the machine to `Disconnecting` or `Error`, which starts a
    /// new generation. Every outstanding command and waiter resolves with
    /// `error`; the tree and subscriptions are dropped. The machine reaches
    /// `Disconnected` immediately, or once the native disconnect returns.
    fn teardown(&mut self, event: SessionEvent, error: BleError, native: NativeTeardown) {
        if self.transition(event).is_err() {
            return;
        }
        let generation = self.machine.generation();

        if let Some(deadline) = self.command_deadline.take() {
            deadline.abort();
        }
        if let Some(deadline) = self.connect_deadline.take() {
            deadline.abort();
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }

        let drained = self.queue.reset(generation);
        if !drained.is_empty() {
            debug!(
                peripheral = %self.peripheral,
                count = drained.len(),
                "Failing outstanding commands"
            );
        }
        for command in drained {
            command.payload.responder.fail(error.clone());
        }
        for waiter in self.discover_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        if let Some(reply) = self.connect_reply.take() {
            self.settle_waiters.push((reply, Err(error.clone())));
        }

        self.cache = None;
        self.pending_enables.clear();
        self.cancelled_enables.clear();
        for slot in self.subscriptions.clear() {
            slot.deactivate();
        }
        self.mtu = DEFAULT_ATT_MTU;

        match (self.connection.take(), native) {
            (Some(connection), NativeTeardown::Await) => {
                let adapter = Arc::clone(&self.adapter);
                let inbound = self.inbound_tx.clone();
                let limit = self.config.connect_timeout;
                tokio::spawn(async move {
                    match tokio::time::timeout(limit, adapter.disconnect(&connection)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Native disconnect of {} failed: {}", connection, e),
                        Err(_) => warn!("Native disconnect of {} timed out", connection),
                    }
                    let _ = inbound.send(Inbound::TeardownFinished { generation });
                });
            }
            _ => self.settle(),
        }
    }

    /// Complete a teardown and resolve everyone waiting for `Disconnected`
    fn settle(&mut self) {
        let event = match self.machine.state() {
            ConnectionState::Disconnecting => SessionEvent::TeardownComplete,
            ConnectionState::Error => SessionEvent::CleanupComplete,
            _ => return,
        };
        if self.transition(event).is_err() {
            return;
        }
        info!(peripheral = %self.peripheral, "Session disconnected");
        for (reply, result) in self.settle_waiters.drain(..) {
            let _ = reply.send(result);
        }
    }

    fn shutdown(&mut self) {
        if let Some(connection) = self.connection.take() {
            let adapter = Arc::clone(&self.adapter);
            tokio::spawn(async move {
                if let Err(e) = adapter.disconnect(&connection).await {
                    warn!("Failed to disconnect {} on shutdown: {}", connection, e);
                }
            });
        }
        if self.machine.state().is_active() {
            self.teardown(
                SessionEvent::DisconnectRequested,
                BleError::disconnected("session closed"),
                NativeTeardown::Skip,
            );
        }
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn transition(&mut self, event: SessionEvent) -> BleResult<Transition> {
        match self.machine.apply(event) {
            Ok(t) => {
                debug!(
                    peripheral = %self.peripheral,
                    from = %t.from,
                    to = %t.to,
                    generation = t.generation,
                    "Session state transition"
                );
                self.state_tx.send_replace(t.to);
                let _ = self.notices.send(SessionNotice::StateChanged {
                    from: t.from,
                    to: t.to,
                    generation: t.generation,
                });
                Ok(t)
            }
            Err(e) => {
                error!(peripheral = %self.peripheral, "Rejected state transition: {}", e);
                Err(e.into())
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.machine.state(),
            generation: self.machine.generation(),
            mtu: self.mtu,
            tree: self.cache.as_ref().map(|c| Arc::clone(c.tree())),
            queued_commands: self.queue.len(),
            subscriptions: self.subscriptions.len(),
            audit_trail: self.machine.audit_trail().cloned().collect(),
        }
    }
}

fn unexpected_output(kind: CommandKind) -> BleError {
    BleError::contract(format!("backend returned the wrong result type for {}", kind))
}

fn spawn_forwarder(
    generation: u64,
    mut events: BackendEventReceiver,
    inbound: mpsc::UnboundedSender<Inbound>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let message = Inbound::Backend {
                generation,
                event: Some(event),
            };
            if inbound.send(message).is_err() {
                return;
            }
        }
        let _ = inbound.send(Inbound::Backend {
            generation,
            event: None,
        });
    })
}

async fn execute(
    adapter: &dyn NativeAdapter,
    connection: &ConnectionHandle,
    op: Operation,
) -> BleResult<Output> {
    match op {
        Operation::Discover => adapter
            .discover_services(connection)
            .await
            .map(Output::Services),
        Operation::Read(handle) => adapter.read(connection, handle).await.map(Output::Value),
        Operation::Write {
            handle,
            value,
            mode,
        } => adapter
            .write(connection, handle, &value, mode)
            .await
            .map(|_| Output::Done),
        Operation::SetNotify { handle, enabled } => adapter
            .set_notify(connection, handle, enabled)
            .await
            .map(|_| Output::Done),
        Operation::ReadDescriptor(handle) => adapter
            .read_descriptor(connection, handle)
            .await
            .map(Output::Value),
        Operation::WriteDescriptor { handle, value } => adapter
            .write_descriptor(connection, handle, &value)
            .await
            .map(|_| Output::Done),
    }
}
