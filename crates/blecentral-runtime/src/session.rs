//! Session Handle
//!
//! [`Session`] is the caller-facing side of one peripheral connection. Each
//! method sends a request to the session task and awaits its reply, so calls
//! from any number of tasks are serialized in arrival order. Dropping the last
//! clone of the handle shuts the session task down.

use std::sync::Arc;
use std::time::Duration;

use blecentral_core::{
    AuditEntry, BleError, BleResult, CharacteristicSelector, ConnectionState, DescriptorSelector,
    GattTree, NativeAdapter, PeripheralHandle, SessionConfig, WriteMode, ATT_WRITE_OVERHEAD,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::debug;

use crate::actor::{SessionActor, SessionNotice, SessionRequest, SessionSnapshot};
use crate::dispatcher::{NotificationHandler, NotificationStream, Subscription};

const NOTICE_CAPACITY: usize = 64;

/// Connection to one peripheral.
///
/// Cloning is cheap; all clones drive the same session.
#[derive(Clone)]
pub struct Session {
    peripheral: PeripheralHandle,
    requests: mpsc::Sender<SessionRequest>,
    state: watch::Receiver<ConnectionState>,
    notices: broadcast::Sender<SessionNotice>,
}

impl Session {
    /// Create a session for `peripheral` and spawn its task.
    ///
    /// The session starts `Disconnected`; call [`Session::connect`].
    pub fn new(
        adapter: Arc<dyn NativeAdapter>,
        peripheral: PeripheralHandle,
        config: SessionConfig,
    ) -> BleResult<Self> {
        config.validate()?;

        let (request_tx, request_rx) = mpsc::channel(config.request_buffer_size);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (notice_tx, _) = broadcast::channel(NOTICE_CAPACITY);

        let actor = SessionActor::new(
            peripheral.id.clone(),
            adapter,
            config,
            request_rx,
            state_tx,
            notice_tx.clone(),
        );
        tokio::spawn(actor.run());
        debug!(peripheral = %peripheral.id, "Session created");

        Ok(Self {
            peripheral,
            requests: request_tx,
            state: state_rx,
            notices: notice_tx,
        })
    }

    pub fn peripheral(&self) -> &PeripheralHandle {
        &self.peripheral
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Connect and discover services.
    ///
    /// Resolves once the session is `Ready`. A connect or discovery failure
    /// returns the session to `Disconnected` before the error is reported.
    pub async fn connect(&self) -> BleResult<()> {
        self.call(|reply| SessionRequest::Connect { reply }).await
    }

    /// Disconnect, failing every queued command with `Disconnected`.
    ///
    /// Resolves once the session is back in `Disconnected`. A no-op when
    /// already disconnected.
    pub async fn disconnect(&self) -> BleResult<()> {
        self.call(|reply| SessionRequest::Disconnect { reply }).await
    }

    /// The GATT tree of the current connection.
    ///
    /// Waits for an in-progress discovery; never rediscovers a connection
    /// that already has a tree.
    pub async fn discover(&self) -> BleResult<Arc<GattTree>> {
        self.call(|reply| SessionRequest::Discover { reply }).await
    }

    /// Current tree, if the session is ready
    pub async fn services(&self) -> Option<Arc<GattTree>> {
        self.snapshot().await.ok().and_then(|s| s.tree)
    }

    /// Disconnect and release this handle.
    ///
    /// The session task keeps running while other clones are alive and stops
    /// once the last one is dropped.
    pub async fn close(self) -> BleResult<()> {
        let result = self.disconnect().await;
        drop(self);
        match result {
            Err(BleError::Channel { .. }) => Ok(()),
            other => other,
        }
    }

    // ------------------------------------------------------------------------
    // GATT Operations
    // ------------------------------------------------------------------------

    pub async fn read<S: Into<CharacteristicSelector>>(&self, selector: S) -> BleResult<Vec<u8>> {
        self.read_with_timeout(selector, None).await
    }

    /// Read with a deadline overriding the session default
    pub async fn read_with_timeout<S: Into<CharacteristicSelector>>(
        &self,
        selector: S,
        timeout: Option<Duration>,
    ) -> BleResult<Vec<u8>> {
        let selector = selector.into();
        self.call(|reply| SessionRequest::Read {
            selector,
            timeout,
            reply,
        })
        .await
    }

    pub async fn write<S: Into<CharacteristicSelector>>(
        &self,
        selector: S,
        value: &[u8],
        mode: WriteMode,
    ) -> BleResult<()> {
        self.write_with_timeout(selector, value, mode, None).await
    }

    pub async fn write_with_timeout<S: Into<CharacteristicSelector>>(
        &self,
        selector: S,
        value: &[u8],
        mode: WriteMode,
        timeout: Option<Duration>,
    ) -> BleResult<()> {
        let selector = selector.into();
        let value = value.to_vec();
        self.call(|reply| SessionRequest::Write {
            selector,
            value,
            mode,
            timeout,
            reply,
        })
        .await
    }

    pub async fn read_descriptor<S: Into<DescriptorSelector>>(
        &self,
        selector: S,
    ) -> BleResult<Vec<u8>> {
        let selector = selector.into();
        self.call(|reply| SessionRequest::ReadDescriptor {
            selector,
            timeout: None,
            reply,
        })
        .await
    }

    pub async fn write_descriptor<S: Into<DescriptorSelector>>(
        &self,
        selector: S,
        value: &[u8],
    ) -> BleResult<()> {
        let selector = selector.into();
        let value = value.to_vec();
        self.call(|reply| SessionRequest::WriteDescriptor {
            selector,
            value,
            timeout: None,
            reply,
        })
        .await
    }

    /// Last value read or notified for a characteristic in this generation
    pub async fn cached_value<S: Into<CharacteristicSelector>>(
        &self,
        selector: S,
    ) -> BleResult<Option<Vec<u8>>> {
        let selector = selector.into();
        self.call(|reply| SessionRequest::CachedValue { selector, reply })
            .await
    }

    // ------------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------------

    /// Enable notifications and register `handler` for them.
    ///
    /// Handlers run on the session's dispatcher task, in arrival order. With
    /// fan-out disabled a second subscribe replaces the first handler.
    pub async fn subscribe<S, F>(&self, selector: S, handler: F) -> BleResult<Subscription>
    where
        S: Into<CharacteristicSelector>,
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.subscribe_boxed(selector.into(), Box::new(handler))
            .await
    }

    /// Subscribe and receive notifications as a stream
    pub async fn subscribe_stream<S: Into<CharacteristicSelector>>(
        &self,
        selector: S,
    ) -> BleResult<NotificationStream> {
        let (handler, receiver) = NotificationStream::channel();
        let subscription = self.subscribe_boxed(selector.into(), handler).await?;
        Ok(NotificationStream::new(subscription, receiver))
    }

    /// Remove every handler and disable notifications
    pub async fn unsubscribe<S: Into<CharacteristicSelector>>(&self, selector: S) -> BleResult<()> {
        let selector = selector.into();
        self.call(|reply| SessionRequest::Unsubscribe { selector, reply })
            .await
    }

    /// Remove one handler; notifications are disabled when it was the last
    pub async fn remove_handler(&self, subscription: Subscription) -> BleResult<()> {
        self.call(|reply| SessionRequest::RemoveHandler {
            subscription,
            reply,
        })
        .await
    }

    async fn subscribe_boxed(
        &self,
        selector: CharacteristicSelector,
        handler: NotificationHandler,
    ) -> BleResult<Subscription> {
        self.call(|reply| SessionRequest::Subscribe {
            selector,
            handler,
            reply,
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Wait until the session reaches `target`
    pub async fn wait_for_state(&self, target: ConnectionState) -> BleResult<()> {
        let mut watch = self.state.clone();
        watch
            .wait_for(|state| *state == target)
            .await
            .map(|_| ())
            .map_err(|_| BleError::channel_error("session task stopped"))
    }

    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub async fn mtu(&self) -> BleResult<u16> {
        Ok(self.snapshot().await?.mtu)
    }

    /// Largest payload for a write without response at the current MTU
    pub async fn max_write_without_response_size(&self) -> BleResult<usize> {
        let mtu = self.mtu().await?;
        Ok(usize::from(mtu.saturating_sub(ATT_WRITE_OVERHEAD)))
    }

    pub async fn audit_trail(&self) -> BleResult<Vec<AuditEntry>> {
        Ok(self.snapshot().await?.audit_trail)
    }

    pub async fn snapshot(&self) -> BleResult<SessionSnapshot> {
        let (reply, receiver) = oneshot::channel();
        self.send(SessionRequest::Snapshot { reply }).await?;
        receiver
            .await
            .map_err(|_| BleError::channel_error("session task dropped the reply"))
    }

    // ------------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------------

    async fn call<T, F>(&self, build: F) -> BleResult<T>
    where
        F: FnOnce(oneshot::Sender<BleResult<T>>) -> SessionRequest,
    {
        let (reply, receiver) = oneshot::channel();
        self.send(build(reply)).await?;
        receiver
            .await
            .map_err(|_| BleError::channel_error("session task dropped the reply"))?
    }

    async fn send(&self, request: SessionRequest) -> BleResult<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| BleError::channel_error("session task stopped"))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peripheral", &self.peripheral.id)
            .field("state", &self.state())
            .finish()
    }
}
