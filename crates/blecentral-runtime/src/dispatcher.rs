//! Notification Dispatcher
//!
//! Runs registered notification handlers on a dedicated thread.
//! The session task hands over each delivery through an unbounded channel and
//! moves on, so a slow handler only delays later notifications and never the
//! completion of queued commands, even on a current-thread runtime.
//!
//! The dispatch thread exits once the session task drops its sender.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use blecentral_core::{AttributeHandle, CharacteristicRef, SubscriptionId};
use futures::Stream;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tracing::{error, trace};

// ----------------------------------------------------------------------------
// Handlers
// ----------------------------------------------------------------------------

/// Callback invoked with each notification payload
pub type NotificationHandler = Box<dyn Fn(&[u8]) + Send + Sync + 'static>;

/// A registered handler plus its liveness flag.
///
/// Deliveries already queued when the handler is removed are skipped.
pub(crate) struct HandlerSlot {
    handler: NotificationHandler,
    active: AtomicBool,
}

impl HandlerSlot {
    pub(crate) fn new(handler: NotificationHandler) -> Arc<Self> {
        Arc::new(Self {
            handler,
            active: AtomicBool::new(true),
        })
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Handle to one registration returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub characteristic: CharacteristicRef,
}

// ----------------------------------------------------------------------------
// Dispatcher Thread
// ----------------------------------------------------------------------------

struct Delivery {
    handle: AttributeHandle,
    value: Arc<[u8]>,
    slots: SmallVec<[Arc<HandlerSlot>; 1]>,
}

pub(crate) struct NotificationDispatcher {
    sender: mpsc::UnboundedSender<Delivery>,
}

impl NotificationDispatcher {
    pub(crate) fn spawn() -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Delivery>();
        // Handlers are synchronous and may block, so they stay off the runtime
        let spawned = std::thread::Builder::new()
            .name("blecentral-notify".into())
            .spawn(move || {
                while let Some(delivery) = receiver.blocking_recv() {
                    for slot in delivery.slots.iter().filter(|s| s.is_active()) {
                        let outcome =
                            catch_unwind(AssertUnwindSafe(|| (slot.handler)(&delivery.value[..])));
                        if outcome.is_err() {
                            error!("Notification handler for {} panicked", delivery.handle);
                        }
                    }
                    trace!(
                        handle = %delivery.handle,
                        len = delivery.value.len(),
                        "Notification delivered"
                    );
                }
                trace!("Notification dispatcher stopped");
            });
        if let Err(e) = spawned {
            error!("Failed to start notification dispatcher: {}", e);
        }
        Self { sender }
    }

    /// Queue a notification for the given handlers, in arrival order
    pub(crate) fn deliver<'a, I>(&self, handle: AttributeHandle, value: &[u8], slots: I)
    where
        I: IntoIterator<Item = &'a Arc<HandlerSlot>>,
    {
        let slots: SmallVec<[Arc<HandlerSlot>; 1]> = slots.into_iter().cloned().collect();
        if slots.is_empty() {
            return;
        }
        let delivery = Delivery {
            handle,
            value: Arc::from(value),
            slots,
        };
        if self.sender.send(delivery).is_err() {
            error!("Notification dispatcher has stopped; dropping value for {}", handle);
        }
    }
}

// ----------------------------------------------------------------------------
// Stream Adapter
// ----------------------------------------------------------------------------

/// Notifications of one characteristic as a `Stream`.
///
/// Ends when the subscription is removed or the session tears down.
pub struct NotificationStream {
    subscription: Subscription,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl NotificationStream {
    pub(crate) fn channel() -> (NotificationHandler, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handler: NotificationHandler = Box::new(move |value: &[u8]| {
            let _ = sender.send(value.to_vec());
        });
        (handler, receiver)
    }

    pub(crate) fn new(
        subscription: Subscription,
        receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> Self {
        Self {
            subscription,
            receiver,
        }
    }

    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }
}

impl Stream for NotificationStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}
