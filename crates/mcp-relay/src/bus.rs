//! In-process publish/subscribe for everything the child process emits.
//!
//! One bus lives for the whole bridge, across child restarts. Delivery is
//! synchronous and in publish order. Callbacks run outside the subscriber lock,
//! so a callback may subscribe or unsubscribe (itself included) freely.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use crate::bridge::protocol::RpcMessage;

/// Something published on the bus.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A message decoded from the child's stdout.
    Message(RpcMessage),
    /// The child process is gone and its stdout has drained. `code` is `None`
    /// when it was killed by a signal (including `stop()`).
    ChildExited { code: Option<i32> },
}

/// Handle returned by [`MessageBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Callback = Arc<dyn Fn(&BusEvent) + Send + Sync>;

#[derive(Default)]
pub struct MessageBus {
    next_id: AtomicU64,
    subscribers: StdMutex<Vec<(SubscriberId, Callback)>>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. It sees only events published after this call.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(callback)));
        tracing::trace!(subscriber = id.0, "Bus subscriber added");
        id
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.len();
        subscribers.retain(|(sub, _)| *sub != id);
        let removed = subscribers.len() != before;
        if removed {
            tracing::trace!(subscriber = id.0, "Bus subscriber removed");
        }
        removed
    }

    /// Deliver `event` to every current subscriber, in registration order.
    ///
    /// A subscriber removed by an earlier callback during this publish is
    /// skipped.
    pub fn publish(&self, event: BusEvent) {
        let snapshot: Vec<(SubscriberId, Callback)> = self.lock().clone();
        for (id, callback) in snapshot {
            if self.is_subscribed(id) {
                callback(&event);
            }
        }
    }

    /// Stream of every message published from now on. Dropping the stream
    /// unsubscribes it.
    pub fn stream(self: &Arc<Self>) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            if let BusEvent::Message(message) = event {
                let _ = tx.send(message.clone());
            }
        });
        MessageStream {
            rx,
            bus: Arc::downgrade(self),
            id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn is_subscribed(&self, id: SubscriberId) -> bool {
        self.lock().iter().any(|(sub, _)| *sub == id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriberId, Callback)>> {
        // Callbacks never run under this lock, so poisoning only follows a
        // panic inside Vec operations; the list itself is still consistent.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Bus subscription as an async stream of child messages.
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<RpcMessage>,
    bus: Weak<MessageBus>,
    id: SubscriberId,
}

impl Stream for MessageStream {
    type Item = RpcMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for MessageStream {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}
