//! Correlation of child replies with the HTTP calls waiting for them.
//!
//! The correlator is a single bus subscriber holding a table of pending
//! waiters keyed by [`RpcId`]. Each matching message resolves exactly one
//! waiter (the earliest registered for that id) and removes it, so a resolved
//! waiter never sees later traffic. When the child exits every waiter is
//! resolved with an explicit transport error instead of hanging.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;

use crate::bridge::protocol::{RpcId, RpcMessage, SERVER_ERROR};
use crate::bus::{BusEvent, MessageBus};

struct Waiter {
    token: u64,
    reply_tx: oneshot::Sender<RpcMessage>,
}

pub struct Correlator {
    pending: DashMap<RpcId, VecDeque<Waiter>>,
    next_token: AtomicU64,
}

impl Correlator {
    /// Create a correlator and subscribe it to `bus` for the bus's lifetime.
    pub fn attach(bus: &MessageBus) -> Arc<Self> {
        let correlator = Arc::new(Self {
            pending: DashMap::new(),
            next_token: AtomicU64::new(0),
        });

        let weak = Arc::downgrade(&correlator);
        bus.subscribe(move |event| {
            if let Some(correlator) = weak.upgrade() {
                correlator.handle(event);
            }
        });

        correlator
    }

    /// Register a waiter for `id`. Must be called before the request is sent
    /// so a fast reply cannot slip past.
    pub fn await_reply(self: &Arc<Self>, id: RpcId) -> PendingReply {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.pending
            .entry(id.clone())
            .or_default()
            .push_back(Waiter { token, reply_tx });
        tracing::debug!(%id, "Registered pending call");

        PendingReply {
            id,
            token,
            reply_rx,
            correlator: Arc::downgrade(self),
            done: false,
        }
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.iter().map(|entry| entry.value().len()).sum()
    }

    fn handle(&self, event: &BusEvent) {
        match event {
            BusEvent::Message(message) => {
                let Some(id) = message.id() else {
                    return;
                };
                // Child-initiated requests share the id space with our calls.
                if let Some(method) = message.method() {
                    tracing::debug!(%id, method, "Server request is not a reply, skipping");
                    return;
                }
                self.resolve(id, message);
            }
            BusEvent::ChildExited { code } => self.fail_all(*code),
        }
    }

    fn resolve(&self, id: &RpcId, message: &RpcMessage) {
        let waiter = match self.pending.entry(id.clone()) {
            Entry::Occupied(mut entry) => {
                let waiter = entry.get_mut().pop_front();
                if entry.get().is_empty() {
                    entry.remove();
                }
                waiter
            }
            Entry::Vacant(_) => None,
        };

        let Some(waiter) = waiter else {
            tracing::debug!(%id, "No pending call for message");
            return;
        };

        if waiter.reply_tx.send(message.clone()).is_err() {
            tracing::debug!(%id, "Caller disconnected, discarding late reply");
        } else {
            tracing::debug!(%id, "Resolved pending call");
        }
    }

    fn fail_all(&self, code: Option<i32>) {
        let reason = match code {
            Some(code) => format!("MCP server exited with code {code}"),
            None => "MCP server terminated".to_string(),
        };

        let ids: Vec<RpcId> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0usize;
        for id in ids {
            let Some((id, waiters)) = self.pending.remove(&id) else {
                continue;
            };
            for waiter in waiters {
                let reply = RpcMessage::error_reply(Some(&id), SERVER_ERROR, reason.clone());
                let _ = waiter.reply_tx.send(reply);
                failed += 1;
            }
        }

        if failed > 0 {
            tracing::warn!(failed, %reason, "Failing pending calls");
        }
    }

    fn cancel(&self, id: &RpcId, token: u64) {
        if let Entry::Occupied(mut entry) = self.pending.entry(id.clone()) {
            entry.get_mut().retain(|waiter| waiter.token != token);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// A call waiting for its reply. Resolves to the reply message.
///
/// Dropping it before resolution (client disconnect) unregisters the waiter,
/// so a late reply is discarded rather than delivered anywhere.
pub struct PendingReply {
    id: RpcId,
    token: u64,
    reply_rx: oneshot::Receiver<RpcMessage>,
    correlator: Weak<Correlator>,
    done: bool,
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("done", &self.done)
            .finish()
    }
}

impl Future for PendingReply {
    type Output = RpcMessage;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.reply_rx).poll(cx) {
            Poll::Ready(result) => {
                this.done = true;
                Poll::Ready(result.unwrap_or_else(|_| {
                    RpcMessage::error_reply(Some(&this.id), SERVER_ERROR, "Bridge shutting down")
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(correlator) = self.correlator.upgrade() {
            correlator.cancel(&self.id, self.token);
            tracing::debug!(id = %self.id, "Pending call abandoned");
        }
    }
}
