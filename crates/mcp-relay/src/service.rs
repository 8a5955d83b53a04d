//! BridgeService: transport-agnostic owner of the bridge components.
//!
//! This service owns:
//! - The message bus every child message is published on
//! - The correlator matching replies to waiting calls
//! - The supervisor running the MCP server child
//! - Shutdown coordination
//!
//! Transports call into this service and never touch the child directly.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::bridge::protocol::RpcMessage;
use crate::bus::{MessageBus, MessageStream};
use crate::config::BridgeConfig;
use crate::correlation::{Correlator, PendingReply};
use crate::health::{HealthResponse, HealthStatus};
use crate::supervisor::{ProcessSupervisor, SendError, SpawnError, SupervisorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("message has no id, nothing to wait for")]
    NotACall,
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Snapshot of service health for transports to query.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub organization: String,
    pub auth_type: String,
    pub pid: Option<u32>,
    pub pending_calls: usize,
}

impl HealthSnapshot {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }

    pub fn to_response(&self) -> HealthResponse {
        HealthResponse {
            status: self.status,
            organization: self.organization.clone(),
            auth_type: self.auth_type.clone(),
        }
    }
}

pub struct BridgeService {
    config: BridgeConfig,
    bus: Arc<MessageBus>,
    correlator: Arc<Correlator>,
    supervisor: Arc<ProcessSupervisor>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl BridgeService {
    /// Service that runs the configured Node entry point.
    pub fn new(config: BridgeConfig) -> Arc<Self> {
        let supervisor_config = SupervisorConfig::from_bridge(&config);
        Self::with_supervisor_config(config, supervisor_config)
    }

    /// Service running an arbitrary child command (tests use `sh`).
    pub fn with_supervisor_config(
        config: BridgeConfig,
        supervisor_config: SupervisorConfig,
    ) -> Arc<Self> {
        let bus = Arc::new(MessageBus::new());
        let correlator = Correlator::attach(&bus);
        let supervisor = ProcessSupervisor::new(supervisor_config, Arc::clone(&bus));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Arc::new(Self {
            config,
            bus,
            correlator,
            supervisor,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Spawn the MCP server child.
    pub fn start(&self) -> Result<(), SpawnError> {
        self.supervisor.start()
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: self.supervisor.state().into(),
            organization: self.config.organization.clone(),
            auth_type: self.config.auth_type.clone(),
            pid: self.supervisor.pid(),
            pending_calls: self.correlator.pending_count(),
        }
    }

    /// Forward a call and return the future of its reply.
    ///
    /// The waiter is registered before the write so a fast reply is never
    /// missed. On send failure the waiter is dropped again.
    pub fn call(&self, message: RpcMessage) -> Result<PendingReply, CallError> {
        let Some(id) = message.id().cloned() else {
            return Err(CallError::NotACall);
        };
        let pending = self.correlator.await_reply(id);
        self.supervisor.send(message)?;
        Ok(pending)
    }

    /// Forward a message without waiting for anything back.
    pub fn notify(&self, message: RpcMessage) -> Result<(), SendError> {
        self.supervisor.send(message)
    }

    /// Every message the child emits from now on.
    pub fn message_stream(&self) -> MessageStream {
        self.bus.stream()
    }

    /// Stop the child (failing pending calls) and signal transports.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.supervisor.stop();
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Completes once [`shutdown`](Self::shutdown) has been called.
    pub fn shutdown_signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.shutdown_rx.clone();
        async move {
            while !*rx.borrow_and_update() {
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.bus
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }
}

impl std::fmt::Debug for BridgeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeService")
            .field("organization", &self.config.organization)
            .field("state", &self.supervisor.state())
            .finish()
    }
}
