//! mcp-relay: HTTP/SSE front end for a stdio JSON-RPC (MCP) server.
//!
//! The relay owns one child process speaking newline-delimited JSON-RPC on
//! stdin/stdout and exposes it over HTTP. Calls get exactly one SSE event
//! carrying the reply whose `id` matches; notifications are fire-and-forget.

pub mod bridge;
pub mod bus;
pub mod config;
pub mod correlation;
mod health;
pub mod service;
pub mod supervisor;
pub mod transport;

pub use bridge::{Frame, NdjsonCodec, ProtocolError, RpcId, RpcMessage};
pub use bus::{BusEvent, MessageBus, MessageStream, SubscriberId};
pub use config::{BridgeConfig, ConfigError};
pub use correlation::{Correlator, PendingReply};
pub use health::{HealthResponse, HealthStatus};
pub use service::{BridgeService, CallError, HealthSnapshot};
pub use supervisor::{
    ChildSpawner, CommandSpawner, ProcessSupervisor, SendError, SpawnError, SupervisorConfig,
    SupervisorState,
};
