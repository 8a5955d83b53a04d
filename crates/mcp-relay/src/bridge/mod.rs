//! Stdio side of the bridge: JSON-RPC wire types and line framing.
//!
//! # Architecture
//!
//! - **protocol**: `RpcMessage` / `RpcId` and the error replies the bridge produces
//! - **codec**: newline-delimited JSON codec for the child's stdin/stdout

pub mod codec;
pub mod protocol;

pub use codec::{Frame, NdjsonCodec};
pub use protocol::{ProtocolError, RpcId, RpcMessage};
