//! Transport layer for the bridge.
//!
//! Currently provides the HTTP/SSE transport via axum.

pub mod http;

pub use http::{ServerConfig, serve, serve_listener};
