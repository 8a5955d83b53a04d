//! HTTP server implementation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use crate::config::DEFAULT_PORT;
use crate::service::BridgeService;

use super::routes::routes;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl ServerConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }
}

/// Start the HTTP server with provided service.
///
/// Returns after a shutdown signal once the listener has closed and the child
/// has been stopped.
pub async fn serve(config: ServerConfig, service: Arc<BridgeService>) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    serve_listener(listener, service).await
}

/// Same as [`serve`] on an already bound listener.
pub async fn serve_listener(
    listener: TcpListener,
    service: Arc<BridgeService>,
) -> anyhow::Result<()> {
    let app = routes(Arc::clone(&service));
    let actual_addr = listener.local_addr()?;

    info!(
        organization = %service.config().organization,
        "Starting MCP bridge on {}",
        actual_addr
    );

    let signal = shutdown_signal(Arc::clone(&service));
    axum::serve(listener, app)
        .with_graceful_shutdown(signal)
        .await?;

    info!("Server shutdown complete");

    // Idempotent when the shutdown came from the service itself.
    service.shutdown();

    Ok(())
}

/// Wait for SIGTERM, SIGINT, or [`BridgeService::shutdown`].
///
/// The child is stopped as soon as a signal arrives so open SSE streams end
/// and pending calls are failed before graceful shutdown waits on them.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This only happens when the
/// tokio runtime is misconfigured, which should fail fast at startup.
async fn shutdown_signal(service: Arc<BridgeService>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler - is tokio runtime configured correctly?");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler - is tokio runtime configured correctly?")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let explicit_shutdown = service.shutdown_signal();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = explicit_shutdown => {
            info!("Shutdown requested by service...");
        }
    }

    service.shutdown();
}
