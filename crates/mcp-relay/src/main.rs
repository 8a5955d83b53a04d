//! mcp-relay binary: configure from the environment, start the child, serve HTTP.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use mcp_relay::transport::{ServerConfig, serve};
use mcp_relay::{BridgeConfig, BridgeService, config};

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = config::log_level_from(|key| std::env::var(key).ok());
        EnvFilter::new(format!("mcp_relay={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    tracing::info!(
        organization = %config.organization,
        auth_type = %config.auth_type,
        "Starting Azure DevOps MCP server bridge"
    );

    let server_config = ServerConfig::with_port(config.port);
    let service = BridgeService::new(config);

    // Not fatal: /health keeps reporting "starting" and calls fail explicitly.
    if let Err(e) = service.start() {
        tracing::error!(error = %e, "Failed to start MCP server");
    }

    serve(server_config, service).await
}
