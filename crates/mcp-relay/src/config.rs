//! Bridge configuration from the environment.

use std::time::Duration;

/// Node entry point of the wrapped MCP server.
pub const DEFAULT_SERVER_ENTRY: &str = "/app/azure-devops-mcp/dist/index.js";
pub const DEFAULT_AUTH_TYPE: &str = "env";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_PORT: u16 = 8000;

/// Delay before a crashed child is started again.
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ADO_ORGANIZATION environment variable is required")]
    MissingOrganization,
    #[error("invalid PORT {value:?}: {reason}")]
    InvalidPort { value: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub organization: String,
    pub auth_type: String,
    pub port: u16,
    /// Program used to run the server entry point.
    pub node_bin: String,
    pub server_entry: String,
}

impl BridgeConfig {
    pub fn new(organization: impl Into<String>) -> Self {
        Self {
            organization: organization.into(),
            auth_type: DEFAULT_AUTH_TYPE.to_string(),
            port: DEFAULT_PORT,
            node_bin: "node".to_string(),
            server_entry: DEFAULT_SERVER_ENTRY.to_string(),
        }
    }

    /// Read `ADO_ORGANIZATION`, `ADO_AUTH_TYPE` and `PORT`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source.
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let organization = get("ADO_ORGANIZATION").ok_or(ConfigError::MissingOrganization)?;
        let mut config = Self::new(organization);

        if let Some(auth_type) = get("ADO_AUTH_TYPE") {
            config.auth_type = auth_type;
        }
        if let Some(port) = get("PORT") {
            config.port = port
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| ConfigError::InvalidPort {
                    value: port.clone(),
                    reason: e.to_string(),
                })?;
        }

        Ok(config)
    }

    /// Fixed child argument list: `<entry> <organization> -a <auth type>`.
    pub fn server_args(&self) -> Vec<String> {
        vec![
            self.server_entry.clone(),
            self.organization.clone(),
            "-a".to_string(),
            self.auth_type.clone(),
        ]
    }
}

/// Tracing level for the `mcp_relay` target from `LOG_LEVEL`.
///
/// Unknown or missing values fall back to [`DEFAULT_LOG_LEVEL`].
pub fn log_level_from<F>(lookup: F) -> &'static str
where
    F: Fn(&str) -> Option<String>,
{
    let level = lookup("LOG_LEVEL")
        .map(|v| v.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match level.as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" => "error",
        _ => DEFAULT_LOG_LEVEL,
    }
}
