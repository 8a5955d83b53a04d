//! Health status reported on `GET /health`.

use serde::{Deserialize, Serialize};

use crate::supervisor::SupervisorState;

/// Bridge health as seen by clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Child process is running.
    Healthy,
    /// Anything else: not spawned yet, restarting, or stopped.
    #[default]
    Starting,
}

impl From<SupervisorState> for HealthStatus {
    fn from(state: SupervisorState) -> Self {
        match state {
            SupervisorState::Running => HealthStatus::Healthy,
            SupervisorState::Idle
            | SupervisorState::Starting
            | SupervisorState::Exited(_)
            | SupervisorState::Stopped => HealthStatus::Starting,
        }
    }
}

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub organization: String,
    pub auth_type: String,
}
