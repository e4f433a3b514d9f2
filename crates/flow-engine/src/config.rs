//! Engine configuration.

use serde::Deserialize;
use std::time::Duration;

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `FLOW_ENGINE_`:
/// - `FLOW_ENGINE_SERVICE_URL`: Base URL of the backend step services (default: "http://localhost:8082")
/// - `FLOW_ENGINE_API_TOKEN`: Bearer token sent to the backend services (optional)
/// - `FLOW_ENGINE_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
/// - `FLOW_ENGINE_DEFAULT_STEP_TIMEOUT_MS`: Step timeout when a flow sets none (default: 30000)
/// - `FLOW_ENGINE_EVENT_BUFFER`: Capacity of each execution's update channel (default: 128)
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Backend service base URL
    #[serde(default = "default_service_url")]
    pub service_url: String,

    /// Bearer token for the backend services
    #[serde(default)]
    pub api_token: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Step timeout used when the flow does not configure one
    #[serde(default = "default_step_timeout_ms")]
    pub default_step_timeout_ms: u64,

    /// Buffered updates per execution watcher
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_service_url() -> String {
    "http://localhost:8082".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_step_timeout_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    128
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("FLOW_ENGINE_").from_env::<EngineConfig>()
    }

    /// HTTP request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Fallback step timeout.
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_millis(self.default_step_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_url: default_service_url(),
            api_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            default_step_timeout_ms: default_step_timeout_ms(),
            event_buffer: default_event_buffer(),
        }
    }
}
