//! Flow definition types.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use flow_processors::Step;

use crate::error::{EngineError, EngineResult};

/// What the engine does after a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorHandling {
    /// Abort the remaining steps.
    #[default]
    Stop,
    /// Record the failure and move on to the next step.
    Continue,
    /// Re-invoke the failed step with backoff, then behave like `Stop`.
    Retry,
}

/// Order in which steps are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOrder {
    /// Declaration order.
    #[default]
    Declared,
    /// Topological order over step dependencies.
    Dependencies,
}

/// Bounded retry schedule for the `retry` policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of re-attempts after the first failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first re-attempt in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on the delay between re-attempts in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    10000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    /// Delay before re-attempt number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

/// Flow-level execution settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowSettings {
    /// Error-handling policy.
    #[serde(default)]
    pub error_handling: ErrorHandling,

    /// Step timeout in milliseconds (engine default when absent).
    #[serde(default, alias = "timeout", skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Retry schedule used by the `retry` policy.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Step dispatch order.
    #[serde(default)]
    pub execution_order: ExecutionOrder,
}

/// Immutable declarative description of an integration flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Flow identifier.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Flow version.
    #[serde(default = "default_version")]
    pub version: String,

    /// Steps in declaration order.
    pub steps: Vec<Step>,

    /// Initial variable bindings.
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,

    /// Execution settings.
    #[serde(default)]
    pub settings: FlowSettings,
}

fn default_version() -> String {
    "1".to_string()
}

impl FlowDefinition {
    /// Create a flow with default settings.
    pub fn new(id: impl Into<String>, name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            steps,
            variables: HashMap::new(),
            settings: FlowSettings::default(),
        }
    }

    /// Set the error-handling policy.
    pub fn with_error_handling(mut self, policy: ErrorHandling) -> Self {
        self.settings.error_handling = policy;
        self
    }

    /// Set the step timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.settings.timeout_ms = Some(timeout_ms);
        self
    }

    /// Parse a flow from YAML (JSON is accepted too).
    pub fn from_yaml(source: &str) -> EngineResult<Self> {
        let flow: FlowDefinition = serde_yaml::from_str(source)?;
        flow.validate()?;
        Ok(flow)
    }

    /// Read and parse a flow file.
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&source)
    }

    /// Look up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Check structural invariants the run loop relies on.
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidFlow("flow id is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(EngineError::InvalidFlow(format!("flow '{}' has no steps", self.id)));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(EngineError::InvalidFlow(format!(
                    "flow '{}' has a step with an empty id",
                    self.id
                )));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::InvalidFlow(format!("duplicate step id '{}'", step.id)));
            }
        }

        for step in &self.steps {
            for dep in &step.dependencies {
                if dep == &step.id {
                    return Err(EngineError::InvalidFlow(format!(
                        "step '{}' depends on itself",
                        step.id
                    )));
                }
                if !seen.contains(dep.as_str()) {
                    return Err(EngineError::InvalidFlow(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.id, dep
                    )));
                }
            }
        }

        Ok(())
    }
}
