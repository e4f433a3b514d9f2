//! Declarative step model.

use serde::{Deserialize, Serialize};

/// Step type tag.
///
/// The set is closed: a flow naming any other type fails to parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Invoke an adapter.
    Adapter,
    /// Run a data transformation.
    Transformation,
    /// Evaluate a boolean expression.
    Condition,
    /// Iterate a body over a source.
    Loop,
    /// Pause the flow for a fixed duration.
    Delay,
}

impl StepKind {
    /// Every step kind, in a stable order.
    pub const ALL: [StepKind; 5] = [
        StepKind::Adapter,
        StepKind::Transformation,
        StepKind::Condition,
        StepKind::Loop,
        StepKind::Delay,
    ];

    /// Tag as it appears in flow definitions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adapter => "adapter",
            Self::Transformation => "transformation",
            Self::Condition => "condition",
            Self::Loop => "loop",
            Self::Delay => "delay",
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work within a flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    /// Step identifier, unique within its flow.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Step type tag.
    #[serde(rename = "type")]
    pub kind: StepKind,

    /// Type-specific configuration payload.
    #[serde(default)]
    pub config: serde_json::Value,

    /// Identifiers of steps whose output this step consumes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,

    /// Per-step timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Variable that receives the step output once it completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
}

impl Step {
    /// Create a step with an empty configuration.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            config: serde_json::Value::Object(Default::default()),
            dependencies: Vec::new(),
            timeout_ms: None,
            output_variable: None,
        }
    }

    /// Set the configuration payload.
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Add a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    /// Set the per-step timeout.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Bind the step output to a variable.
    pub fn with_output_variable(mut self, name: impl Into<String>) -> Self {
        self.output_variable = Some(name.into());
        self
    }

    /// The dependency whose output feeds this step, if any.
    pub fn primary_dependency(&self) -> Option<&str> {
        self.dependencies.first().map(|s| s.as_str())
    }
}
