//! Execution context threaded through one flow run.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::ProcessingError;
use crate::step::Step;

/// Mutable scratch state for a single execution.
///
/// Contains everything a processor may read while handling a step:
/// - Flow and execution identifiers
/// - Variable bindings (flow variables merged with caller overrides)
/// - Results of previously completed steps
/// - The step currently executing and a free-form metadata bag
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    /// Flow being executed.
    pub flow_id: String,

    /// Execution identifier.
    pub execution_id: Uuid,

    /// Variable bindings.
    #[serde(default)]
    pub variables: HashMap<String, serde_json::Value>,

    /// Step outputs keyed by step id. Each entry is written once.
    #[serde(default)]
    step_results: HashMap<String, serde_json::Value>,

    /// Step currently executing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    /// Free-form metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ExecutionContext {
    /// Create an empty context for an execution.
    pub fn new(flow_id: impl Into<String>, execution_id: Uuid) -> Self {
        Self {
            flow_id: flow_id.into(),
            execution_id,
            variables: HashMap::new(),
            step_results: HashMap::new(),
            current_step: None,
            metadata: HashMap::new(),
        }
    }

    /// Seed variables from the flow definition, then layer overrides on top.
    pub fn with_variables(
        mut self,
        variables: &HashMap<String, serde_json::Value>,
        overrides: &HashMap<String, serde_json::Value>,
    ) -> Self {
        self.merge_variables(variables);
        self.merge_variables(overrides);
        self
    }

    /// Set a variable value.
    pub fn set_variable(&mut self, name: impl Into<String>, value: serde_json::Value) {
        self.variables.insert(name.into(), value);
    }

    /// Get a variable value.
    pub fn get_variable(&self, name: &str) -> Option<&serde_json::Value> {
        self.variables.get(name)
    }

    /// Merge a map of variables into this context.
    pub fn merge_variables(&mut self, other: &HashMap<String, serde_json::Value>) {
        for (k, v) in other {
            self.variables.insert(k.clone(), v.clone());
        }
    }

    /// Store a step's output. Fails if the step already has a result.
    pub fn record_result(
        &mut self,
        step_id: &str,
        value: serde_json::Value,
    ) -> Result<(), ProcessingError> {
        if self.step_results.contains_key(step_id) {
            return Err(ProcessingError::Validation(format!(
                "result for step '{}' already recorded",
                step_id
            )));
        }
        self.step_results.insert(step_id.to_string(), value);
        Ok(())
    }

    /// Output of a previously completed step.
    pub fn step_result(&self, step_id: &str) -> Option<&serde_json::Value> {
        self.step_results.get(step_id)
    }

    /// Number of steps with a recorded result.
    pub fn result_count(&self) -> usize {
        self.step_results.len()
    }

    /// Input for a step: the output of its first dependency, or null.
    pub fn input_for(&self, step: &Step) -> serde_json::Value {
        step.primary_dependency()
            .and_then(|dep| self.step_results.get(dep))
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    /// Mark the step currently executing.
    pub fn set_current_step(&mut self, step_id: Option<&str>) {
        self.current_step = step_id.map(|s| s.to_string());
    }

    /// Set a metadata entry.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepKind;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("orders-sync", Uuid::nil())
    }

    #[test]
    fn test_context_variables_override() {
        let mut flow_vars = HashMap::new();
        flow_vars.insert("region".to_string(), serde_json::json!("eu"));
        flow_vars.insert("batch".to_string(), serde_json::json!(100));

        let mut overrides = HashMap::new();
        overrides.insert("batch".to_string(), serde_json::json!(5));

        let ctx = ctx().with_variables(&flow_vars, &overrides);
        assert_eq!(ctx.get_variable("region"), Some(&serde_json::json!("eu")));
        assert_eq!(ctx.get_variable("batch"), Some(&serde_json::json!(5)));
        assert_eq!(ctx.get_variable("missing"), None);
    }

    #[test]
    fn test_record_result_is_write_once() {
        let mut ctx = ctx();
        ctx.record_result("fetch", serde_json::json!({"rows": 3})).unwrap();

        let err = ctx.record_result("fetch", serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ProcessingError::Validation(_)));
        assert_eq!(ctx.step_result("fetch"), Some(&serde_json::json!({"rows": 3})));
        assert_eq!(ctx.result_count(), 1);
    }

    #[test]
    fn test_input_for_uses_first_dependency() {
        let mut ctx = ctx();
        ctx.record_result("a", serde_json::json!("from-a")).unwrap();
        ctx.record_result("b", serde_json::json!("from-b")).unwrap();

        let step = Step::new("c", "C", StepKind::Adapter).depends_on("a").depends_on("b");
        assert_eq!(ctx.input_for(&step), serde_json::json!("from-a"));

        let step = Step::new("d", "D", StepKind::Adapter);
        assert_eq!(ctx.input_for(&step), serde_json::Value::Null);

        let step = Step::new("e", "E", StepKind::Adapter).depends_on("missing");
        assert_eq!(ctx.input_for(&step), serde_json::Value::Null);
    }

    #[test]
    fn test_context_serialization() {
        let mut ctx = ctx();
        ctx.set_current_step(Some("fetch"));
        let json = serde_json::to_string(&ctx).unwrap();
        assert!(json.contains("\"flowId\":\"orders-sync\""));
        assert!(json.contains("\"currentStep\":\"fetch\""));
    }
}
