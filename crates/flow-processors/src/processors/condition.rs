//! Condition evaluation processor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{parse_config, require_non_empty};
use crate::context::ExecutionContext;
use crate::error::ProcessingError;
use crate::registry::StepProcessor;
use crate::step::{Step, StepKind};
use crate::transport::{ServiceKind, ServiceTransport};

/// Condition step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionConfig {
    /// Boolean expression evaluated by the condition service.
    #[serde(alias = "condition")]
    pub expression: String,
}

/// Evaluates a boolean expression through the condition service.
///
/// The service may answer with a bare boolean or an object carrying a
/// boolean `result`. The step output is always `{"result": bool, "response": ..}`.
pub struct ConditionProcessor {
    transport: Arc<dyn ServiceTransport>,
}

impl ConditionProcessor {
    /// Create a new condition processor.
    pub fn new(transport: Arc<dyn ServiceTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl StepProcessor for ConditionProcessor {
    fn kind(&self) -> StepKind {
        StepKind::Condition
    }

    fn validate(&self, step: &Step) -> Result<(), ProcessingError> {
        let config: ConditionConfig = parse_config(step)?;
        require_non_empty(step, "expression", &config.expression)
    }

    async fn process(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ProcessingError> {
        let config: ConditionConfig = parse_config(step)?;

        let request = serde_json::json!({
            "stepId": step.id,
            "executionId": ctx.execution_id,
            "condition": config.expression,
            "variables": ctx.variables,
            "input": ctx.input_for(step),
        });

        let response = self
            .transport
            .call(ServiceKind::Condition, request, cancel)
            .await?;

        let result = extract_boolean(&response).ok_or_else(|| {
            ProcessingError::InvalidResponse(format!(
                "condition service returned no boolean result for step '{}'",
                step.id
            ))
        })?;

        tracing::debug!(
            execution_id = %ctx.execution_id,
            step_id = %step.id,
            result,
            "Condition evaluated"
        );

        Ok(serde_json::json!({
            "result": result,
            "response": response,
        }))
    }
}

fn extract_boolean(response: &serde_json::Value) -> Option<bool> {
    match response {
        serde_json::Value::Bool(b) => Some(*b),
        serde_json::Value::Object(obj) => obj.get("result").and_then(|v| v.as_bool()),
        _ => None,
    }
}
