//! Loop iteration processor.

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

/// Loop step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopConfig {
    /// Iteration source: a literal list or a reference the loop service resolves.
    pub source: serde_json::Value,

    /// Reference to the body executed per item.
    pub body: String,

    /// Upper bound on iterations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u64>,
}

/// Runs a loop through the loop execution service.
pub struct LoopProcessor {
    transport: Arc<dyn ServiceTransport>,
}

impl LoopProcessor {
    /// Create a new loop processor.
    pub fn new(transport: Arc<dyn ServiceTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl StepProcessor for LoopProcessor {
    fn kind(&self) -> StepKind {
        StepKind::Loop
    }

    fn validate(&self, step: &Step) -> Result<(), ProcessingError> {
        let config: LoopConfig = parse_config(step)?;
        require_non_empty(step, "body", &config.body)?;

        if config.source.is_null() {
            return Err(ProcessingError::Validation(format!(
                "step '{}' requires a loop 'source'",
                step.id
            )));
        }
        if config.max_iterations == Some(0) {
            return Err(ProcessingError::Validation(format!(
                "step '{}' has maxIterations of 0",
                step.id
            )));
        }
        Ok(())
    }

    async fn process(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ProcessingError> {
        let request = serde_json::json!({
            "stepId": step.id,
            "executionId": ctx.execution_id,
            "loopConfiguration": step.config,
            "input": ctx.input_for(step),
        });

        tracing::debug!(
            execution_id = %ctx.execution_id,
            step_id = %step.id,
            "Executing loop"
        );

        self.transport.call(ServiceKind::Loop, request, cancel).await
    }
}
