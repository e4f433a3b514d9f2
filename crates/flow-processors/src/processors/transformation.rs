//! Data transformation processor.

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

/// Transformation step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationConfig {
    /// Transformation type tag (e.g. "mapping", "filter", "script").
    #[serde(alias = "type")]
    pub transformation_type: String,
}

/// Step configuration without the type tag, as sent to the service.
fn settings_of(step: &Step) -> serde_json::Value {
    match &step.config {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .filter(|(k, _)| k.as_str() != "transformationType" && k.as_str() != "type")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Runs a transformation through the transformation execution service.
pub struct TransformationProcessor {
    transport: Arc<dyn ServiceTransport>,
}

impl TransformationProcessor {
    /// Create a new transformation processor.
    pub fn new(transport: Arc<dyn ServiceTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl StepProcessor for TransformationProcessor {
    fn kind(&self) -> StepKind {
        StepKind::Transformation
    }

    fn validate(&self, step: &Step) -> Result<(), ProcessingError> {
        let config: TransformationConfig = parse_config(step)?;
        require_non_empty(step, "transformationType", &config.transformation_type)
    }

    async fn process(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ProcessingError> {
        let config: TransformationConfig = parse_config(step)?;

        let request = serde_json::json!({
            "stepId": step.id,
            "executionId": ctx.execution_id,
            "transformationType": config.transformation_type,
            "configuration": settings_of(step),
            "input": ctx.input_for(step),
        });

        tracing::debug!(
            execution_id = %ctx.execution_id,
            step_id = %step.id,
            transformation_type = %config.transformation_type,
            "Running transformation"
        );

        self.transport
            .call(ServiceKind::Transformation, request, cancel)
            .await
    }
}
