//! Delay processor.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::parse_config;
use crate::context::ExecutionContext;
use crate::error::ProcessingError;
use crate::registry::StepProcessor;
use crate::step::{Step, StepKind};
use crate::transport::{ServiceKind, ServiceTransport};

/// Longest delay a single step may request (24 hours).
pub const MAX_DELAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Delay step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayConfig {
    /// Delay in milliseconds.
    #[serde(alias = "delay")]
    pub duration_ms: u64,
}

/// Paces a flow through the delay service instead of sleeping locally.
pub struct DelayProcessor {
    transport: Arc<dyn ServiceTransport>,
}

impl DelayProcessor {
    /// Create a new delay processor.
    pub fn new(transport: Arc<dyn ServiceTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl StepProcessor for DelayProcessor {
    fn kind(&self) -> StepKind {
        StepKind::Delay
    }

    fn validate(&self, step: &Step) -> Result<(), ProcessingError> {
        let config: DelayConfig = parse_config(step)?;
        if config.duration_ms > MAX_DELAY_MS {
            return Err(ProcessingError::Validation(format!(
                "step '{}' delay of {} ms exceeds the {} ms limit",
                step.id, config.duration_ms, MAX_DELAY_MS
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
        let config: DelayConfig = parse_config(step)?;

        tracing::debug!(
            execution_id = %ctx.execution_id,
            step_id = %step.id,
            delay_ms = config.duration_ms,
            "Requesting delay"
        );

        let request = serde_json::json!({
            "stepId": step.id,
            "delayMilliseconds": config.duration_ms,
        });

        let response = self.transport.call(ServiceKind::Delay, request, cancel).await?;
        if response.is_null() {
            return Ok(serde_json::json!({ "delayedMs": config.duration_ms }));
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::test_support::RecordingTransport;

    #[test]
    fn test_delay_alias_and_limit() {
        let processor = DelayProcessor::new(Arc::new(RecordingTransport::ok(serde_json::Value::Null)));

        let step = Step::new("wait", "Wait", StepKind::Delay)
            .with_config(serde_json::json!({"delay": 250}));
        assert!(processor.validate(&step).is_ok());

        let too_long = Step::new("wait", "Wait", StepKind::Delay)
            .with_config(serde_json::json!({"durationMs": MAX_DELAY_MS + 1}));
        assert!(processor.validate(&too_long).is_err());

        let negative = Step::new("wait", "Wait", StepKind::Delay)
            .with_config(serde_json::json!({"durationMs": -5}));
        assert!(processor.validate(&negative).is_err());
    }

    #[tokio::test]
    async fn test_delay_request_shape() {
        let transport = Arc::new(RecordingTransport::ok(serde_json::Value::Null));
        let processor = DelayProcessor::new(transport.clone());

        let step = Step::new("wait", "Wait", StepKind::Delay)
            .with_config(serde_json::json!({"durationMs": 250}));
        let ctx = ExecutionContext::new("orders-sync", uuid::Uuid::new_v4());

        let output = processor
            .process(&step, &ctx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"delayedMs": 250}));

        let (service, request) = transport.last_call();
        assert_eq!(service, ServiceKind::Delay);
        assert_eq!(request, serde_json::json!({"stepId": "wait", "delayMilliseconds": 250}));
    }
}
