//! Adapter invocation processor.

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

/// Adapter step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    /// Configured adapter to invoke.
    pub adapter_id: String,

    /// Adapter operation (adapter default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,

    /// Adapter-specific settings passed through untouched.
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

/// Invokes an adapter through the adapter execution service.
pub struct AdapterProcessor {
    transport: Arc<dyn ServiceTransport>,
}

impl AdapterProcessor {
    /// Create a new adapter processor.
    pub fn new(transport: Arc<dyn ServiceTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl StepProcessor for AdapterProcessor {
    fn kind(&self) -> StepKind {
        StepKind::Adapter
    }

    fn validate(&self, step: &Step) -> Result<(), ProcessingError> {
        let config: AdapterConfig = parse_config(step)?;
        require_non_empty(step, "adapterId", &config.adapter_id)
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
            "configuration": step.config,
            "input": ctx.input_for(step),
        });

        tracing::debug!(
            execution_id = %ctx.execution_id,
            step_id = %step.id,
            adapter_id = step.config.get("adapterId").and_then(|v| v.as_str()).unwrap_or(""),
            "Invoking adapter"
        );

        self.transport.call(ServiceKind::Adapter, request, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::test_support::RecordingTransport;

    fn adapter_step() -> Step {
        Step::new("fetch", "Fetch orders", StepKind::Adapter)
            .with_config(serde_json::json!({"adapterId": "erp", "operation": "list", "page": 2}))
            .depends_on("auth")
    }

    #[test]
    fn test_adapter_config_parse() {
        let config: AdapterConfig = parse_config(&adapter_step()).unwrap();
        assert_eq!(config.adapter_id, "erp");
        assert_eq!(config.operation.as_deref(), Some("list"));
        assert_eq!(config.settings.get("page"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn test_adapter_validate() {
        let processor = AdapterProcessor::new(Arc::new(RecordingTransport::ok(serde_json::Value::Null)));
        assert!(processor.validate(&adapter_step()).is_ok());

        let missing = Step::new("fetch", "Fetch", StepKind::Adapter);
        assert!(matches!(processor.validate(&missing), Err(ProcessingError::Validation(_))));

        let blank = Step::new("fetch", "Fetch", StepKind::Adapter)
            .with_config(serde_json::json!({"adapterId": "  "}));
        assert!(matches!(processor.validate(&blank), Err(ProcessingError::Validation(_))));
    }

    #[tokio::test]
    async fn test_adapter_request_carries_dependency_output() {
        let transport = Arc::new(RecordingTransport::ok(serde_json::json!({"orders": [1, 2]})));
        let processor = AdapterProcessor::new(transport.clone());

        let mut ctx = ExecutionContext::new("orders-sync", uuid::Uuid::new_v4());
        ctx.record_result("auth", serde_json::json!({"token": "t"})).unwrap();

        let output = processor
            .process(&adapter_step(), &ctx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output, serde_json::json!({"orders": [1, 2]}));

        let (service, request) = transport.last_call();
        assert_eq!(service, ServiceKind::Adapter);
        assert_eq!(request["stepId"], "fetch");
        assert_eq!(request["executionId"], serde_json::json!(ctx.execution_id));
        assert_eq!(request["configuration"]["adapterId"], "erp");
        assert_eq!(request["input"], serde_json::json!({"token": "t"}));
    }

    #[tokio::test]
    async fn test_adapter_surfaces_service_error() {
        let transport = Arc::new(RecordingTransport::failing(ProcessingError::Service {
            status: 503,
            message: "adapter offline".to_string(),
        }));
        let processor = AdapterProcessor::new(transport);
        let ctx = ExecutionContext::new("orders-sync", uuid::Uuid::new_v4());

        let err = processor
            .process(&adapter_step(), &ctx, CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "SERVICE_ERROR");
    }
}
