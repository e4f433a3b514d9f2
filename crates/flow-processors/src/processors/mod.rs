//! Built-in step processors.
//!
//! One processor per step kind:
//! - `adapter` - Invoke an adapter through the adapter execution service
//! - `transformation` - Run a data transformation
//! - `condition` - Evaluate a boolean expression against the variables
//! - `loop` - Iterate a body reference over a source
//! - `delay` - Pace the flow through the delay service

mod adapter;
mod condition;
mod delay;
mod looping;
mod transformation;

#[cfg(test)]
pub(crate) mod test_support;

pub use self::adapter::{AdapterConfig, AdapterProcessor};
pub use self::condition::{ConditionConfig, ConditionProcessor};
pub use self::delay::{DelayConfig, DelayProcessor, MAX_DELAY_MS};
pub use self::looping::{LoopConfig, LoopProcessor};
pub use self::transformation::{TransformationConfig, TransformationProcessor};

use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::error::ProcessingError;
use crate::registry::ProcessorRegistry;
use crate::step::Step;
use crate::transport::ServiceTransport;

/// Create a registry with all five processors sharing one transport.
pub fn create_default_registry(transport: Arc<dyn ServiceTransport>) -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();

    registry.register(AdapterProcessor::new(transport.clone()));
    registry.register(TransformationProcessor::new(transport.clone()));
    registry.register(ConditionProcessor::new(transport.clone()));
    registry.register(LoopProcessor::new(transport.clone()));
    registry.register(DelayProcessor::new(transport));

    registry
}

/// Parse a step's configuration payload into its typed form.
pub(crate) fn parse_config<T: DeserializeOwned>(step: &Step) -> Result<T, ProcessingError> {
    serde_json::from_value(step.config.clone()).map_err(|e| {
        ProcessingError::Validation(format!(
            "invalid {} configuration for step '{}': {}",
            step.kind, step.id, e
        ))
    })
}

/// Fail validation when a required string field is blank.
pub(crate) fn require_non_empty(step: &Step, field: &str, value: &str) -> Result<(), ProcessingError> {
    if value.trim().is_empty() {
        return Err(ProcessingError::Validation(format!(
            "step '{}' requires a non-empty '{}'",
            step.id, field
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepKind;
    use test_support::RecordingTransport;

    #[test]
    fn test_default_registry_is_complete() {
        let registry = create_default_registry(Arc::new(RecordingTransport::ok(serde_json::Value::Null)));
        assert!(registry.missing_kinds().is_empty());
        for kind in StepKind::ALL {
            assert_eq!(registry.get(kind).map(|p| p.kind()), Some(kind));
        }
    }
}
