//! Step processor registry and dispatch.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::context::ExecutionContext;
use crate::error::ProcessingError;
use crate::step::{Step, StepKind};

/// Turns a step's declarative configuration into an output value.
#[async_trait]
pub trait StepProcessor: Send + Sync {
    /// The step kind this processor handles.
    fn kind(&self) -> StepKind;

    /// Reject a malformed step before any work is attempted.
    fn validate(&self, step: &Step) -> Result<(), ProcessingError>;

    /// Carry out the step against its backing service.
    async fn process(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ProcessingError>;
}

/// Fixed lookup table from step kind to processor.
#[derive(Clone)]
pub struct ProcessorRegistry {
    processors: BTreeMap<StepKind, Arc<dyn StepProcessor>>,
}

impl ProcessorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            processors: BTreeMap::new(),
        }
    }

    /// Register a processor, replacing any previous one for the same kind.
    pub fn register<P: StepProcessor + 'static>(&mut self, processor: P) {
        self.processors.insert(processor.kind(), Arc::new(processor));
    }

    /// Get the processor for a kind.
    pub fn get(&self, kind: StepKind) -> Option<Arc<dyn StepProcessor>> {
        self.processors.get(&kind).cloned()
    }

    /// Check if a kind has a processor.
    pub fn has(&self, kind: StepKind) -> bool {
        self.processors.contains_key(&kind)
    }

    /// Registered kinds.
    pub fn kinds(&self) -> Vec<StepKind> {
        self.processors.keys().copied().collect()
    }

    /// Kinds with no processor registered.
    pub fn missing_kinds(&self) -> Vec<StepKind> {
        StepKind::ALL
            .iter()
            .copied()
            .filter(|k| !self.has(*k))
            .collect()
    }

    /// Look up, validate and run the processor for `step`.
    pub async fn process(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, ProcessingError> {
        let processor = self
            .get(step.kind)
            .ok_or(ProcessingError::NotRegistered(step.kind))?;
        processor.validate(step)?;
        processor.process(step, ctx, cancel).await
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("processors", &self.kinds())
            .finish()
    }
}
