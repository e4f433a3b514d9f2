//! Flowdeck flow engine
//!
//! Drives declarative integration flows through their lifecycle.
//!
//! The engine:
//! 1. Validates a flow definition and resolves its step order
//! 2. Registers an execution as active and runs its steps one at a time
//! 3. Races each step against its timeout and the execution's cancellation
//! 4. Applies the flow's error-handling policy (stop, continue, retry)
//! 5. Publishes every change of the execution record to listeners and watchers

pub mod config;
pub mod error;
pub mod events;
pub mod execution;
pub mod flow;
pub mod orchestrator;
pub mod schedule;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use events::{Listener, Notifier};
pub use execution::{
    ErrorRecord, Execution, ExecutionMetrics, ExecutionStatus, LogLevel, StepExecution, StepLog,
    StepStatus, TriggerKind,
};
pub use flow::{ErrorHandling, ExecutionOrder, FlowDefinition, FlowSettings, RetryPolicy};
pub use orchestrator::{FlowEngine, PreparedRun, RunHandle, SubmitRequest};
