//! Execution records and their state machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use flow_processors::ErrorRecord;
use flow_processors::{ProcessingError, Step};

use crate::flow::FlowDefinition;

/// High-level execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, run loop not started.
    Pending,
    /// Run loop is dispatching steps.
    Running,
    /// Run loop parks before the next step.
    Paused,
    /// All steps completed.
    Completed,
    /// A step failed or the run aborted.
    Failed,
    /// Cancelled by a caller.
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the state machine permits moving to `next`.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Cancelled)
                | (Paused, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Completed)
                | (Paused, Failed)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// State of a single step within an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not dispatched yet.
    Pending,
    /// Processor in flight.
    Running,
    /// Output recorded.
    Completed,
    /// Processor failed.
    Failed,
    /// Not attempted because a dependency did not complete.
    Skipped,
    /// In flight when the execution was cancelled.
    Cancelled,
}

impl StepStatus {
    /// Whether the step reached an outcome.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What started an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    #[default]
    Manual,
    Scheduled,
    Api,
    Event,
}

impl std::str::FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(Self::Manual),
            "scheduled" | "schedule" => Ok(Self::Scheduled),
            "api" => Ok(Self::Api),
            "event" => Ok(Self::Event),
            other => Err(format!("unknown trigger kind '{}'", other)),
        }
    }
}

/// Log severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Timestamped entry in a step's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Runtime record of one step's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecution {
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    /// Processor invocations made for this step.
    pub attempts: u32,
    /// Re-attempts after a failure.
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
    /// Append-only.
    pub logs: Vec<StepLog>,
}

impl StepExecution {
    /// Create a pending record for a step.
    pub fn pending(step: &Step) -> Self {
        Self {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            status: StepStatus::Pending,
            start_time: None,
            end_time: None,
            duration_ms: None,
            attempts: 0,
            retry_count: 0,
            output: None,
            error: None,
            logs: Vec::new(),
        }
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(StepLog {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
    }

    /// Enter `running` and stamp the start time.
    pub fn start(&mut self) {
        self.status = StepStatus::Running;
        self.start_time = Some(Utc::now());
        self.log(LogLevel::Info, format!("Step '{}' started", self.step_name));
    }

    fn finish(&mut self, status: StepStatus) {
        let now = Utc::now();
        self.status = status;
        self.end_time = Some(now);
        self.duration_ms = self
            .start_time
            .map(|start| (now - start).num_milliseconds());
    }

    pub fn complete(&mut self, output: serde_json::Value) {
        self.finish(StepStatus::Completed);
        self.output = Some(output);
        self.log(LogLevel::Info, format!("Step '{}' completed", self.step_name));
    }

    pub fn fail(&mut self, err: &ProcessingError) {
        self.finish(StepStatus::Failed);
        self.error = Some(ErrorRecord::from_processing(err));
        self.log(
            LogLevel::Error,
            format!("Step '{}' failed: {}", self.step_name, err),
        );
    }

    pub fn cancel(&mut self) {
        self.finish(StepStatus::Cancelled);
        self.log(LogLevel::Warn, format!("Step '{}' cancelled", self.step_name));
    }

    pub fn skip(&mut self, reason: &str) {
        self.status = StepStatus::Skipped;
        self.log(LogLevel::Warn, format!("Step '{}' skipped: {}", self.step_name, reason));
    }
}

/// Aggregate counters for an execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetrics {
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub skipped_steps: usize,
    /// Serialized bytes of all step outputs.
    pub data_volume: u64,
}

/// One run of a flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: Uuid,
    pub flow_id: String,
    pub flow_version: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub triggered_by: String,
    pub trigger: TriggerKind,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    pub steps: Vec<StepExecution>,
    pub metrics: ExecutionMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl Execution {
    /// New pending execution with one pending record per step.
    pub fn new(
        flow: &FlowDefinition,
        trigger: TriggerKind,
        context: HashMap<String, serde_json::Value>,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id: flow.id.clone(),
            flow_version: flow.version.clone(),
            status: ExecutionStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            triggered_by: actor.into(),
            trigger,
            context,
            steps: flow.steps.iter().map(StepExecution::pending).collect(),
            metrics: ExecutionMetrics {
                total_steps: flow.steps.len(),
                ..Default::default()
            },
            error: None,
        }
    }

    /// Apply a status change if the state machine allows it.
    pub fn transition(&mut self, next: ExecutionStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            let now = Utc::now();
            self.end_time = Some(now);
            self.duration_ms = Some((now - self.start_time).num_milliseconds());
        }
        true
    }

    pub fn step(&self, step_id: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, index: usize) -> &mut StepExecution {
        &mut self.steps[index]
    }

    /// Recount metrics from the step records.
    pub fn refresh_metrics(&mut self) {
        let count = |status: StepStatus| self.steps.iter().filter(|s| s.status == status).count();
        let completed = count(StepStatus::Completed);
        let failed = count(StepStatus::Failed);
        let skipped = count(StepStatus::Skipped);
        let data_volume: u64 = self
            .steps
            .iter()
            .filter_map(|s| s.output.as_ref())
            .map(|o| serde_json::to_vec(o).map(|b| b.len() as u64).unwrap_or(0))
            .sum();

        self.metrics.completed_steps = completed;
        self.metrics.failed_steps = failed;
        self.metrics.skipped_steps = skipped;
        self.metrics.data_volume = data_volume;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flow_processors::StepKind;

    fn flow() -> FlowDefinition {
        FlowDefinition::new(
            "orders-sync",
            "Orders sync",
            vec![
                Step::new("fetch", "Fetch", StepKind::Adapter),
                Step::new("map", "Map", StepKind::Transformation),
            ],
        )
    }

    #[test]
    fn test_new_execution_is_pending() {
        let exec = Execution::new(&flow(), TriggerKind::Manual, HashMap::new(), "alice");
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.steps.len(), 2);
        assert!(exec.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert_eq!(exec.metrics.total_steps, 2);
        assert_eq!(exec.triggered_by, "alice");
    }

    #[test]
    fn test_state_machine() {
        let mut exec = Execution::new(&flow(), TriggerKind::Manual, HashMap::new(), "alice");
        assert!(!exec.transition(ExecutionStatus::Paused));
        assert!(exec.transition(ExecutionStatus::Running));
        assert!(exec.transition(ExecutionStatus::Paused));
        assert!(!exec.transition(ExecutionStatus::Paused));
        assert!(exec.transition(ExecutionStatus::Running));
        assert!(exec.end_time.is_none());
        assert!(exec.transition(ExecutionStatus::Cancelled));
        assert!(exec.end_time.is_some());
        assert!(exec.duration_ms.is_some());

        // terminal states are final
        assert!(!exec.transition(ExecutionStatus::Running));
        assert!(!exec.transition(ExecutionStatus::Completed));
        assert_eq!(exec.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn test_step_lifecycle_and_metrics() {
        let mut exec = Execution::new(&flow(), TriggerKind::Api, HashMap::new(), "scheduler");
        exec.step_mut(0).start();
        exec.step_mut(0).complete(serde_json::json!({"rows": 12}));
        exec.step_mut(1).start();
        exec.step_mut(1).fail(&ProcessingError::Timeout(100));
        exec.refresh_metrics();

        assert_eq!(exec.metrics.completed_steps, 1);
        assert_eq!(exec.metrics.failed_steps, 1);
        assert_eq!(exec.metrics.data_volume, br#"{"rows":12}"#.len() as u64);

        let failed = exec.step("map").unwrap();
        assert_eq!(failed.error.as_ref().unwrap().code, "TIMEOUT");
        assert!(failed.duration_ms.is_some());
        assert_eq!(failed.logs.len(), 2);
        assert_eq!(failed.logs[1].level, LogLevel::Error);
    }

    #[test]
    fn test_trigger_kind_parse() {
        assert_eq!("Scheduled".parse::<TriggerKind>(), Ok(TriggerKind::Scheduled));
        assert!("cron".parse::<TriggerKind>().is_err());
    }

    #[test]
    fn test_execution_serialization() {
        let exec = Execution::new(&flow(), TriggerKind::Manual, HashMap::new(), "alice");
        let json = serde_json::to_value(&exec).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["flowId"], "orders-sync");
        assert_eq!(json["metrics"]["totalSteps"], 2);
        assert_eq!(json["steps"][0]["status"], "pending");
    }
}
