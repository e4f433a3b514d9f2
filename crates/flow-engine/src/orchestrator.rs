//! Flow orchestrator.
//!
//! `FlowEngine` owns the active-execution registry and drives each
//! execution's step loop. Steps run one at a time: each one is validated,
//! then raced against its timeout and the execution's cancellation token.
//! Every published mutation of the execution record is queued for its
//! observers while the record is still locked, so they see updates in the
//! order they were made.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flow_processors::{
    create_default_registry, ExecutionContext, HttpTransport, ProcessingError, ProcessorRegistry,
    Step,
};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{Listener, Notifier};
use crate::execution::{ErrorRecord, Execution, ExecutionStatus, LogLevel, StepStatus, TriggerKind};
use crate::flow::{ErrorHandling, ExecutionOrder, FlowDefinition};
use crate::schedule::{resolve_order, StepGraph};

/// Caller-supplied parameters for one run.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// What started the run.
    pub trigger: TriggerKind,

    /// Variables layered over the flow's own.
    pub context_overrides: HashMap<String, serde_json::Value>,

    /// Who started the run.
    pub actor: String,
}

impl SubmitRequest {
    /// Create a manual request on behalf of `actor`.
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            trigger: TriggerKind::default(),
            context_overrides: HashMap::new(),
            actor: actor.into(),
        }
    }

    /// Set the trigger kind.
    pub fn with_trigger(mut self, trigger: TriggerKind) -> Self {
        self.trigger = trigger;
        self
    }

    /// Override a flow variable.
    pub fn with_variable(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.context_overrides.insert(name.into(), value);
        self
    }
}

impl Default for SubmitRequest {
    fn default() -> Self {
        Self::new("system")
    }
}

/// Shared state of one active execution.
struct ActiveExecution {
    record: Mutex<Execution>,
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
}

impl ActiveExecution {
    fn lock(&self) -> MutexGuard<'_, Execution> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Execution {
        self.lock().clone()
    }

    /// Mutate the record without publishing, unless it is already final.
    fn apply(&self, f: impl FnOnce(&mut Execution)) {
        let mut record = self.lock();
        if !record.status.is_terminal() {
            f(&mut record);
        }
    }

    /// Park while paused. Returns false once the execution is cancelled.
    async fn wait_while_paused(&self) -> bool {
        let mut paused = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}

/// An execution registered as active whose step loop has not started yet.
///
/// Obtained from [`FlowEngine::prepare`]; observers can attach to
/// [`PreparedRun::execution_id`] before the run is handed to [`FlowEngine::run`].
pub struct PreparedRun {
    execution_id: Uuid,
    flow: Arc<FlowDefinition>,
    order: Vec<usize>,
    context: ExecutionContext,
    handle: Arc<ActiveExecution>,
}

impl PreparedRun {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }
}

/// A run executing on a background task.
pub struct RunHandle {
    pub execution_id: Uuid,
    join: JoinHandle<Execution>,
}

impl RunHandle {
    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> EngineResult<Execution> {
        Ok(self.join.await?)
    }
}

enum StepOutcome {
    Completed,
    Failed(ProcessingError),
    Cancelled,
}

enum RunOutcome {
    Finished,
    Aborted(ErrorRecord),
    Cancelled,
}

struct EngineInner {
    registry: Arc<ProcessorRegistry>,
    config: EngineConfig,
    active: DashMap<Uuid, Arc<ActiveExecution>>,
    notifier: Notifier,
}

/// Orchestrator for flow executions.
///
/// Cheap to clone; clones share the same registry and active set.
#[derive(Clone)]
pub struct FlowEngine {
    inner: Arc<EngineInner>,
}

impl FlowEngine {
    /// Create an engine over a processor registry.
    pub fn new(registry: ProcessorRegistry, config: EngineConfig) -> Self {
        let notifier = Notifier::new(config.event_buffer);
        Self {
            inner: Arc::new(EngineInner {
                registry: Arc::new(registry),
                config,
                active: DashMap::new(),
                notifier,
            }),
        }
    }

    /// Create an engine whose processors call the configured backend over HTTP.
    pub fn from_config(config: EngineConfig) -> Self {
        let mut transport = HttpTransport::new(&config.service_url, config.request_timeout());
        if let Some(token) = &config.api_token {
            transport = transport.with_api_token(token.clone());
        }
        Self::new(create_default_registry(Arc::new(transport)), config)
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Register a new execution of `flow` as active without starting it.
    pub fn prepare(&self, flow: &FlowDefinition, request: SubmitRequest) -> EngineResult<PreparedRun> {
        flow.validate()?;
        let order = resolve_order(flow)?;

        let execution = Execution::new(
            flow,
            request.trigger,
            request.context_overrides.clone(),
            request.actor.clone(),
        );
        let execution_id = execution.id;

        let mut context = ExecutionContext::new(&flow.id, execution_id)
            .with_variables(&flow.variables, &request.context_overrides);
        context.set_metadata("trigger", serde_json::json!(request.trigger));
        context.set_metadata("triggeredBy", serde_json::json!(request.actor));

        let (paused, _) = watch::channel(false);
        let handle = Arc::new(ActiveExecution {
            record: Mutex::new(execution),
            cancel: CancellationToken::new(),
            paused,
        });
        self.inner.notifier.open(execution_id);
        self.inner.active.insert(execution_id, handle.clone());

        tracing::debug!(
            execution_id = %execution_id,
            flow_id = %flow.id,
            steps = flow.steps.len(),
            order = ?flow.settings.execution_order,
            "Execution registered"
        );

        Ok(PreparedRun {
            execution_id,
            flow: Arc::new(flow.clone()),
            order,
            context,
            handle,
        })
    }

    /// Drive a prepared execution to a terminal state.
    pub async fn run(&self, prepared: PreparedRun) -> Execution {
        let PreparedRun {
            execution_id,
            flow,
            order,
            mut context,
            handle,
        } = prepared;

        let started = self.update(&handle, |e| {
            e.transition(ExecutionStatus::Running);
        });
        let Some(snapshot) = started else {
            // Cancelled before the loop started.
            return handle.snapshot();
        };

        tracing::info!(
            execution_id = %execution_id,
            flow_id = %flow.id,
            trigger = ?snapshot.trigger,
            triggered_by = %snapshot.triggered_by,
            "Execution started"
        );

        let outcome = self.run_steps(&flow, &order, &mut context, &handle).await;
        self.finish(&handle, outcome)
    }

    /// Prepare and run a flow, returning once it reaches a terminal state.
    pub async fn submit(&self, flow: &FlowDefinition, request: SubmitRequest) -> EngineResult<Execution> {
        let prepared = self.prepare(flow, request)?;
        Ok(self.run(prepared).await)
    }

    /// Prepare a flow and run it on a background task.
    pub fn spawn(&self, flow: &FlowDefinition, request: SubmitRequest) -> EngineResult<RunHandle> {
        let prepared = self.prepare(flow, request)?;
        let execution_id = prepared.execution_id();
        let engine = self.clone();
        let join = tokio::spawn(async move { engine.run(prepared).await });
        Ok(RunHandle { execution_id, join })
    }

    /// Pause a running execution before its next step.
    pub fn pause(&self, execution_id: Uuid) -> EngineResult<bool> {
        let handle = self.active_handle(execution_id)?;
        let mut record = handle.lock();
        if record.status != ExecutionStatus::Running || !record.transition(ExecutionStatus::Paused) {
            return Ok(false);
        }
        handle.paused.send_replace(true);

        tracing::info!(execution_id = %execution_id, "Execution paused");
        self.commit(record);
        Ok(true)
    }

    /// Resume a paused execution.
    pub fn resume(&self, execution_id: Uuid) -> EngineResult<bool> {
        let handle = self.active_handle(execution_id)?;
        let mut record = handle.lock();
        if record.status != ExecutionStatus::Paused || !record.transition(ExecutionStatus::Running) {
            return Ok(false);
        }
        handle.paused.send_replace(false);

        tracing::info!(execution_id = %execution_id, "Execution resumed");
        self.commit(record);
        Ok(true)
    }

    /// Cancel an execution and abort its in-flight step.
    ///
    /// The record is finalized before this returns; the run loop observes
    /// the fired token and stops without touching it again.
    pub fn cancel(&self, execution_id: Uuid) -> EngineResult<bool> {
        let handle = self.active_handle(execution_id)?;
        let mut record = handle.lock();
        if !record.transition(ExecutionStatus::Cancelled) {
            return Ok(false);
        }
        for step in record
            .steps
            .iter_mut()
            .filter(|s| s.status == StepStatus::Running)
        {
            step.cancel();
        }
        record.refresh_metrics();
        handle.cancel.cancel();

        tracing::info!(execution_id = %execution_id, "Execution cancelled");
        self.commit(record);
        Ok(true)
    }

    /// Snapshots of all active executions, oldest first.
    pub fn list_active(&self) -> Vec<Execution> {
        let mut executions: Vec<Execution> = self
            .inner
            .active
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        executions.sort_by_key(|e| e.start_time);
        executions
    }

    /// Snapshot of an active execution.
    pub fn get(&self, execution_id: Uuid) -> Option<Execution> {
        self.active_handle(execution_id).ok().map(|h| h.snapshot())
    }

    /// Register a listener for every update of an active execution.
    pub fn subscribe(&self, execution_id: Uuid, listener: Listener) -> EngineResult<()> {
        if self.inner.notifier.subscribe(execution_id, listener) {
            Ok(())
        } else {
            Err(EngineError::NotFound(execution_id))
        }
    }

    /// Remove one registration of `listener`.
    pub fn unsubscribe(&self, execution_id: Uuid, listener: &Listener) -> bool {
        self.inner.notifier.unsubscribe(execution_id, listener)
    }

    /// Open an update channel for an active execution.
    pub fn watch(&self, execution_id: Uuid) -> EngineResult<broadcast::Receiver<Execution>> {
        self.inner
            .notifier
            .watch(execution_id)
            .ok_or(EngineError::NotFound(execution_id))
    }

    fn active_handle(&self, execution_id: Uuid) -> EngineResult<Arc<ActiveExecution>> {
        self.inner
            .active
            .get(&execution_id)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::NotFound(execution_id))
    }

    /// Mutate an unfinished record and publish the result.
    fn update(&self, handle: &ActiveExecution, f: impl FnOnce(&mut Execution)) -> Option<Execution> {
        let mut record = handle.lock();
        if record.status.is_terminal() {
            return None;
        }
        f(&mut record);
        Some(self.commit(record))
    }

    /// Queue the snapshot of a locked record, unlock it, then deliver.
    ///
    /// A terminal snapshot deregisters the execution before it is delivered.
    fn commit(&self, record: MutexGuard<'_, Execution>) -> Execution {
        let snapshot = record.clone();
        self.inner.notifier.enqueue(&snapshot);
        drop(record);

        if snapshot.status.is_terminal() {
            self.inner.active.remove(&snapshot.id);
        }
        self.inner.notifier.deliver(snapshot.id);
        snapshot
    }

    async fn run_steps(
        &self,
        flow: &FlowDefinition,
        order: &[usize],
        context: &mut ExecutionContext,
        handle: &ActiveExecution,
    ) -> RunOutcome {
        let graph = match flow.settings.execution_order {
            ExecutionOrder::Dependencies => StepGraph::build(flow).ok(),
            ExecutionOrder::Declared => None,
        };

        for &index in order {
            if !handle.wait_while_paused().await {
                return RunOutcome::Cancelled;
            }

            let step = &flow.steps[index];

            if let Some(graph) = &graph {
                if let Some(blocker) = unmet_dependency(handle, graph, index) {
                    let reason = format!("dependency '{}' did not complete", blocker);
                    tracing::warn!(
                        execution_id = %context.execution_id,
                        step_id = %step.id,
                        blocker = %blocker,
                        "Skipping step"
                    );
                    let skipped = self.update(handle, |e| {
                        e.step_mut(index).skip(&reason);
                        e.refresh_metrics();
                    });
                    if skipped.is_none() {
                        return RunOutcome::Cancelled;
                    }
                    continue;
                }
            }

            match self.run_step(flow, step, index, context, handle).await {
                StepOutcome::Completed => {}
                StepOutcome::Cancelled => return RunOutcome::Cancelled,
                StepOutcome::Failed(err) if err.is_configuration() => {
                    tracing::error!(
                        execution_id = %context.execution_id,
                        step_id = %step.id,
                        error = %err,
                        "Configuration error, aborting execution"
                    );
                    return RunOutcome::Aborted(ErrorRecord::from_processing(&err));
                }
                StepOutcome::Failed(err) => match flow.settings.error_handling {
                    ErrorHandling::Continue => {
                        tracing::warn!(
                            execution_id = %context.execution_id,
                            step_id = %step.id,
                            "Continuing after step failure"
                        );
                    }
                    ErrorHandling::Stop | ErrorHandling::Retry => {
                        return RunOutcome::Aborted(ErrorRecord::from_processing(&err));
                    }
                },
            }
        }

        RunOutcome::Finished
    }

    async fn run_step(
        &self,
        flow: &FlowDefinition,
        step: &Step,
        index: usize,
        context: &mut ExecutionContext,
        handle: &ActiveExecution,
    ) -> StepOutcome {
        let execution_id = context.execution_id;
        let timeout = self.step_timeout(flow, step);

        if self.update(handle, |e| e.step_mut(index).start()).is_none() {
            return StepOutcome::Cancelled;
        }
        context.set_current_step(Some(&step.id));

        tracing::info!(
            execution_id = %execution_id,
            step_id = %step.id,
            kind = %step.kind,
            timeout_ms = timeout.as_millis() as u64,
            "Step started"
        );

        let retry_enabled = flow.settings.error_handling == ErrorHandling::Retry;
        let policy = &flow.settings.retry;
        let mut retries = 0u32;

        let result = loop {
            handle.apply(|e| e.step_mut(index).attempts += 1);

            match self.invoke(step, context, &handle.cancel, timeout).await {
                Err(err)
                    if retry_enabled
                        && err.is_retryable()
                        && retries < policy.max_retries
                        && !handle.cancel.is_cancelled() =>
                {
                    retries += 1;
                    let delay = policy.delay_for(retries);

                    tracing::warn!(
                        execution_id = %execution_id,
                        step_id = %step.id,
                        attempt = retries,
                        max_retries = policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Step failed, retrying"
                    );

                    let updated = self.update(handle, |e| {
                        let record = e.step_mut(index);
                        record.retry_count = retries;
                        record.log(
                            LogLevel::Warn,
                            format!(
                                "Attempt {} failed: {}; retrying in {} ms",
                                retries,
                                err,
                                delay.as_millis()
                            ),
                        );
                    });
                    if updated.is_none() {
                        break Err(ProcessingError::Cancelled);
                    }

                    tokio::select! {
                        _ = handle.cancel.cancelled() => break Err(ProcessingError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                other => break other,
            }
        };

        context.set_current_step(None);

        match result {
            Ok(output) => match context.record_result(&step.id, output.clone()) {
                Ok(()) => {
                    if let Some(name) = &step.output_variable {
                        context.set_variable(name.clone(), output.clone());
                    }
                    let completed = self.update(handle, |e| {
                        e.step_mut(index).complete(output);
                        e.refresh_metrics();
                    });
                    match completed {
                        Some(_) => {
                            tracing::info!(
                                execution_id = %execution_id,
                                step_id = %step.id,
                                retries,
                                "Step completed"
                            );
                            StepOutcome::Completed
                        }
                        None => StepOutcome::Cancelled,
                    }
                }
                Err(err) => self.fail_step(handle, step, index, err, retries),
            },
            Err(ProcessingError::Cancelled) if handle.cancel.is_cancelled() => {
                StepOutcome::Cancelled
            }
            Err(err) => self.fail_step(handle, step, index, err, retries),
        }
    }

    fn fail_step(
        &self,
        handle: &ActiveExecution,
        step: &Step,
        index: usize,
        err: ProcessingError,
        retries: u32,
    ) -> StepOutcome {
        let failed = self.update(handle, |e| {
            let record = e.step_mut(index);
            if retries > 0 {
                record.log(LogLevel::Warn, format!("Retries exhausted after {} attempt(s)", retries + 1));
            }
            record.fail(&err);
            e.refresh_metrics();
        });

        match failed {
            Some(snapshot) => {
                tracing::error!(
                    execution_id = %snapshot.id,
                    step_id = %step.id,
                    code = err.code(),
                    error = %err,
                    "Step failed"
                );
                StepOutcome::Failed(err)
            }
            None => StepOutcome::Cancelled,
        }
    }

    /// One processor invocation raced against the timeout and cancellation.
    async fn invoke(
        &self,
        step: &Step,
        context: &ExecutionContext,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<serde_json::Value, ProcessingError> {
        let step_cancel = cancel.child_token();
        let _guard = step_cancel.clone().drop_guard();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProcessingError::Cancelled),
            result = self.inner.registry.process(step, context, step_cancel) => result,
            _ = tokio::time::sleep(timeout) => Err(ProcessingError::Timeout(timeout.as_millis() as u64)),
        }
    }

    fn step_timeout(&self, flow: &FlowDefinition, step: &Step) -> Duration {
        Duration::from_millis(
            step.timeout_ms
                .or(flow.settings.timeout_ms)
                .unwrap_or(self.inner.config.default_step_timeout_ms),
        )
    }

    fn finish(&self, handle: &ActiveExecution, outcome: RunOutcome) -> Execution {
        if matches!(outcome, RunOutcome::Cancelled) {
            return handle.snapshot();
        }

        let finished = self.update(handle, |e| {
            e.refresh_metrics();
            let failed = e.metrics.failed_steps;
            let status = match outcome {
                RunOutcome::Aborted(error) => {
                    e.error = Some(error);
                    ExecutionStatus::Failed
                }
                _ if failed > 0 => {
                    e.error = Some(ErrorRecord::new(
                        "STEPS_FAILED",
                        format!("{} step(s) failed", failed),
                    ));
                    ExecutionStatus::Failed
                }
                _ => ExecutionStatus::Completed,
            };
            e.transition(status);
        });

        let Some(snapshot) = finished else {
            return handle.snapshot();
        };

        tracing::info!(
            execution_id = %snapshot.id,
            flow_id = %snapshot.flow_id,
            status = %snapshot.status,
            completed = snapshot.metrics.completed_steps,
            failed = snapshot.metrics.failed_steps,
            skipped = snapshot.metrics.skipped_steps,
            duration_ms = snapshot.duration_ms.unwrap_or_default(),
            "Execution finished"
        );
        snapshot
    }
}

impl std::fmt::Debug for FlowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowEngine")
            .field("registry", &self.inner.registry)
            .field("active", &self.inner.active.len())
            .finish()
    }
}

/// First dependency of `index` that did not complete, if any.
fn unmet_dependency(handle: &ActiveExecution, graph: &StepGraph, index: usize) -> Option<String> {
    let record = handle.lock();
    graph
        .dependencies_of(index)
        .iter()
        .map(|&dep| &record.steps[dep])
        .find(|dep| dep.status != StepStatus::Completed)
        .map(|dep| dep.step_id.clone())
}
