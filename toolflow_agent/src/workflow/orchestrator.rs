//! Workflow orchestrator.
//!
//! The orchestrator validates a workflow, then runs it as one background
//! task per execution. Steps are dispatched in dependency order to the
//! [`ToolInvoker`]; each dispatched step runs in its own task with its
//! retry policy, per-attempt timeout and the run's cancellation token.
//!
//! # Dispatch
//!
//! The first eligible step in workflow order decides each round:
//! - a sequential step runs alone, once nothing else is running
//! - a parallel step starts together with every other eligible parallel
//!   step, bounded by `max_parallel_steps`
//!
//! After a step fails no new steps start; running steps finish and every
//! step that never started is recorded as skipped.
//!
//! # Control
//!
//! [`pause`](Orchestrator::pause) stops dispatch while running steps finish.
//! [`resume`](Orchestrator::resume) continues it. [`cancel`](Orchestrator::cancel)
//! aborts running tool invocations and discards their results.
//!
//! # Example
//!
//! ```ignore
//! let orchestrator = Orchestrator::new(Arc::new(registry), Monitor::default(), RuntimeConfig::default());
//!
//! let handle = orchestrator.start(workflow, ExecutionOptions::new())?;
//! orchestrator.pause(handle.execution_id())?;
//! orchestrator.resume(handle.execution_id())?;
//! let result = handle.wait().await?;
//! ```

use crate::audit::{AuditEvent, AuditLog};
use crate::workflow::cancellation::{CancellationToken, CancellationTokenSource};
use crate::workflow::context::{ExecutionContext, ExecutionOptions};
use crate::workflow::timeout::{with_timeout, StepTimeout};
use crate::workflow::tools::ToolInvoker;
use crate::{AgentError, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use toolflow_core::{
    ExecutionId, ExecutionRecord, Parameters, ProgressUpdate, RetryPolicy, Step, StepId, StepResult,
    StepState, ValidationReport, Value, Workflow, WorkflowState, WorkflowStatus, WorkflowValidator,
};
use toolflow_runtime::{MetricKind, Monitor, RuntimeConfig, RuntimeMetrics};

/// Instruction from the control operations to a run loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunCommand {
    Run,
    Pause,
    Cancel,
}

/// Control half of an in-flight execution.
struct ActiveRun {
    status: WorkflowStatus,
    commands: watch::Sender<RunCommand>,
    cancel: CancellationTokenSource,
}

/// Live and recently finished executions.
#[derive(Default)]
struct RunTable {
    active: HashMap<ExecutionId, ActiveRun>,
    finished: HashMap<ExecutionId, WorkflowStatus>,
    finished_order: VecDeque<ExecutionId>,
}

impl RunTable {
    fn retire(&mut self, status: WorkflowStatus, capacity: usize) {
        let id = status.execution_id;
        self.finished.insert(id, status);
        self.finished_order.push_back(id);
        while self.finished_order.len() > capacity.max(1) {
            if let Some(evicted) = self.finished_order.pop_front() {
                self.finished.remove(&evicted);
            }
        }
    }
}

/// Outcome of a finished execution.
#[derive(Clone, Debug)]
pub struct WorkflowResult {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    /// Terminal state of the run
    pub state: WorkflowState,
    /// Final status, including every step result
    pub status: WorkflowStatus,
    /// Outputs of completed steps
    pub outputs: BTreeMap<StepId, Value>,
    /// Variable bag at the end of the run
    pub variables: BTreeMap<String, Value>,
    pub audit: Vec<AuditEvent>,
    pub duration: Duration,
}

impl WorkflowResult {
    pub fn is_success(&self) -> bool {
        self.state == WorkflowState::Completed
    }

    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.status
            .step_results
            .iter()
            .find(|r| r.step_id.as_str() == id)
    }

    pub fn output(&self, id: &str) -> Option<&Value> {
        self.outputs.get(&StepId::new(id))
    }
}

/// Handle to an execution running in the background.
#[derive(Debug)]
pub struct ExecutionHandle {
    execution_id: ExecutionId,
    handle: JoinHandle<WorkflowResult>,
}

impl ExecutionHandle {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the execution to reach a terminal state.
    pub async fn wait(self) -> Result<WorkflowResult> {
        Ok(self.handle.await?)
    }
}

/// Executes validated workflows against a tool collaborator.
///
/// Cheap to clone; clones share the run table, monitor and metrics.
#[derive(Clone)]
pub struct Orchestrator {
    tools: Arc<dyn ToolInvoker>,
    monitor: Monitor,
    metrics: RuntimeMetrics,
    config: Arc<RuntimeConfig>,
    validator: WorkflowValidator,
    audit_dir: Option<PathBuf>,
    runs: Arc<Mutex<RunTable>>,
}

impl Orchestrator {
    /// Creates an orchestrator.
    ///
    /// # Arguments
    ///
    /// * `tools` - Collaborator that executes step tools
    /// * `monitor` - Receives progress updates and finished records
    /// * `config` - Runtime limits and defaults
    pub fn new(tools: Arc<dyn ToolInvoker>, monitor: Monitor, config: RuntimeConfig) -> Self {
        Self {
            tools,
            monitor,
            metrics: RuntimeMetrics::new(),
            config: Arc::new(config),
            validator: WorkflowValidator::new(),
            audit_dir: None,
            runs: Arc::new(Mutex::new(RunTable::default())),
        }
    }

    /// Persists each run's audit trail to `{dir}/{execution_id}.json`.
    pub fn with_audit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.audit_dir = Some(dir.into());
        self
    }

    /// Shares an existing metrics collector.
    pub fn with_metrics(mut self, metrics: RuntimeMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Checks a workflow's structure without running it.
    pub fn validate(&self, workflow: &Workflow) -> ValidationReport {
        self.validator.validate(workflow)
    }

    /// Runs a workflow to completion.
    ///
    /// Step failures do not produce an `Err`: the result carries
    /// [`WorkflowState::Failed`] and the failing step's record.
    ///
    /// # Returns
    ///
    /// - `Ok(WorkflowResult)` once the run is terminal
    /// - `Err(AgentError::Validation)` if the workflow is structurally invalid
    pub async fn orchestrate(&self, workflow: Workflow) -> Result<WorkflowResult> {
        self.orchestrate_with(workflow, ExecutionOptions::default())
            .await
    }

    /// Runs a workflow to completion with caller-supplied variables,
    /// metadata and security context.
    pub async fn orchestrate_with(
        &self,
        workflow: Workflow,
        options: ExecutionOptions,
    ) -> Result<WorkflowResult> {
        self.start(workflow, options)?.wait().await
    }

    /// Validates a workflow and starts it in the background.
    ///
    /// Must be called from within a Tokio runtime. The execution is already
    /// `running` when this returns, so it can be paused or cancelled at once.
    pub fn start(&self, workflow: Workflow, options: ExecutionOptions) -> Result<ExecutionHandle> {
        let report = self.validate(&workflow);
        if !report.is_valid() {
            tracing::warn!(
                workflow_id = %workflow.id(),
                errors = report.errors().len(),
                "Rejecting invalid workflow"
            );
            return Err(AgentError::Validation(report));
        }

        let execution_id = ExecutionId::new();
        let (commands, receiver) = watch::channel(RunCommand::Run);
        let cancel = CancellationTokenSource::new();
        let token = cancel.token();

        let mut audit = match &self.audit_dir {
            Some(dir) => AuditLog::with_dir(execution_id, dir),
            None => AuditLog::new(execution_id),
        };
        audit.record(AuditEvent::WorkflowStarted {
            timestamp: Utc::now(),
            workflow_id: workflow.id().to_string(),
            step_count: workflow.step_count(),
            principal: options.security.as_ref().map(|s| s.principal.clone()),
        });

        let context = ExecutionContext::new(workflow.id(), execution_id, options);
        let states = workflow
            .steps()
            .iter()
            .map(|step| (step.id().clone(), StepState::Pending))
            .collect();

        let mut status = WorkflowStatus::new(&workflow, execution_id);
        status.transition(WorkflowState::Running);
        self.lock_runs().active.insert(
            execution_id,
            ActiveRun {
                status,
                commands,
                cancel,
            },
        );

        let run = Run {
            orchestrator: self.clone(),
            workflow: Arc::new(workflow),
            context,
            audit,
            commands: receiver,
            last_command: RunCommand::Run,
            token,
            states,
            outputs: BTreeMap::new(),
            running: HashSet::new(),
            tasks: JoinSet::new(),
            failed: false,
            started: Instant::now(),
        };
        let handle = tokio::spawn(run.execute());

        Ok(ExecutionHandle {
            execution_id,
            handle,
        })
    }

    /// Current status of a live or recently finished execution.
    pub fn status(&self, execution_id: ExecutionId) -> Option<WorkflowStatus> {
        let runs = self.lock_runs();
        runs.active
            .get(&execution_id)
            .map(|run| run.status.clone())
            .or_else(|| runs.finished.get(&execution_id).cloned())
    }

    /// Ids of executions that have not reached a terminal state.
    pub fn active_executions(&self) -> Vec<ExecutionId> {
        self.lock_runs().active.keys().copied().collect()
    }

    /// Pauses a running execution. Running steps finish; no new step starts.
    pub fn pause(&self, execution_id: ExecutionId) -> Result<()> {
        self.control(execution_id, WorkflowState::Paused, "pause", RunCommand::Pause)
    }

    /// Resumes a paused execution.
    pub fn resume(&self, execution_id: ExecutionId) -> Result<()> {
        self.control(execution_id, WorkflowState::Running, "resume", RunCommand::Run)
    }

    /// Cancels a running or paused execution.
    ///
    /// The state becomes `cancelled` immediately. Running tool invocations
    /// are aborted and their results discarded.
    pub fn cancel(&self, execution_id: ExecutionId) -> Result<()> {
        self.control(
            execution_id,
            WorkflowState::Cancelled,
            "cancel",
            RunCommand::Cancel,
        )
    }

    fn control(
        &self,
        execution_id: ExecutionId,
        next: WorkflowState,
        operation: &'static str,
        command: RunCommand,
    ) -> Result<()> {
        let update = {
            let mut runs = self.lock_runs();
            let Some(run) = runs.active.get_mut(&execution_id) else {
                return Err(match runs.finished.get(&execution_id) {
                    Some(status) => AgentError::InvalidState {
                        state: status.state,
                        operation,
                    },
                    None => AgentError::ExecutionNotFound(execution_id),
                });
            };

            let current = run.status.state;
            if !run.status.transition(next) {
                return Err(AgentError::InvalidState {
                    state: current,
                    operation,
                });
            }
            run.commands.send_replace(command);
            if command == RunCommand::Cancel {
                run.cancel.cancel();
            }
            tracing::info!(%execution_id, from = %current, to = %next, "Execution {}", operation);

            // The run loop publishes the terminal update once it has settled.
            (!next.is_terminal()).then(|| run.status.to_update(None))
        };

        if let Some(update) = update {
            self.monitor.publish(&update);
        }
        Ok(())
    }

    /// Non-terminal snapshot of a live execution.
    fn live_update(&self, execution_id: ExecutionId) -> Option<ProgressUpdate> {
        self.lock_runs()
            .active
            .get(&execution_id)
            .map(|run| run.status.to_update(None))
            .filter(|update| !update.is_final())
    }

    fn lock_runs(&self) -> std::sync::MutexGuard<'_, RunTable> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `f` to a live status and returns the resulting update.
    fn update_status<F>(
        &self,
        execution_id: ExecutionId,
        step: Option<(&StepId, StepState)>,
        f: F,
    ) -> Option<ProgressUpdate>
    where
        F: FnOnce(&mut WorkflowStatus),
    {
        let mut runs = self.lock_runs();
        let run = runs.active.get_mut(&execution_id)?;
        f(&mut run.status);
        Some(run.status.to_update(step))
    }

    fn publish_status<F>(&self, execution_id: ExecutionId, step: Option<(&StepId, StepState)>, f: F)
    where
        F: FnOnce(&mut WorkflowStatus),
    {
        if let Some(update) = self.update_status(execution_id, step, f) {
            self.monitor.publish(&update);
        }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("audit_dir", &self.audit_dir)
            .finish_non_exhaustive()
    }
}

/// Background state of one execution.
struct Run {
    orchestrator: Orchestrator,
    workflow: Arc<Workflow>,
    context: ExecutionContext,
    audit: AuditLog,
    commands: watch::Receiver<RunCommand>,
    last_command: RunCommand,
    token: CancellationToken,
    states: HashMap<StepId, StepState>,
    outputs: BTreeMap<StepId, Value>,
    running: HashSet<StepId>,
    tasks: JoinSet<StepReport>,
    failed: bool,
    started: Instant,
}

impl Run {
    fn execution_id(&self) -> ExecutionId {
        self.context.execution_id
    }

    async fn execute(mut self) -> WorkflowResult {
        let execution_id = self.execution_id();
        tracing::info!(
            workflow_id = %self.workflow.id(),
            %execution_id,
            steps = self.workflow.step_count(),
            "Workflow started"
        );

        // A cancel issued before this task first ran is settled by `finish`.
        if let Some(update) = self.orchestrator.live_update(execution_id) {
            self.orchestrator.monitor.publish(&update);
        }
        self.drive().await;

        self.finish().await
    }

    async fn drive(&mut self) {
        let mut commands_open = true;
        loop {
            let command = *self.commands.borrow_and_update();
            if command != self.last_command {
                self.audit_command(command);
                self.last_command = command;
            }

            if command == RunCommand::Run && !self.failed && !self.token.is_cancelled() {
                self.dispatch();
            }

            if self.tasks.is_empty() {
                // A paused run stays open until it is resumed or cancelled.
                if command == RunCommand::Pause && commands_open {
                    if self.commands.changed().await.is_err() {
                        commands_open = false;
                    }
                    continue;
                }
                break;
            }

            tokio::select! {
                joined = self.tasks.join_next() => match joined {
                    Some(Ok(report)) => self.record(report),
                    Some(Err(e)) => {
                        tracing::error!(execution_id = %self.execution_id(), error = %e, "Step task panicked");
                        self.failed = true;
                    }
                    None => {}
                },
                changed = self.commands.changed(), if commands_open => {
                    if changed.is_err() {
                        commands_open = false;
                    }
                }
            }
        }
    }

    fn is_eligible(&self, step: &Step) -> bool {
        self.states.get(step.id()) == Some(&StepState::Pending)
            && step
                .dependencies()
                .iter()
                .all(|dep| self.states.get(dep) == Some(&StepState::Completed))
    }

    fn dispatch(&mut self) {
        let workflow = Arc::clone(&self.workflow);
        let eligible: Vec<&Step> = workflow
            .steps()
            .iter()
            .filter(|step| self.is_eligible(step))
            .collect();

        let Some(first) = eligible.first() else {
            return;
        };

        if !first.is_parallel() {
            if self.running.is_empty() {
                self.launch(first);
            }
            return;
        }

        let sequential_running = self
            .running
            .iter()
            .any(|id| workflow.step(id).is_some_and(|step| !step.is_parallel()));
        if sequential_running {
            return;
        }

        let limit = self.orchestrator.config.max_parallel_steps.max(1);
        let capacity = limit.saturating_sub(self.running.len());
        for step in eligible
            .into_iter()
            .filter(|step| step.is_parallel())
            .take(capacity)
        {
            self.launch(step);
        }
    }

    fn launch(&mut self, step: &Step) {
        let execution_id = self.execution_id();
        let step_id = step.id().clone();
        let config = &self.orchestrator.config;

        let runner = StepRunner {
            step_id: step_id.clone(),
            tool_id: step.tool_id().to_string(),
            parameters: self.context.resolve(step.parameters()),
            retry: step.retry_policy().cloned(),
            max_attempts: step
                .retry_policy()
                .map_or(1, |policy| policy.attempts())
                .min(config.max_retry_attempts.max(1)),
            timeout: StepTimeout::for_step(step, config.default_step_timeout),
            tools: Arc::clone(&self.orchestrator.tools),
            metrics: self.orchestrator.metrics.clone(),
            token: self.token.clone(),
        };

        tracing::debug!(%execution_id, step_id = %step_id, tool = step.tool_id(), "Step started");
        self.states.insert(step_id.clone(), StepState::Running);
        self.running.insert(step_id.clone());
        self.audit.record(AuditEvent::StepStarted {
            timestamp: Utc::now(),
            step_id: step_id.clone(),
            tool_id: step.tool_id().to_string(),
        });
        self.orchestrator.publish_status(
            execution_id,
            Some((&step_id, StepState::Running)),
            |status| status.step_started(step_id.clone()),
        );

        self.tasks.spawn(runner.run());
    }

    fn record(&mut self, report: StepReport) {
        let execution_id = self.execution_id();
        let step_id = report.step_id.clone();
        self.running.remove(&step_id);

        for failure in &report.failures {
            if failure.timed_out {
                self.audit.record(AuditEvent::StepTimedOut {
                    timestamp: failure.at,
                    step_id: step_id.clone(),
                    attempt: failure.attempt,
                    timeout_ms: report
                        .timeout
                        .map_or(0, |t| u64::try_from(t.duration().as_millis()).unwrap_or(u64::MAX)),
                });
            }
            if failure.attempt < report.attempts {
                self.audit.record(AuditEvent::StepRetried {
                    timestamp: failure.at,
                    step_id: step_id.clone(),
                    attempt: failure.attempt,
                    error: failure.error.clone(),
                });
            }
        }

        let retry_count = report.attempts.saturating_sub(1);
        let outcome = if self.token.is_cancelled() {
            StepOutcome::Cancelled
        } else {
            report.outcome
        };

        let result = match outcome {
            StepOutcome::Completed(output) => {
                tracing::debug!(%execution_id, step_id = %step_id, retry_count, "Step completed");
                self.context.set_step_output(&step_id, output.clone());
                self.outputs.insert(step_id.clone(), output.clone());
                self.audit.record(AuditEvent::StepCompleted {
                    timestamp: Utc::now(),
                    step_id: step_id.clone(),
                    retry_count,
                });
                StepResult::completed(step_id.clone(), output, report.started_at, retry_count)
            }
            StepOutcome::Failed(error) => {
                tracing::warn!(%execution_id, step_id = %step_id, retry_count, error = %error, "Step failed");
                self.failed = true;
                self.audit.record(AuditEvent::StepFailed {
                    timestamp: Utc::now(),
                    step_id: step_id.clone(),
                    error: error.clone(),
                    retry_count,
                });
                StepResult::failed(step_id.clone(), error, report.started_at, retry_count)
            }
            StepOutcome::Cancelled => {
                tracing::debug!(%execution_id, step_id = %step_id, "Step cancelled");
                self.audit.record(AuditEvent::StepCancelled {
                    timestamp: Utc::now(),
                    step_id: step_id.clone(),
                });
                let mut result = StepResult::cancelled(step_id.clone(), report.started_at);
                result.retry_count = retry_count;
                result
            }
        };

        let state = result.state;
        self.states.insert(step_id.clone(), state);
        self.orchestrator
            .publish_status(execution_id, Some((&step_id, state)), |status| {
                status.record_step(result)
            });
    }

    fn audit_command(&mut self, command: RunCommand) {
        let timestamp = Utc::now();
        let event = match (self.last_command, command) {
            (_, RunCommand::Pause) => AuditEvent::Paused { timestamp },
            (_, RunCommand::Cancel) => AuditEvent::Cancelled { timestamp },
            (RunCommand::Pause, RunCommand::Run) => AuditEvent::Resumed { timestamp },
            _ => return,
        };
        self.audit.record(event);
    }

    async fn finish(mut self) -> WorkflowResult {
        let execution_id = self.execution_id();

        let skipped: Vec<StepResult> = self
            .workflow
            .steps()
            .iter()
            .filter(|step| !self.states.get(step.id()).is_some_and(StepState::is_terminal))
            .map(|step| StepResult::skipped(step.id().clone()))
            .collect();
        for result in &skipped {
            self.states.insert(result.step_id.clone(), StepState::Skipped);
            self.audit.record(AuditEvent::StepSkipped {
                timestamp: result.finished_at,
                step_id: result.step_id.clone(),
            });
        }

        let all_completed = self
            .states
            .values()
            .all(|state| *state == StepState::Completed);
        let target = if self.token.is_cancelled() {
            WorkflowState::Cancelled
        } else if all_completed {
            WorkflowState::Completed
        } else {
            WorkflowState::Failed
        };

        let status = {
            let mut runs = self.orchestrator.lock_runs();
            let mut status = match runs.active.remove(&execution_id) {
                Some(run) => run.status,
                None => WorkflowStatus::new(&self.workflow, execution_id),
            };
            for result in skipped {
                status.record_step(result);
            }
            if !status.state.is_terminal() {
                if status.state == WorkflowState::Paused {
                    status.transition(WorkflowState::Running);
                }
                status.transition(target);
            }
            runs.retire(status.clone(), self.orchestrator.config.finished_status_capacity);
            status
        };

        let monitor = &self.orchestrator.monitor;
        monitor.record_execution(ExecutionRecord::from_status(self.workflow.name(), &status));
        monitor.publish(&status.to_update(None));

        let metric = match status.state {
            WorkflowState::Completed => MetricKind::WorkflowCompleted,
            WorkflowState::Cancelled => MetricKind::WorkflowCancelled,
            _ => MetricKind::WorkflowFailed,
        };
        self.orchestrator.metrics.record(metric);

        self.audit.record(AuditEvent::WorkflowFinished {
            timestamp: Utc::now(),
            state: status.state,
            completed_steps: status.progress.completed,
            failed_steps: status.progress.failed,
        });
        if let Err(e) = self.audit.persist().await {
            tracing::warn!(%execution_id, error = %e, "Failed to persist audit trail");
        }

        let duration = self.started.elapsed();
        tracing::info!(
            workflow_id = %status.workflow_id,
            %execution_id,
            state = %status.state,
            completed = status.progress.completed,
            failed = status.progress.failed,
            duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
            "Workflow finished"
        );

        WorkflowResult {
            execution_id,
            workflow_id: status.workflow_id.clone(),
            state: status.state,
            status,
            outputs: self.outputs,
            variables: self.context.variables,
            audit: self.audit.into_events(),
            duration,
        }
    }
}

/// Final outcome of a step's attempt chain.
#[derive(Debug)]
enum StepOutcome {
    Completed(Value),
    Failed(String),
    Cancelled,
}

#[derive(Debug)]
struct AttemptFailure {
    attempt: u32,
    error: String,
    timed_out: bool,
    at: DateTime<Utc>,
}

/// What a step task hands back to its run loop.
#[derive(Debug)]
struct StepReport {
    step_id: StepId,
    started_at: DateTime<Utc>,
    outcome: StepOutcome,
    attempts: u32,
    failures: Vec<AttemptFailure>,
    timeout: Option<StepTimeout>,
}

enum Attempt {
    Succeeded(Value),
    Failed {
        error: String,
        retryable: bool,
        timed_out: bool,
    },
    Cancelled,
}

/// Runs one step's attempt chain inside its own task.
struct StepRunner {
    step_id: StepId,
    tool_id: String,
    parameters: Parameters,
    retry: Option<RetryPolicy>,
    max_attempts: u32,
    timeout: Option<StepTimeout>,
    tools: Arc<dyn ToolInvoker>,
    metrics: RuntimeMetrics,
    token: CancellationToken,
}

impl StepRunner {
    async fn run(self) -> StepReport {
        let started_at = Utc::now();
        let mut failures = Vec::new();
        let mut attempt = 0;

        let outcome = loop {
            attempt += 1;
            if attempt > 1 {
                let delay = self.retry_delay(attempt - 1);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.token.cancelled() => break StepOutcome::Cancelled,
                    }
                }
                self.metrics.record(MetricKind::StepRetried);
            }

            self.metrics.record(MetricKind::StepDispatched);
            let attempt_started = Instant::now();
            let result = self.attempt().await;
            self.metrics.record_step_time(attempt_started.elapsed());

            match result {
                Attempt::Succeeded(value) => break StepOutcome::Completed(value),
                Attempt::Cancelled => break StepOutcome::Cancelled,
                Attempt::Failed {
                    error,
                    retryable,
                    timed_out,
                } => {
                    if timed_out {
                        self.metrics.record(MetricKind::StepTimedOut);
                    }
                    failures.push(AttemptFailure {
                        attempt,
                        error: error.clone(),
                        timed_out,
                        at: Utc::now(),
                    });

                    if !retryable || attempt >= self.max_attempts {
                        self.metrics.record(MetricKind::StepFailed);
                        break StepOutcome::Failed(error);
                    }
                    tracing::warn!(
                        step_id = %self.step_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %error,
                        "Step attempt failed, retrying"
                    );
                }
            }
        };

        StepReport {
            step_id: self.step_id,
            started_at,
            outcome,
            attempts: attempt,
            failures,
            timeout: self.timeout,
        }
    }

    /// One tool invocation, bounded by the timeout and the run's token.
    async fn attempt(&self) -> Attempt {
        let tools = Arc::clone(&self.tools);
        let tool_id = self.tool_id.clone();
        let parameters = self.parameters.clone();
        let mut invocation =
            tokio::spawn(async move { tools.invoke(&tool_id, &parameters).await });

        let finished = tokio::select! {
            result = with_timeout(&self.step_id, self.timeout, &mut invocation) => Some(result),
            _ = self.token.cancelled() => None,
        };

        match finished {
            None => {
                invocation.abort();
                Attempt::Cancelled
            }
            Some(Ok(Ok(Ok(value)))) => Attempt::Succeeded(value),
            Some(Ok(Ok(Err(e)))) => Attempt::Failed {
                error: e.to_string(),
                retryable: e.is_retryable(),
                timed_out: false,
            },
            Some(Ok(Err(e))) => Attempt::Failed {
                error: format!("Tool invocation panicked: {}", e),
                retryable: true,
                timed_out: false,
            },
            Some(Err(e)) => {
                invocation.abort();
                tracing::warn!(step_id = %self.step_id, error = %e, "Step attempt timed out");
                Attempt::Failed {
                    error: e.to_string(),
                    retryable: true,
                    timed_out: true,
                }
            }
        }
    }

    fn retry_delay(&self, retry: u32) -> Duration {
        let Some(policy) = &self.retry else {
            return Duration::ZERO;
        };
        let delay = policy.delay_for(retry);
        if policy.jitter {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::tools::{FnTool, ToolError, ToolRegistry};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> ToolRegistry {
        ToolRegistry::new()
            .with_tool(FnTool::new("ok", |params: Parameters| async move {
                Ok(Value::Map(params))
            }))
            .with_tool(FnTool::new("fail", |_| async {
                Err(ToolError::ExecutionFailed("boom".to_string()))
            }))
            .with_tool(FnTool::new("sleep", |params: Parameters| async move {
                let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(100);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::from("slept"))
            }))
    }

    fn orchestrator(registry: ToolRegistry, config: RuntimeConfig) -> Orchestrator {
        Orchestrator::new(Arc::new(registry), Monitor::default(), config)
    }

    /// Tool that records the highest number of concurrent invocations.
    fn concurrency_probe(peak: Arc<AtomicUsize>) -> impl crate::workflow::tools::Tool {
        let current = Arc::new(AtomicUsize::new(0));
        FnTool::new("probe", move |_| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(Value::Bool(true))
            }
        })
    }

    #[tokio::test]
    async fn test_outputs_flow_into_dependents() {
        let workflow = Workflow::builder("chain")
            .step(Step::new("a", "ok").param("x", 1))
            .step(Step::new("b", "ok").depends_on("a").param("input", "${a.output}"))
            .build();

        let result = orchestrator(registry(), RuntimeConfig::default())
            .orchestrate(workflow)
            .await
            .unwrap();

        assert!(result.is_success());
        let b = result.output("b").unwrap().as_map().unwrap();
        assert_eq!(b["input"].as_map().unwrap()["x"], Value::from(1));
        assert!(result.variables.contains_key("a.output"));
    }

    #[tokio::test]
    async fn test_failure_skips_dependents() {
        let workflow = Workflow::builder("broken")
            .step(Step::new("a", "fail"))
            .step(Step::new("b", "ok").depends_on("a"))
            .build();

        let result = orchestrator(registry(), RuntimeConfig::default())
            .orchestrate(workflow)
            .await
            .unwrap();

        assert_eq!(result.state, WorkflowState::Failed);
        assert_eq!(result.step("a").unwrap().state, StepState::Failed);
        assert_eq!(result.step("a").unwrap().retry_count, 0);
        assert_eq!(result.step("b").unwrap().state, StepState::Skipped);
        assert_eq!(result.status.progress.failed, 1);
        assert!(result
            .audit
            .iter()
            .any(|e| matches!(e, AuditEvent::StepSkipped { step_id, .. } if step_id.as_str() == "b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = ToolRegistry::new().with_tool(FnTool::new("flaky", move |_| {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ToolError::ExecutionFailed("not yet".to_string()))
                } else {
                    Ok(Value::from("done"))
                }
            }
        }));
        let workflow = Workflow::builder("retry")
            .step(Step::new("a", "flaky").with_retry(RetryPolicy::fixed(3, Duration::from_secs(1))))
            .build();

        let orchestrator = orchestrator(registry, RuntimeConfig::default());
        let result = orchestrator.orchestrate(workflow).await.unwrap();

        assert!(result.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.step("a").unwrap().retry_count, 2);
        let retries = result
            .audit
            .iter()
            .filter(|e| matches!(e, AuditEvent::StepRetried { .. }))
            .count();
        assert_eq!(retries, 2);
        assert_eq!(orchestrator.metrics().count(MetricKind::StepRetried), 2);
        assert_eq!(orchestrator.metrics().count(MetricKind::StepDispatched), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_retries() {
        let registry = ToolRegistry::new().with_tool(FnTool::new("strict", |_| async {
            Err(ToolError::invalid_parameters("strict", "missing 'url'"))
        }));
        let workflow = Workflow::builder("strict")
            .step(Step::new("a", "strict").with_retry(RetryPolicy::fixed(5, Duration::ZERO)))
            .build();

        let result = orchestrator(registry, RuntimeConfig::default())
            .orchestrate(workflow)
            .await
            .unwrap();

        let a = result.step("a").unwrap();
        assert_eq!(a.state, StepState::Failed);
        assert_eq!(a.retry_count, 0);
        assert!(a.error.as_deref().unwrap().contains("missing 'url'"));
    }

    #[tokio::test]
    async fn test_retry_attempts_capped_by_config() {
        let config = RuntimeConfig {
            max_retry_attempts: 2,
            ..RuntimeConfig::default()
        };
        let workflow = Workflow::builder("capped")
            .step(Step::new("a", "fail").with_retry(RetryPolicy::fixed(5, Duration::ZERO)))
            .build();

        let result = orchestrator(registry(), config)
            .orchestrate(workflow)
            .await
            .unwrap();

        assert_eq!(result.step("a").unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_applies_per_attempt() {
        let workflow = Workflow::builder("slow")
            .step(
                Step::new("a", "sleep")
                    .param("ms", 10_000)
                    .with_timeout(Duration::from_millis(100))
                    .with_retry(RetryPolicy::fixed(2, Duration::ZERO)),
            )
            .build();

        let orchestrator = orchestrator(registry(), RuntimeConfig::default());
        let result = orchestrator.orchestrate(workflow).await.unwrap();

        let a = result.step("a").unwrap();
        assert_eq!(a.state, StepState::Failed);
        assert_eq!(a.retry_count, 1);
        assert!(a.error.as_deref().unwrap().contains("timeout"));
        assert_eq!(orchestrator.metrics().count(MetricKind::StepTimedOut), 2);
        assert!(result.duration < Duration::from_secs(1));

        let timeouts: Vec<u64> = result
            .audit
            .iter()
            .filter_map(|e| match e {
                AuditEvent::StepTimedOut { timeout_ms, .. } => Some(*timeout_ms),
                _ => None,
            })
            .collect();
        assert_eq!(timeouts, vec![100, 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_timeout_from_config() {
        let config = RuntimeConfig {
            default_step_timeout: Some(Duration::from_millis(50)),
            ..RuntimeConfig::default()
        };
        let workflow = Workflow::builder("slow")
            .step(Step::new("a", "sleep").param("ms", 1_000))
            .build();

        let result = orchestrator(registry(), config)
            .orchestrate(workflow)
            .await
            .unwrap();

        assert_eq!(result.state, WorkflowState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_steps_bounded_by_config() {
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new().with_tool(concurrency_probe(Arc::clone(&peak)));
        let config = RuntimeConfig {
            max_parallel_steps: 2,
            ..RuntimeConfig::default()
        };
        let workflow = Workflow::builder("fan")
            .steps((0..4).map(|i| Step::new(format!("p{}", i), "probe").parallel()))
            .build();

        let result = orchestrator(registry, config)
            .orchestrate(workflow)
            .await
            .unwrap();

        assert!(result.is_success());
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_steps_run_alone() {
        let peak = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new().with_tool(concurrency_probe(Arc::clone(&peak)));
        let workflow = Workflow::builder("seq")
            .step(Step::new("a", "probe").parallel())
            .step(Step::new("b", "probe"))
            .step(Step::new("c", "probe").parallel())
            .build();

        let result = orchestrator(registry, RuntimeConfig::default())
            .orchestrate(workflow)
            .await
            .unwrap();

        assert!(result.is_success());
        // a and c share a round; b never overlaps them.
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        let started: Vec<&str> = result
            .audit
            .iter()
            .filter_map(|e| match e {
                AuditEvent::StepStarted { step_id, .. } => Some(step_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["a", "c", "b"]);
    }

    #[tokio::test]
    async fn test_invalid_workflow_rejected_before_running() {
        let workflow = Workflow::builder("cyclic")
            .step(Step::new("a", "ok").depends_on("b"))
            .step(Step::new("b", "ok").depends_on("a"))
            .build();
        let orchestrator = orchestrator(registry(), RuntimeConfig::default());

        let err = orchestrator.orchestrate(workflow.clone()).await.unwrap_err();

        match err {
            AgentError::Validation(report) => {
                assert!(report.has_error(toolflow_core::IssueKind::Cycle))
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(orchestrator.monitor().history(workflow.id(), 10).is_empty());
        assert!(orchestrator.active_executions().is_empty());
    }

    #[tokio::test]
    async fn test_progress_updates_reach_subscribers() {
        let orchestrator = orchestrator(registry(), RuntimeConfig::default());
        let workflow = Workflow::builder("observed")
            .step(Step::new("a", "ok"))
            .step(Step::new("b", "ok").depends_on("a"))
            .build();

        let handle = orchestrator.start(workflow, ExecutionOptions::new()).unwrap();
        let (subscription, mut updates) = orchestrator
            .monitor()
            .subscribe_channel(handle.execution_id());
        let result = handle.wait().await.unwrap();
        subscription.detach();

        let mut received = Vec::new();
        while let Ok(update) = updates.try_recv() {
            received.push(update);
        }

        assert_eq!(received.first().unwrap().state, WorkflowState::Running);
        let last = received.last().unwrap();
        assert!(last.is_final());
        assert_eq!(last.state, WorkflowState::Completed);
        assert_eq!(last.progress.completed, 2);
        assert!(received
            .iter()
            .any(|u| u.step.as_ref().map(StepId::as_str) == Some("b")
                && u.step_state == Some(StepState::Completed)));
        assert_eq!(
            orchestrator.status(result.execution_id).unwrap().state,
            WorkflowState::Completed
        );
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let orchestrator = orchestrator(registry(), RuntimeConfig::default());
        let id = ExecutionId::new();

        assert!(orchestrator.status(id).is_none());
        assert!(matches!(
            orchestrator.cancel(id),
            Err(AgentError::ExecutionNotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_finished_statuses_are_bounded() {
        let config = RuntimeConfig {
            finished_status_capacity: 1,
            ..RuntimeConfig::default()
        };
        let orchestrator = orchestrator(registry(), config);
        let workflow = Workflow::builder("w").step(Step::new("a", "ok")).build();

        let first = orchestrator.orchestrate(workflow.clone()).await.unwrap();
        let second = orchestrator.orchestrate(workflow).await.unwrap();

        assert!(orchestrator.status(first.execution_id).is_none());
        assert!(orchestrator.status(second.execution_id).is_some());
    }
}
