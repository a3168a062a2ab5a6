//! Execution state machines and status records.
//!
//! [`WorkflowState`] and [`StepState`] are the per-run and per-step
//! lifecycles. [`WorkflowStatus`] is the live, pollable view of one
//! execution; [`ProgressUpdate`] is the event pushed to subscribers on every
//! step transition.

use crate::model::{StepId, Workflow};
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of one workflow execution.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    /// Generates a fresh random execution id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a workflow execution.
///
/// ```text
/// pending -> running -> paused <-> running
///                    -> completed | failed | cancelled
/// ```
///
/// `completed`, `failed` and `cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowState {
    /// Returns true if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    /// Returns whether the state machine permits `self -> next`.
    pub fn can_transition_to(&self, next: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Paused => "paused",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Lifecycle of a single step within one execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Pending,
    Running,
    Completed,
    Failed,
    /// Never started because the run failed or was cancelled first
    Skipped,
    /// Was running when the run was cancelled; its result was discarded
    Cancelled,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepState::Pending | StepState::Running)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
            StepState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Terminal outcome of one step's attempt chain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub state: StepState,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    /// Attempts beyond the first one
    pub retry_count: u32,
}

impl StepResult {
    pub fn completed(
        step_id: StepId,
        output: Value,
        started_at: DateTime<Utc>,
        retry_count: u32,
    ) -> Self {
        Self {
            step_id,
            state: StepState::Completed,
            output: Some(output),
            error: None,
            started_at: Some(started_at),
            finished_at: Utc::now(),
            retry_count,
        }
    }

    pub fn failed(
        step_id: StepId,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        retry_count: u32,
    ) -> Self {
        Self {
            step_id,
            state: StepState::Failed,
            output: None,
            error: Some(error.into()),
            started_at: Some(started_at),
            finished_at: Utc::now(),
            retry_count,
        }
    }

    pub fn cancelled(step_id: StepId, started_at: DateTime<Utc>) -> Self {
        Self {
            step_id,
            state: StepState::Cancelled,
            output: None,
            error: None,
            started_at: Some(started_at),
            finished_at: Utc::now(),
            retry_count: 0,
        }
    }

    pub fn skipped(step_id: StepId) -> Self {
        Self {
            step_id,
            state: StepState::Skipped,
            output: None,
            error: None,
            started_at: None,
            finished_at: Utc::now(),
            retry_count: 0,
        }
    }

    /// Wall time between start and finish, if the step started.
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.started_at.map(|start| self.finished_at - start)
    }
}

/// Aggregated step counts of one execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    /// `completed / total`, in `0.0..=1.0`
    pub fraction: f64,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    fn record(&mut self, state: StepState) {
        match state {
            StepState::Completed => self.completed += 1,
            StepState::Failed => self.failed += 1,
            _ => {}
        }
        self.fraction = if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64
        };
    }
}

/// Live view of one execution.
///
/// Owned by the orchestrator for in-flight runs; callers receive clones.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: String,
    pub execution_id: ExecutionId,
    pub state: WorkflowState,
    pub progress: Progress,
    /// Most recently started step that has not finished
    pub current_step: Option<StepId>,
    /// Terminal step results, in the order they finished
    pub step_results: Vec<StepResult>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowStatus {
    /// Creates a pending status for a new execution of `workflow`.
    pub fn new(workflow: &Workflow, execution_id: ExecutionId) -> Self {
        let now = Utc::now();
        Self {
            workflow_id: workflow.id().to_string(),
            execution_id,
            state: WorkflowState::Pending,
            progress: Progress::new(workflow.step_count()),
            current_step: None,
            step_results: Vec::new(),
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Applies a state transition if the state machine permits it.
    ///
    /// Returns false and leaves the status unchanged otherwise.
    pub fn transition(&mut self, next: WorkflowState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.finished_at = Some(self.updated_at);
            self.current_step = None;
        }
        true
    }

    pub fn step_started(&mut self, step_id: StepId) {
        self.current_step = Some(step_id);
        self.updated_at = Utc::now();
    }

    /// Appends a terminal step result and updates the progress counters.
    pub fn record_step(&mut self, result: StepResult) {
        self.progress.record(result.state);
        if self.current_step.as_ref() == Some(&result.step_id) {
            self.current_step = None;
        }
        self.updated_at = Utc::now();
        self.step_results.push(result);
    }

    pub fn step_result(&self, step_id: &StepId) -> Option<&StepResult> {
        self.step_results.iter().find(|r| &r.step_id == step_id)
    }

    /// First step that failed, if any.
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.step_results
            .iter()
            .find(|r| r.state == StepState::Failed)
    }

    /// Builds the update event describing this status.
    pub fn to_update(&self, step: Option<(&StepId, StepState)>) -> ProgressUpdate {
        ProgressUpdate {
            workflow_id: self.workflow_id.clone(),
            execution_id: self.execution_id,
            state: self.state,
            progress: self.progress,
            current_step: self.current_step.clone(),
            step: step.map(|(id, _)| id.clone()),
            step_state: step.map(|(_, state)| state),
            timestamp: Utc::now(),
        }
    }
}

/// Event pushed to subscribers on every transition of an execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub workflow_id: String,
    pub execution_id: ExecutionId,
    pub state: WorkflowState,
    pub progress: Progress,
    pub current_step: Option<StepId>,
    /// Step whose transition caused this update
    pub step: Option<StepId>,
    pub step_state: Option<StepState>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressUpdate {
    /// Returns true if this update reports the end of the execution.
    pub fn is_final(&self) -> bool {
        self.state.is_terminal()
    }
}
