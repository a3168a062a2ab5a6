//! Finished-execution records kept by the monitor and read by the optimizer.

use crate::model::Workflow;
use crate::state::{ExecutionId, StepResult, StepState, WorkflowState, WorkflowStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Summary of one finished execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub workflow_name: String,
    /// Terminal state of the run
    pub state: WorkflowState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub step_results: Vec<StepResult>,
    /// Failure reason when the run failed without a failing step
    pub error: Option<String>,
}

impl ExecutionRecord {
    /// Builds a record from a terminal status.
    pub fn from_status(workflow_name: impl Into<String>, status: &WorkflowStatus) -> Self {
        Self {
            execution_id: status.execution_id,
            workflow_id: status.workflow_id.clone(),
            workflow_name: workflow_name.into(),
            state: status.state,
            started_at: status.started_at,
            finished_at: status.finished_at.unwrap_or(status.updated_at),
            step_results: status.step_results.clone(),
            error: status.failed_step().and_then(|step| step.error.clone()),
        }
    }

    /// Record for a run that failed before any step executed.
    pub fn failure(workflow: &Workflow, error: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            execution_id: ExecutionId::new(),
            workflow_id: workflow.id().to_string(),
            workflow_name: workflow.name().to_string(),
            state: WorkflowState::Failed,
            started_at: now,
            finished_at: now,
            step_results: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Total wall time of the run.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn is_success(&self) -> bool {
        self.state == WorkflowState::Completed
    }

    pub fn failed_step(&self) -> Option<&StepResult> {
        self.step_results
            .iter()
            .find(|step| step.state == StepState::Failed)
    }
}
