//! Audit trail for workflow executions with JSON persistence.
//!
//! Every run keeps an ordered list of [`AuditEvent`]s describing what the
//! orchestrator did: steps started, retried, timed out, finished, and the
//! control operations applied to the run. The trail is returned in the
//! run's result and can be written to `{dir}/{execution_id}.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use toolflow_core::{ExecutionId, StepId, WorkflowState};

/// Error types for audit operations.
#[derive(Error, Debug)]
pub enum AuditError {
    /// Failed to serialize audit events
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// Failed to write audit file
    #[error("Write failed: {0}")]
    WriteFailed(#[from] std::io::Error),

    /// Failed to create audit directory
    #[error("Directory creation failed: {0}")]
    DirectoryFailed(String),
}

/// One entry of an execution's audit trail.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AuditEvent {
    /// Run moved from pending to running
    WorkflowStarted {
        timestamp: DateTime<Utc>,
        workflow_id: String,
        step_count: usize,
        principal: Option<String>,
    },
    /// Step handed to the tool collaborator
    StepStarted {
        timestamp: DateTime<Utc>,
        step_id: StepId,
        tool_id: String,
    },
    /// Attempt failed and another one follows
    StepRetried {
        timestamp: DateTime<Utc>,
        step_id: StepId,
        attempt: u32,
        error: String,
    },
    /// Attempt exceeded its timeout
    StepTimedOut {
        timestamp: DateTime<Utc>,
        step_id: StepId,
        attempt: u32,
        timeout_ms: u64,
    },
    StepCompleted {
        timestamp: DateTime<Utc>,
        step_id: StepId,
        retry_count: u32,
    },
    StepFailed {
        timestamp: DateTime<Utc>,
        step_id: StepId,
        error: String,
        retry_count: u32,
    },
    /// In-flight step aborted by cancellation
    StepCancelled {
        timestamp: DateTime<Utc>,
        step_id: StepId,
    },
    /// Step never started
    StepSkipped {
        timestamp: DateTime<Utc>,
        step_id: StepId,
    },
    Paused {
        timestamp: DateTime<Utc>,
    },
    Resumed {
        timestamp: DateTime<Utc>,
    },
    Cancelled {
        timestamp: DateTime<Utc>,
    },
    /// Run reached a terminal state
    WorkflowFinished {
        timestamp: DateTime<Utc>,
        state: WorkflowState,
        completed_steps: usize,
        failed_steps: usize,
    },
}

impl AuditEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditEvent::WorkflowStarted { timestamp, .. }
            | AuditEvent::StepStarted { timestamp, .. }
            | AuditEvent::StepRetried { timestamp, .. }
            | AuditEvent::StepTimedOut { timestamp, .. }
            | AuditEvent::StepCompleted { timestamp, .. }
            | AuditEvent::StepFailed { timestamp, .. }
            | AuditEvent::StepCancelled { timestamp, .. }
            | AuditEvent::StepSkipped { timestamp, .. }
            | AuditEvent::Paused { timestamp }
            | AuditEvent::Resumed { timestamp }
            | AuditEvent::Cancelled { timestamp }
            | AuditEvent::WorkflowFinished { timestamp, .. } => *timestamp,
        }
    }
}

/// Audit log of one execution.
///
/// Recording is synchronous and in-memory; [`persist`](Self::persist)
/// writes the whole trail when a directory is configured.
#[derive(Clone, Debug)]
pub struct AuditLog {
    execution_id: ExecutionId,
    events: Vec<AuditEvent>,
    audit_dir: Option<PathBuf>,
}

impl AuditLog {
    /// Creates an in-memory audit log.
    pub fn new(execution_id: ExecutionId) -> Self {
        Self {
            execution_id,
            events: Vec::new(),
            audit_dir: None,
        }
    }

    /// Creates an audit log that persists into `audit_dir`.
    ///
    /// # Arguments
    ///
    /// * `execution_id` - Run the trail belongs to; names the file
    /// * `audit_dir` - Directory path for audit file storage
    pub fn with_dir(execution_id: ExecutionId, audit_dir: impl Into<PathBuf>) -> Self {
        Self {
            execution_id,
            events: Vec::new(),
            audit_dir: Some(audit_dir.into()),
        }
    }

    pub fn record(&mut self, event: AuditEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Path of the persisted trail, if a directory is configured.
    pub fn path(&self) -> Option<PathBuf> {
        self.audit_dir
            .as_deref()
            .map(|dir| audit_file(dir, self.execution_id))
    }

    /// Writes all events as formatted JSON to `{dir}/{execution_id}.json`.
    ///
    /// Does nothing for an in-memory log.
    ///
    /// # Returns
    ///
    /// Returns `Ok(())` on success, or `AuditError` on failure.
    pub async fn persist(&self) -> Result<(), AuditError> {
        let Some(dir) = &self.audit_dir else {
            return Ok(());
        };

        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| AuditError::DirectoryFailed(e.to_string()))?;

        let json = serde_json::to_string_pretty(&self.events)?;
        tokio::fs::write(audit_file(dir, self.execution_id), json).await?;
        Ok(())
    }

    /// Consumes the log and returns its events.
    pub fn into_events(self) -> Vec<AuditEvent> {
        self.events
    }
}

fn audit_file(dir: &Path, execution_id: ExecutionId) -> PathBuf {
    dir.join(format!("{}.json", execution_id))
}
