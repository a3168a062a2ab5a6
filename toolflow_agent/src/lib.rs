//! Toolflow agent layer - workflow orchestration and scheduling.
//!
//! This crate runs the workflows described by `toolflow-core`:
//!
//! - Orchestration: validated, dependency-ordered step dispatch with retries,
//!   timeouts and pause/resume/cancel control
//! - Scheduling: one-shot and calendar-recurring triggers
//! - Tools: the tool-invocation collaborator, a name-keyed registry and the
//!   text-generation adapter
//! - Audit: per-run event trails with JSON persistence
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use toolflow_agent::{FnTool, Orchestrator, ToolRegistry};
//! use toolflow_core::{Step, Value, Workflow};
//! use toolflow_runtime::{Monitor, RuntimeConfig};
//!
//! let tools = ToolRegistry::new()
//!     .with_tool(FnTool::new("echo", |params| async move { Ok(Value::Map(params)) }));
//! let orchestrator = Orchestrator::new(Arc::new(tools), Monitor::default(), RuntimeConfig::default());
//!
//! let workflow = Workflow::builder("hello")
//!     .step(Step::new("greet", "echo").param("name", "world"))
//!     .build();
//! let result = orchestrator.orchestrate(workflow).await?;
//! assert!(result.is_success());
//! ```

pub mod audit;
pub mod llm;
pub mod workflow;

pub use workflow::yaml;

use toolflow_core::{ExecutionId, FlowError, ValidationReport, WorkflowState};

/// Error types for agent operations.
#[derive(thiserror::Error, Debug)]
pub enum AgentError {
    /// Workflow failed structural validation; no step ran
    #[error("Workflow validation failed: {0}")]
    Validation(ValidationReport),

    /// No live or retained execution with this id
    #[error("Execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    /// Control operation not permitted in the current state
    #[error("Cannot {operation} execution in state {state}")]
    InvalidState {
        state: WorkflowState,
        operation: &'static str,
    },

    /// No active schedule with this id
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(workflow::ScheduleId),

    /// Schedule rule or trigger time rejected
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Execution task panicked or was aborted
    #[error("Execution task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Flow(#[from] FlowError),
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

pub use audit::{AuditError, AuditEvent, AuditLog};
pub use llm::{GenerateTool, GenerationError, TextGenerator};
pub use workflow::{
    CancellationToken, CancellationTokenSource, Clock, ExecutionContext, ExecutionHandle,
    ExecutionOptions, FnTool, ManualClock, Orchestrator, ScheduleId, ScheduleKind,
    ScheduledWorkflow, Scheduler, SecurityContext, SystemClock, Tool, ToolError, ToolInvoker,
    ToolRegistry, WorkflowResult,
};
