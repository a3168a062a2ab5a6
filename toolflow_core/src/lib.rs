//! Toolflow core - workflow graph model, validation and optimization.
//!
//! This crate holds the synchronous half of the workflow engine:
//!
//! - Graph model: immutable [`Workflow`]s built from [`Step`]s
//! - Validation: structural invariants checked before any execution
//! - Execution state: the workflow/step state machines and status records
//! - Schedules: calendar arithmetic for recurring triggers
//! - Optimization: parallelization, consolidation and caching proposals
//!
//! Nothing in this crate suspends. Execution, scheduling and monitoring
//! live in `toolflow-runtime` and `toolflow-agent`.
//!
//! # Example
//!
//! ```
//! use toolflow_core::{Step, Workflow, WorkflowValidator};
//!
//! let workflow = Workflow::builder("ingest")
//!     .step(Step::new("fetch", "http_get"))
//!     .step(Step::new("parse", "json_parse").depends_on("fetch"))
//!     .build();
//!
//! let report = WorkflowValidator::new().validate(&workflow);
//! assert!(report.is_valid());
//! ```

pub mod builder;
pub mod dag;
pub mod duration_ms;
pub mod error;
pub mod history;
pub mod model;
pub mod optimize;
pub mod schedule;
pub mod state;
pub mod validate;
pub mod value;

pub use builder::WorkflowBuilder;
pub use dag::DependencyGraph;
pub use error::{FlowError, Result};
pub use history::ExecutionRecord;
pub use model::{ExecutionMode, RetryPolicy, Step, StepId, Workflow};
pub use optimize::{
    Analysis, Bottleneck, Improvement, ImprovementKind, OptimizationResult, RiskLevel, Suggestion,
    Trend, TrendDirection, WorkflowOptimizer,
};
pub use schedule::{Frequency, Schedule};
pub use state::{
    ExecutionId, Progress, ProgressUpdate, StepResult, StepState, WorkflowState, WorkflowStatus,
};
pub use validate::{IssueKind, Severity, ValidationIssue, ValidationReport, WorkflowValidator};
pub use value::{Parameters, Value};
