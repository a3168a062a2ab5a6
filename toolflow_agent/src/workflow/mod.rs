//! Workflow execution and scheduling.
//!
//! # Architecture
//!
//! - [`Orchestrator`](crate::workflow::orchestrator::Orchestrator): validates
//!   and runs workflows, owns the live status table
//! - [`Scheduler`](crate::workflow::scheduler::Scheduler): one-shot and
//!   recurring triggers on top of the orchestrator
//! - [`ToolInvoker`](crate::workflow::tools::ToolInvoker): the collaborator
//!   that actually performs a step's work
//!
//! # Execution Model
//!
//! 1. Validate the workflow; invalid workflows never start
//! 2. Dispatch eligible steps in workflow order, honoring execution modes
//! 3. Resolve `${...}` parameter references against the execution context
//! 4. Retry failed attempts under the step's policy, each attempt bounded
//!    by the step timeout
//! 5. Publish every transition to the monitor and record the audit trail
//!
//! # Example
//!
//! ```ignore
//! use toolflow_agent::workflow::{Orchestrator, Scheduler};
//! use toolflow_core::{Frequency, Schedule};
//!
//! let scheduler = Scheduler::new(orchestrator.clone(), &config);
//! scheduler.schedule_recurring(workflow, Schedule::new(Frequency::Daily, 1))?;
//! ```

pub mod cancellation;
pub mod context;
pub mod orchestrator;
pub mod scheduler;
pub mod timeout;
pub mod tools;
pub mod yaml;

pub use cancellation::{CancellationToken, CancellationTokenSource};
pub use context::{ExecutionContext, ExecutionOptions, SecurityContext};
pub use orchestrator::{ExecutionHandle, Orchestrator, WorkflowResult};
pub use scheduler::{Clock, ManualClock, ScheduleId, ScheduleKind, ScheduledWorkflow, Scheduler, SystemClock};
pub use timeout::{StepTimeout, TimeoutError};
pub use tools::{FnTool, Tool, ToolError, ToolInvoker, ToolRegistry};
pub use yaml::{load_workflow_from_file, load_workflow_from_string, YamlWorkflow, YamlWorkflowError};
