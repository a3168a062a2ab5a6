//! Fluent builder for immutable workflows.

use crate::model::{Step, Workflow};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Builder for [`Workflow`].
///
/// The builder does not validate. A workflow with duplicate ids or cycles
/// can be built; the validator reports the problems before execution.
///
/// # Example
///
/// ```
/// use toolflow_core::{Step, WorkflowBuilder};
///
/// let workflow = WorkflowBuilder::new("report")
///     .id("report-v1")
///     .description("Nightly report")
///     .step(Step::new("collect", "sql_query"))
///     .step(Step::new("render", "template").depends_on("collect"))
///     .build();
///
/// assert_eq!(workflow.id(), "report-v1");
/// assert_eq!(workflow.step_count(), 2);
/// ```
#[derive(Clone, Debug, Default)]
pub struct WorkflowBuilder {
    id: Option<String>,
    name: String,
    description: String,
    steps: Vec<Step>,
    metadata: BTreeMap<String, String>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets an explicit workflow id. Defaults to a random UUID.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Workflow {
        Workflow {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            description: self.description,
            steps: self.steps,
            metadata: self.metadata,
        }
    }
}
