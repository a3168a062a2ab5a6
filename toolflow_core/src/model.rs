//! Immutable workflow graph model.
//!
//! A [`Workflow`] is an ordered list of [`Step`]s connected by dependency
//! edges. Workflows are never mutated after construction: optimization
//! produces a new workflow instead.

use crate::builder::WorkflowBuilder;
use crate::value::{Parameters, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Unique identifier for a step within a workflow.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Creates a new StepId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the StepId and returns the underlying string.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Concurrency hint for a step.
///
/// Parallel steps may run alongside other eligible parallel steps;
/// sequential steps always run alone.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Sequential,
    Parallel,
}

/// Retry behavior for a failing step.
///
/// `max_attempts` counts the first attempt, so a policy with
/// `max_attempts = 3` allows two retries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(with = "crate::duration_ms")]
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every retry
    pub backoff_factor: f64,
    /// Upper bound for any single delay
    #[serde(with = "crate::duration_ms")]
    pub max_delay: Duration,
    /// Whether the executor may randomize delays
    #[serde(default)]
    pub jitter: bool,
}

impl RetryPolicy {
    /// Exponential backoff starting at 100ms, doubling, capped at 30s.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }

    /// Constant delay between attempts.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            backoff_factor: 1.0,
            max_delay: delay,
            jitter: false,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts, never less than one.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay to wait before retry number `retry` (1-based).
    ///
    /// Retry zero is the initial attempt and has no delay.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 || self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// A single unit of work: one invocation of a named tool.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Step {
    id: StepId,
    tool_id: String,
    #[serde(default)]
    parameters: Parameters,
    #[serde(default)]
    dependencies: Vec<StepId>,
    #[serde(default)]
    execution_mode: ExecutionMode,
    #[serde(default)]
    retry_policy: Option<RetryPolicy>,
    #[serde(default, with = "crate::duration_ms::option")]
    timeout: Option<Duration>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

impl Step {
    /// Creates a sequential step with no dependencies.
    ///
    /// # Example
    ///
    /// ```
    /// use toolflow_core::{ExecutionMode, Step};
    ///
    /// let step = Step::new("summarize", "text_summary")
    ///     .depends_on("load")
    ///     .param("max_words", 200)
    ///     .parallel();
    /// assert_eq!(step.execution_mode(), ExecutionMode::Parallel);
    /// ```
    pub fn new(id: impl Into<StepId>, tool_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tool_id: tool_id.into(),
            parameters: Parameters::new(),
            dependencies: Vec::new(),
            execution_mode: ExecutionMode::Sequential,
            retry_policy: None,
            timeout: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Adds a dependency. Dependencies have set semantics.
    pub fn depends_on(mut self, dependency: impl Into<StepId>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// Replaces all dependencies.
    pub fn with_dependencies<I, D>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<StepId>,
    {
        self.dependencies.clear();
        for dependency in dependencies {
            self = self.depends_on(dependency);
        }
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn parallel(self) -> Self {
        self.with_execution_mode(ExecutionMode::Parallel)
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &StepId {
        &self.id
    }

    pub fn tool_id(&self) -> &str {
        &self.tool_id
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn dependencies(&self) -> &[StepId] {
        &self.dependencies
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        self.execution_mode
    }

    pub fn is_parallel(&self) -> bool {
        self.execution_mode == ExecutionMode::Parallel
    }

    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

/// Immutable description of a workflow.
///
/// Built with [`WorkflowBuilder`]. Construction never fails; structural
/// problems (duplicate ids, dangling dependencies, cycles) are reported by
/// the [`WorkflowValidator`](crate::validate::WorkflowValidator).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub(crate) id: String,
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) description: String,
    pub(crate) steps: Vec<Step>,
    #[serde(default)]
    pub(crate) metadata: BTreeMap<String, String>,
}

impl Workflow {
    /// Starts building a workflow with the given name.
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Steps in declaration order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Returns the first step with the given id.
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|step| step.id() == id)
    }

    pub fn contains_step(&self, id: &StepId) -> bool {
        self.step(id).is_some()
    }

    /// Steps that list `id` as a dependency, in declaration order.
    pub fn dependents(&self, id: &StepId) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|step| step.dependencies().contains(id))
            .collect()
    }

    /// Steps with no dependencies.
    pub fn roots(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|step| step.dependencies().is_empty())
            .collect()
    }

    pub fn parallel_step_count(&self) -> usize {
        self.steps.iter().filter(|step| step.is_parallel()).count()
    }
}
