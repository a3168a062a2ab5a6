//! Workflow validation before execution.
//!
//! Checks the structural invariants of a workflow (non-empty, unique step
//! ids, resolvable dependencies, acyclic) and reports non-fatal issues such
//! as unreachable steps and oversized workflows.

use crate::dag::DependencyGraph;
use crate::model::{StepId, Workflow};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Steps above which decomposition is suggested.
const LARGE_WORKFLOW_STEPS: usize = 10;
/// Parallel steps above which resource pressure is flagged.
const PARALLEL_PRESSURE_STEPS: usize = 5;

/// How serious a validation issue is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Blocks execution.
    Error,
    /// Execution proceeds but part of the workflow will not run.
    Warning,
    /// Advisory only.
    Suggestion,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Suggestion => write!(f, "suggestion"),
        }
    }
}

/// Category of a validation issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    EmptyWorkflow,
    DuplicateStep,
    MissingDependency,
    Cycle,
    UnreachableStep,
    LargeWorkflow,
    ParallelPressure,
}

/// A single finding produced by the validator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    /// Offending step, if the issue concerns one
    pub step_id: Option<StepId>,
    pub message: String,
    /// Other steps involved (cycle members, missing dependency)
    #[serde(default)]
    pub related: Vec<StepId>,
}

impl ValidationIssue {
    fn new(kind: IssueKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            step_id: None,
            message: message.into(),
            related: Vec::new(),
        }
    }

    fn for_step(mut self, step_id: StepId) -> Self {
        self.step_id = Some(step_id);
        self
    }

    fn with_related(mut self, related: Vec<StepId>) -> Self {
        self.related = related;
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step_id {
            Some(step) => write!(f, "[{}] {}: {}", self.severity, step, self.message),
            None => write!(f, "[{}] {}", self.severity, self.message),
        }
    }
}

/// Validation report for workflow structure.
///
/// `is_valid` is false exactly when at least one error was found. Warnings
/// and suggestions never block execution.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    is_valid: bool,
    errors: Vec<ValidationIssue>,
    warnings: Vec<ValidationIssue>,
    suggestions: Vec<ValidationIssue>,
}

impl ValidationReport {
    fn new() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    /// Returns whether the workflow may be executed.
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn errors(&self) -> &[ValidationIssue] {
        &self.errors
    }

    pub fn warnings(&self) -> &[ValidationIssue] {
        &self.warnings
    }

    pub fn suggestions(&self) -> &[ValidationIssue] {
        &self.suggestions
    }

    /// Returns true if any error of the given kind was reported.
    pub fn has_error(&self, kind: IssueKind) -> bool {
        self.errors.iter().any(|issue| issue.kind == kind)
    }

    fn push(&mut self, issue: ValidationIssue) {
        match issue.severity {
            Severity::Error => {
                self.is_valid = false;
                self.errors.push(issue);
            }
            Severity::Warning => self.warnings.push(issue),
            Severity::Suggestion => self.suggestions.push(issue),
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid {
            write!(f, "workflow is valid")?;
        } else {
            write!(f, "workflow is invalid ({} error(s))", self.errors.len())?;
        }
        for issue in self
            .errors
            .iter()
            .chain(&self.warnings)
            .chain(&self.suggestions)
        {
            write!(f, "\n  {}", issue)?;
        }
        Ok(())
    }
}

/// Workflow validator for structure verification.
///
/// Stateless; validating the same workflow twice yields identical reports.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkflowValidator;

impl WorkflowValidator {
    /// Creates a new workflow validator.
    pub fn new() -> Self {
        Self
    }

    /// Validates the workflow structure.
    ///
    /// Checks for:
    /// - An empty step list
    /// - Duplicate step ids
    /// - Dependencies on steps that do not exist
    /// - Cycles in the dependency graph
    /// - Steps unreachable from the no-dependency roots (warning)
    /// - Large or parallel-heavy workflows (suggestion)
    ///
    /// # Arguments
    ///
    /// * `workflow` - The workflow to validate
    ///
    /// # Returns
    ///
    /// A [`ValidationReport`]; an empty workflow yields an invalid report
    /// rather than an error.
    pub fn validate(&self, workflow: &Workflow) -> ValidationReport {
        let mut report = ValidationReport::new();

        if workflow.step_count() == 0 {
            report.push(ValidationIssue::new(
                IssueKind::EmptyWorkflow,
                Severity::Error,
                "workflow has no steps",
            ));
            return report;
        }

        let graph = DependencyGraph::from_workflow(workflow);

        self.check_duplicates(&graph, &mut report);
        self.check_missing_dependencies(&graph, &mut report);
        self.check_cycles(&graph, &mut report);
        self.check_reachability(&graph, &mut report);
        self.check_size(workflow, &mut report);

        report
    }

    fn check_duplicates(&self, graph: &DependencyGraph<'_>, report: &mut ValidationReport) {
        for id in graph.duplicates() {
            report.push(
                ValidationIssue::new(
                    IssueKind::DuplicateStep,
                    Severity::Error,
                    format!("step id '{}' is declared more than once", id),
                )
                .for_step(id.clone()),
            );
        }
    }

    fn check_missing_dependencies(&self, graph: &DependencyGraph<'_>, report: &mut ValidationReport) {
        for (step, dependency) in graph.missing_dependencies() {
            report.push(
                ValidationIssue::new(
                    IssueKind::MissingDependency,
                    Severity::Error,
                    format!("depends on unknown step '{}'", dependency),
                )
                .for_step(step.clone())
                .with_related(vec![dependency.clone()]),
            );
        }
    }

    fn check_cycles(&self, graph: &DependencyGraph<'_>, report: &mut ValidationReport) {
        for cycle in graph.cycles() {
            let path = cycle
                .iter()
                .chain(cycle.first())
                .map(StepId::as_str)
                .collect::<Vec<_>>()
                .join(" -> ");
            report.push(
                ValidationIssue::new(
                    IssueKind::Cycle,
                    Severity::Error,
                    format!("dependency cycle: {}", path),
                )
                .for_step(cycle[0].clone())
                .with_related(cycle),
            );
        }
    }

    fn check_reachability(&self, graph: &DependencyGraph<'_>, report: &mut ValidationReport) {
        for id in graph.unreachable() {
            tracing::warn!(step_id = %id, "step is unreachable from any root step");
            report.push(
                ValidationIssue::new(
                    IssueKind::UnreachableStep,
                    Severity::Warning,
                    "step is not reachable from any step without dependencies and will never run",
                )
                .for_step(id),
            );
        }
    }

    fn check_size(&self, workflow: &Workflow, report: &mut ValidationReport) {
        if workflow.step_count() > LARGE_WORKFLOW_STEPS {
            report.push(ValidationIssue::new(
                IssueKind::LargeWorkflow,
                Severity::Suggestion,
                format!(
                    "workflow has {} steps; consider decomposition into smaller workflows",
                    workflow.step_count()
                ),
            ));
        }

        let parallel = workflow.parallel_step_count();
        if parallel > PARALLEL_PRESSURE_STEPS {
            report.push(ValidationIssue::new(
                IssueKind::ParallelPressure,
                Severity::Suggestion,
                format!(
                    "{} steps run in parallel; review resource pressure",
                    parallel
                ),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Step;

    fn validate(workflow: &Workflow) -> ValidationReport {
        WorkflowValidator::new().validate(workflow)
    }

    #[test]
    fn test_valid_workflow() {
        let workflow = Workflow::builder("ok")
            .step(Step::new("a", "t"))
            .step(Step::new("b", "t").depends_on("a"))
            .step(Step::new("c", "t").depends_on("a"))
            .build();

        let report = validate(&workflow);
        assert!(report.is_valid());
        assert!(report.errors().is_empty());
        assert!(report.warnings().is_empty());
        assert!(report.suggestions().is_empty());
    }

    #[test]
    fn test_empty_workflow_is_invalid() {
        let report = validate(&Workflow::builder("empty").build());
        assert!(!report.is_valid());
        assert!(report.has_error(IssueKind::EmptyWorkflow));
    }

    #[test]
    fn test_duplicate_ids() {
        let workflow = Workflow::builder("dup")
            .step(Step::new("a", "t"))
            .step(Step::new("a", "t"))
            .build();

        let report = validate(&workflow);
        assert!(!report.is_valid());
        assert_eq!(report.errors()[0].kind, IssueKind::DuplicateStep);
        assert_eq!(report.errors()[0].step_id, Some(StepId::new("a")));
    }

    #[test]
    fn test_missing_dependency_names_step() {
        let workflow = Workflow::builder("missing")
            .step(Step::new("a", "t"))
            .step(Step::new("b", "t").depends_on("ghost"))
            .build();

        let report = validate(&workflow);
        assert!(!report.is_valid());
        let issue = &report.errors()[0];
        assert_eq!(issue.kind, IssueKind::MissingDependency);
        assert_eq!(issue.step_id, Some(StepId::new("b")));
        assert_eq!(issue.related, vec![StepId::new("ghost")]);
        assert!(issue.message.contains("ghost"));
    }

    #[test]
    fn test_cycle_is_error() {
        let workflow = Workflow::builder("cycle")
            .step(Step::new("a", "t").depends_on("b"))
            .step(Step::new("b", "t").depends_on("a"))
            .build();

        let report = validate(&workflow);
        assert!(!report.is_valid());
        assert!(report.has_error(IssueKind::Cycle));
        // both steps are also unreachable
        assert_eq!(report.warnings().len(), 2);
    }

    #[test]
    fn test_unreachable_is_warning_only() {
        let workflow = Workflow::builder("island")
            .step(Step::new("a", "t"))
            .step(Step::new("b", "t").depends_on("a").depends_on("ghost"))
            .step(Step::new("x", "t").depends_on("b"))
            .build();

        let report = validate(&workflow);
        // b is reachable through a; the missing dependency is the only error
        assert_eq!(report.errors().len(), 1);
        assert!(report.warnings().is_empty());
    }

    #[test]
    fn test_suggestions_for_large_parallel_workflow() {
        let mut builder = Workflow::builder("wide").step(Step::new("root", "t"));
        for i in 0..11 {
            builder = builder.step(Step::new(format!("s{}", i), "t").depends_on("root").parallel());
        }
        let report = validate(&builder.build());

        assert!(report.is_valid());
        let kinds: Vec<IssueKind> = report.suggestions().iter().map(|s| s.kind).collect();
        assert_eq!(kinds, vec![IssueKind::LargeWorkflow, IssueKind::ParallelPressure]);
    }

    #[test]
    fn test_long_linear_chain_is_valid() {
        let workflow = Workflow::builder("long")
            .steps((0..100_000).map(|i| {
                let step = Step::new(format!("step-{}", i), "t");
                if i == 0 {
                    step
                } else {
                    step.depends_on(format!("step-{}", i - 1))
                }
            }))
            .build();

        let report = validate(&workflow);
        assert!(report.is_valid());
        assert!(report.warnings().is_empty());
        assert!(!report.has_error(IssueKind::Cycle));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let workflow = Workflow::builder("cycle")
            .step(Step::new("r", "t"))
            .step(Step::new("a", "t").depends_on("r").depends_on("c"))
            .step(Step::new("b", "t").depends_on("a"))
            .step(Step::new("c", "t").depends_on("b").depends_on("zz"))
            .build();

        assert_eq!(validate(&workflow), validate(&workflow));
        assert_eq!(validate(&workflow).to_string(), validate(&workflow).to_string());
    }

    #[test]
    fn test_report_display() {
        let workflow = Workflow::builder("missing")
            .step(Step::new("b", "t").depends_on("ghost"))
            .build();
        let text = validate(&workflow).to_string();
        assert!(text.starts_with("workflow is invalid (1 error(s))"));
        assert!(text.contains("[error] b: depends on unknown step 'ghost'"));
    }
}
