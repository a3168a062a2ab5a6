//! Workflow optimization and execution-history analysis.
//!
//! The optimizer never mutates its input. [`WorkflowOptimizer::optimize`]
//! returns a new workflow together with the list of improvements applied:
//!
//! 1. Consolidation: steps sharing tool, parameter count and execution mode
//!    are merged into the first of them.
//! 2. Parallelization: sequential steps whose dependents depend on nothing
//!    else become parallel.
//! 3. Caching hints: steps with an identical invocation fingerprint get a
//!    shared `cache_key` metadata entry.

use crate::dag::DependencyGraph;
use crate::history::ExecutionRecord;
use crate::model::{ExecutionMode, Step, StepId, Workflow};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

const PARALLELIZATION_IMPACT: f64 = 0.1;
const CONSOLIDATION_IMPACT: f64 = 0.15;
const CACHING_IMPACT: f64 = 0.05;

const BOTTLENECK_DURATION_FACTOR: f64 = 1.5;
const BOTTLENECK_FAILURE_RATE: f64 = 0.2;
const TREND_THRESHOLD: f64 = 0.1;
const DECOMPOSITION_STEPS: usize = 10;

/// Metadata key listing the step ids a consolidated step replaces.
pub const CONSOLIDATED_FROM: &str = "consolidated_from";
/// Metadata key carrying a caching fingerprint.
pub const CACHE_KEY: &str = "cache_key";
/// Workflow metadata key pointing at the workflow an optimized one came from.
pub const OPTIMIZED_FROM: &str = "optimized_from";

/// Kind of structural improvement.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImprovementKind {
    Parallelization,
    Consolidation,
    Caching,
    /// Only ever suggested; never applied automatically
    Decomposition,
}

/// One change applied by [`WorkflowOptimizer::optimize`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Improvement {
    pub kind: ImprovementKind,
    pub description: String,
    pub affected_steps: Vec<StepId>,
    /// Declared impact on a 0.0-1.0 scale
    pub impact: f64,
}

/// Risk of applying an optimization, derived from its total estimated gain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// `low` below 0.2, `high` above 0.5, `medium` otherwise.
    pub fn from_gain(gain: f64) -> Self {
        if gain < 0.2 {
            RiskLevel::Low
        } else if gain > 0.5 {
            RiskLevel::High
        } else {
            RiskLevel::Medium
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub optimized_workflow: Workflow,
    pub improvements: Vec<Improvement>,
    pub estimated_gain: f64,
    pub risk_level: RiskLevel,
}

/// Advisory produced by [`WorkflowOptimizer::suggest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub kind: ImprovementKind,
    pub message: String,
    pub steps: Vec<StepId>,
    pub expected_impact: f64,
}

/// A step that is slow or unreliable compared to its siblings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bottleneck {
    pub step_id: StepId,
    pub average_duration_ms: f64,
    pub failure_rate: f64,
    pub executions: usize,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trend {
    pub metric: String,
    pub direction: TrendDirection,
    /// Relative change from the older half to the newer half
    pub change_ratio: f64,
    pub samples: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    pub workflow_id: String,
    pub executions_analyzed: usize,
    pub bottlenecks: Vec<Bottleneck>,
    pub trends: Vec<Trend>,
    pub recommendations: Vec<String>,
}

/// Stateless workflow optimizer.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkflowOptimizer;

impl WorkflowOptimizer {
    pub fn new() -> Self {
        Self
    }

    /// Produces an optimized copy of `workflow`.
    ///
    /// The returned workflow has id `<id>-optimized` and records the source
    /// id under the `optimized_from` metadata key. Consolidation groups whose
    /// merge would introduce a dependency cycle are left untouched.
    ///
    /// # Example
    ///
    /// ```
    /// use toolflow_core::{Step, Workflow, WorkflowOptimizer};
    ///
    /// let workflow = Workflow::builder("etl")
    ///     .step(Step::new("extract", "read"))
    ///     .step(Step::new("load", "write").depends_on("extract"))
    ///     .build();
    ///
    /// let result = WorkflowOptimizer::new().optimize(&workflow);
    /// assert_eq!(result.optimized_workflow.id(), format!("{}-optimized", workflow.id()));
    /// ```
    pub fn optimize(&self, workflow: &Workflow) -> OptimizationResult {
        let mut improvements = Vec::new();

        let steps = self.consolidate(workflow.steps().to_vec(), &mut improvements);
        let steps = self.parallelize(steps, &mut improvements);
        let steps = self.add_cache_keys(steps, &mut improvements);

        let mut metadata = workflow.metadata().clone();
        metadata.insert(OPTIMIZED_FROM.to_string(), workflow.id().to_string());
        let optimized_workflow = Workflow {
            id: format!("{}-optimized", workflow.id()),
            name: workflow.name().to_string(),
            description: workflow.description().to_string(),
            steps,
            metadata,
        };

        let estimated_gain: f64 = improvements.iter().map(|i| i.impact).sum();
        let risk_level = RiskLevel::from_gain(estimated_gain);

        tracing::info!(
            workflow_id = %workflow.id(),
            improvements = improvements.len(),
            estimated_gain,
            risk = ?risk_level,
            "Workflow optimized"
        );

        OptimizationResult {
            optimized_workflow,
            improvements,
            estimated_gain,
            risk_level,
        }
    }

    /// Sequential steps that may safely become parallel.
    ///
    /// A step qualifies only if every step depending on it has it as its
    /// sole dependency. Leaf steps qualify trivially.
    pub fn parallelization_candidates(&self, workflow: &Workflow) -> Vec<StepId> {
        candidates(workflow.steps())
    }

    /// Groups of steps that share tool, parameter count and execution mode.
    pub fn consolidation_groups(&self, workflow: &Workflow) -> Vec<Vec<StepId>> {
        consolidation_groups(workflow.steps())
    }

    /// Analyzes the execution history of one workflow.
    ///
    /// Records belonging to other workflows are ignored.
    pub fn analyze(&self, workflow_id: &str, executions: &[ExecutionRecord]) -> Analysis {
        let records: Vec<&ExecutionRecord> = executions
            .iter()
            .filter(|record| record.workflow_id == workflow_id)
            .collect();

        let bottlenecks = find_bottlenecks(&records);
        let trend = execution_time_trend(&records);

        let mut recommendations = Vec::new();
        for bottleneck in &bottlenecks {
            if bottleneck.failure_rate > BOTTLENECK_FAILURE_RATE {
                recommendations.push(format!(
                    "Add a retry policy or fix the tool behind step '{}' ({:.0}% failures)",
                    bottleneck.step_id,
                    bottleneck.failure_rate * 100.0
                ));
            } else {
                recommendations.push(format!(
                    "Consider caching or splitting step '{}' (avg {:.0} ms)",
                    bottleneck.step_id, bottleneck.average_duration_ms
                ));
            }
        }
        if trend.direction == TrendDirection::Degrading {
            recommendations.push(format!(
                "Execution time grew by {:.0}%; review recent changes",
                trend.change_ratio * 100.0
            ));
        }
        let failures = records.iter().filter(|r| !r.is_success()).count();
        if !records.is_empty() && failures * 2 > records.len() {
            recommendations.push("More than half of recent executions failed".to_string());
        }

        Analysis {
            workflow_id: workflow_id.to_string(),
            executions_analyzed: records.len(),
            bottlenecks,
            trends: vec![trend],
            recommendations,
        }
    }

    /// Lists improvement opportunities without applying them.
    pub fn suggest(&self, workflow: &Workflow) -> Vec<Suggestion> {
        let mut suggestions = Vec::new();

        let parallel = candidates(workflow.steps());
        if !parallel.is_empty() {
            suggestions.push(Suggestion {
                kind: ImprovementKind::Parallelization,
                message: format!("{} step(s) can run in parallel", parallel.len()),
                expected_impact: PARALLELIZATION_IMPACT * parallel.len() as f64,
                steps: parallel,
            });
        }

        for group in consolidation_groups(workflow.steps()) {
            suggestions.push(Suggestion {
                kind: ImprovementKind::Consolidation,
                message: format!("{} similar steps can be consolidated", group.len()),
                steps: group,
                expected_impact: CONSOLIDATION_IMPACT,
            });
        }

        for group in duplicate_fingerprints(workflow.steps()) {
            suggestions.push(Suggestion {
                kind: ImprovementKind::Caching,
                message: format!("{} steps perform the identical invocation", group.len()),
                steps: group,
                expected_impact: CACHING_IMPACT,
            });
        }

        if workflow.step_count() > DECOMPOSITION_STEPS {
            suggestions.push(Suggestion {
                kind: ImprovementKind::Decomposition,
                message: format!(
                    "Workflow has {} steps; consider decomposing it",
                    workflow.step_count()
                ),
                steps: Vec::new(),
                expected_impact: 0.0,
            });
        }

        suggestions
    }

    fn consolidate(&self, steps: Vec<Step>, improvements: &mut Vec<Improvement>) -> Vec<Step> {
        let mut current = steps;
        for group in consolidation_groups(&current) {
            let candidate = merge_group(&current, &group);
            if creates_cycle(&candidate) {
                tracing::debug!(steps = ?group, "Skipping consolidation that would create a cycle");
                continue;
            }
            improvements.push(Improvement {
                kind: ImprovementKind::Consolidation,
                description: format!(
                    "Merged {} steps into '{}'",
                    group.len(),
                    group[0]
                ),
                affected_steps: group,
                impact: CONSOLIDATION_IMPACT,
            });
            current = candidate;
        }
        current
    }

    fn parallelize(&self, steps: Vec<Step>, improvements: &mut Vec<Improvement>) -> Vec<Step> {
        let convert: HashSet<StepId> = candidates(&steps).into_iter().collect();
        steps
            .into_iter()
            .map(|step| {
                if convert.contains(step.id()) {
                    improvements.push(Improvement {
                        kind: ImprovementKind::Parallelization,
                        description: format!("Step '{}' can run in parallel", step.id()),
                        affected_steps: vec![step.id().clone()],
                        impact: PARALLELIZATION_IMPACT,
                    });
                    step.with_execution_mode(ExecutionMode::Parallel)
                } else {
                    step
                }
            })
            .collect()
    }

    fn add_cache_keys(&self, steps: Vec<Step>, improvements: &mut Vec<Improvement>) -> Vec<Step> {
        let mut keys: HashMap<StepId, String> = HashMap::new();
        for group in duplicate_fingerprints(&steps) {
            if let Some(first) = steps.iter().find(|s| s.id() == &group[0]) {
                let key = fingerprint(first);
                for id in &group {
                    keys.insert(id.clone(), key.clone());
                }
            }
            improvements.push(Improvement {
                kind: ImprovementKind::Caching,
                description: format!("{} steps share one cacheable invocation", group.len()),
                affected_steps: group,
                impact: CACHING_IMPACT,
            });
        }

        steps
            .into_iter()
            .map(|step| match keys.remove(step.id()) {
                Some(key) => step.with_metadata(CACHE_KEY, key),
                None => step,
            })
            .collect()
    }
}

/// Hex SHA-256 over the tool id and the canonical JSON of its parameters.
pub fn fingerprint(step: &Step) -> String {
    let mut hasher = Sha256::new();
    hasher.update(step.tool_id().as_bytes());
    hasher.update([0u8]);
    hasher.update(serde_json::to_vec(step.parameters()).unwrap_or_default());
    format!("{:x}", hasher.finalize())
}

fn candidates(steps: &[Step]) -> Vec<StepId> {
    steps
        .iter()
        .filter(|step| step.execution_mode() == ExecutionMode::Sequential)
        .filter(|step| {
            steps
                .iter()
                .filter(|other| other.dependencies().contains(step.id()))
                .all(|dependent| dependent.dependencies().len() == 1)
        })
        .map(|step| step.id().clone())
        .collect()
}

fn consolidation_groups(steps: &[Step]) -> Vec<Vec<StepId>> {
    let mut order: Vec<(&str, usize, ExecutionMode)> = Vec::new();
    let mut groups: HashMap<(&str, usize, ExecutionMode), Vec<StepId>> = HashMap::new();
    for step in steps {
        let key = (step.tool_id(), step.parameters().len(), step.execution_mode());
        let group = groups.entry(key).or_default();
        if group.is_empty() {
            order.push(key);
        }
        if !group.contains(step.id()) {
            group.push(step.id().clone());
        }
    }
    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .filter(|group| group.len() > 1)
        .collect()
}

fn duplicate_fingerprints(steps: &[Step]) -> Vec<Vec<StepId>> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<StepId>> = HashMap::new();
    for step in steps {
        let key = fingerprint(step);
        let group = groups.entry(key.clone()).or_default();
        if group.is_empty() {
            order.push(key);
        }
        group.push(step.id().clone());
    }
    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .filter(|group| group.len() > 1)
        .collect()
}

/// Merges `group` into its first member.
///
/// The representative depends on the union of the group's dependencies,
/// minus the group itself. Dependents of removed steps are rewired to the
/// representative.
fn merge_group(steps: &[Step], group: &[StepId]) -> Vec<Step> {
    let representative = &group[0];
    let members: HashSet<&StepId> = group.iter().collect();
    let removed: HashSet<&StepId> = group[1..].iter().collect();

    let mut union: Vec<StepId> = Vec::new();
    for step in steps.iter().filter(|s| members.contains(s.id())) {
        for dependency in step.dependencies() {
            if !members.contains(dependency) && !union.contains(dependency) {
                union.push(dependency.clone());
            }
        }
    }
    let replaced = group[1..]
        .iter()
        .map(StepId::as_str)
        .collect::<Vec<_>>()
        .join(",");

    steps
        .iter()
        .filter(|step| !removed.contains(step.id()))
        .map(|step| {
            if step.id() == representative {
                step.clone()
                    .with_dependencies(union.clone())
                    .with_metadata(CONSOLIDATED_FROM, replaced.clone())
            } else {
                let rewired: Vec<StepId> = step
                    .dependencies()
                    .iter()
                    .map(|dep| {
                        if removed.contains(dep) {
                            representative.clone()
                        } else {
                            dep.clone()
                        }
                    })
                    .collect();
                step.clone().with_dependencies(rewired)
            }
        })
        .collect()
}

fn creates_cycle(steps: &[Step]) -> bool {
    let workflow = Workflow {
        id: String::new(),
        name: String::new(),
        description: String::new(),
        steps: steps.to_vec(),
        metadata: BTreeMap::new(),
    };
    DependencyGraph::from_workflow(&workflow).has_cycle()
}

#[derive(Default)]
struct StepStats {
    total_ms: f64,
    timed: usize,
    runs: usize,
    failures: usize,
}

fn find_bottlenecks(records: &[&ExecutionRecord]) -> Vec<Bottleneck> {
    let mut order: Vec<StepId> = Vec::new();
    let mut stats: HashMap<StepId, StepStats> = HashMap::new();

    for record in records {
        for result in &record.step_results {
            let entry = stats.entry(result.step_id.clone()).or_insert_with(|| {
                order.push(result.step_id.clone());
                StepStats::default()
            });
            entry.runs += 1;
            if result.state == crate::state::StepState::Failed {
                entry.failures += 1;
            }
            if let Some(duration) = result.duration() {
                entry.total_ms += duration.num_milliseconds() as f64;
                entry.timed += 1;
            }
        }
    }

    let averages: Vec<(StepId, f64)> = order
        .iter()
        .filter_map(|id| {
            let s = &stats[id];
            (s.timed > 0).then(|| (id.clone(), s.total_ms / s.timed as f64))
        })
        .collect();
    let mean = if averages.is_empty() {
        0.0
    } else {
        averages.iter().map(|(_, avg)| avg).sum::<f64>() / averages.len() as f64
    };

    order
        .into_iter()
        .filter_map(|id| {
            let s = &stats[&id];
            let average = if s.timed > 0 {
                s.total_ms / s.timed as f64
            } else {
                0.0
            };
            let failure_rate = s.failures as f64 / s.runs as f64;
            let slow = averages.len() > 1 && mean > 0.0 && average > mean * BOTTLENECK_DURATION_FACTOR;
            let unreliable = failure_rate > BOTTLENECK_FAILURE_RATE;
            let reason = match (slow, unreliable) {
                (true, true) => "slow and frequently failing",
                (true, false) => "average duration well above the workflow mean",
                (false, true) => "high failure rate",
                (false, false) => return None,
            };
            Some(Bottleneck {
                step_id: id,
                average_duration_ms: average,
                failure_rate,
                executions: s.runs,
                reason: reason.to_string(),
            })
        })
        .collect()
}

fn execution_time_trend(records: &[&ExecutionRecord]) -> Trend {
    let mut completed: Vec<&ExecutionRecord> = records
        .iter()
        .copied()
        .filter(|record| record.is_success())
        .collect();
    completed.sort_by_key(|record| record.started_at);

    let samples = completed.len();
    if samples < 2 {
        return Trend {
            metric: "execution_time".to_string(),
            direction: TrendDirection::Stable,
            change_ratio: 0.0,
            samples,
        };
    }

    let (older, newer) = completed.split_at(samples / 2);
    let average = |runs: &[&ExecutionRecord]| {
        runs.iter()
            .map(|r| r.duration().num_milliseconds() as f64)
            .sum::<f64>()
            / runs.len() as f64
    };
    let before = average(older);
    let after = average(newer);

    let change_ratio = if before > 0.0 {
        (after - before) / before
    } else if after > 0.0 {
        1.0
    } else {
        0.0
    };
    let direction = if change_ratio > TREND_THRESHOLD {
        TrendDirection::Degrading
    } else if change_ratio < -TREND_THRESHOLD {
        TrendDirection::Improving
    } else {
        TrendDirection::Stable
    };

    Trend {
        metric: "execution_time".to_string(),
        direction,
        change_ratio,
        samples,
    }
}
