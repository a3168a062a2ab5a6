//! Runtime metrics for step dispatch, retries and workflow outcomes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Kind of metric being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    /// Step handed to the tool collaborator
    StepDispatched,
    /// Step attempt retried after a failure
    StepRetried,
    /// Step attempt exceeded its timeout
    StepTimedOut,
    /// Step exhausted its attempts
    StepFailed,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowCancelled,
}

const METRIC_KINDS: usize = 7;

/// Runtime metrics collector.
///
/// Cheap to clone; clones share the same counters.
#[derive(Clone, Debug)]
pub struct RuntimeMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug)]
struct MetricsInner {
    /// Counts by kind
    counts: [AtomicU64; METRIC_KINDS],
    /// Total time spent in step attempts (nanoseconds)
    step_time_ns: AtomicU64,
}

impl RuntimeMetrics {
    /// Creates a new metrics collector.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                counts: Default::default(),
                step_time_ns: AtomicU64::new(0),
            }),
        }
    }

    /// Records a metric occurrence.
    pub fn record(&self, kind: MetricKind) {
        self.inner.counts[kind as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Adds the wall time of one step attempt.
    pub fn record_step_time(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.inner.step_time_ns.fetch_add(nanos, Ordering::Relaxed);
    }

    /// Gets the count for a specific metric.
    pub fn count(&self, kind: MetricKind) -> u64 {
        self.inner.counts[kind as usize].load(Ordering::Relaxed)
    }

    /// Gets the cumulative step time.
    pub fn total_step_time(&self) -> Duration {
        Duration::from_nanos(self.inner.step_time_ns.load(Ordering::Relaxed))
    }

    /// Gets all metrics as a summary.
    pub fn summary(&self) -> MetricsSummary {
        let completed = self.count(MetricKind::WorkflowCompleted);
        let failed = self.count(MetricKind::WorkflowFailed);
        let finished = completed + failed + self.count(MetricKind::WorkflowCancelled);
        MetricsSummary {
            steps_dispatched: self.count(MetricKind::StepDispatched),
            steps_retried: self.count(MetricKind::StepRetried),
            steps_timed_out: self.count(MetricKind::StepTimedOut),
            steps_failed: self.count(MetricKind::StepFailed),
            workflows_completed: completed,
            workflows_failed: failed,
            workflows_cancelled: self.count(MetricKind::WorkflowCancelled),
            total_step_time: self.total_step_time(),
            success_rate: if finished == 0 {
                0.0
            } else {
                completed as f64 / finished as f64
            },
        }
    }

    /// Resets all metrics to zero.
    pub fn reset(&self) {
        for count in &self.inner.counts {
            count.store(0, Ordering::Relaxed);
        }
        self.inner.step_time_ns.store(0, Ordering::Relaxed);
    }
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of runtime metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub steps_dispatched: u64,
    pub steps_retried: u64,
    pub steps_timed_out: u64,
    pub steps_failed: u64,
    pub workflows_completed: u64,
    pub workflows_failed: u64,
    pub workflows_cancelled: u64,
    /// Time spent inside step attempts
    pub total_step_time: Duration,
    /// Completed workflows over finished workflows (0.0 to 1.0)
    pub success_rate: f64,
}
