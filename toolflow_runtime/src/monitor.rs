//! Execution monitor: live progress subscriptions and bounded history.
//!
//! The monitor owns two tables. Subscriptions map an execution id to the
//! handlers registered for it; history maps a workflow id to a ring buffer
//! of finished [`ExecutionRecord`]s. Each table sits behind its own lock and
//! nothing outside this module touches either.

use crate::config::RuntimeConfig;
use chrono::{DateTime, Duration as CalendarDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use toolflow_core::{ExecutionId, ExecutionRecord, ProgressUpdate, Workflow, WorkflowState};

/// Number of entries in each ranked list of [`AggregateMetrics`].
const TOP_N: usize = 5;

/// Callback invoked synchronously for every progress update.
pub type ProgressHandler = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Half-open time window `[start, end)` used for metrics queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The window ending now and reaching `duration` into the past.
    pub fn last(duration: CalendarDuration) -> Self {
        let end = Utc::now();
        Self {
            start: end - duration,
            end,
        }
    }

    /// A window covering all representable time.
    pub fn all() -> Self {
        Self {
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

/// Execution count of one workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowCount {
    pub workflow_id: String,
    pub workflow_name: String,
    pub executions: usize,
}

/// Average execution time of one workflow.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowLatency {
    pub workflow_id: String,
    pub workflow_name: String,
    pub average_execution_time: Duration,
}

/// Aggregates computed on demand from retained history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateMetrics {
    pub total_executions: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub average_execution_time: Duration,
    /// `success_count / total_executions`, 0.0 when empty
    pub success_rate: f64,
    /// Most executed workflows, busiest first
    pub top_executed_workflows: Vec<WorkflowCount>,
    /// Workflows with the highest average execution time, slowest first
    pub slowest_workflows: Vec<WorkflowLatency>,
}

type SubscriberMap = HashMap<ExecutionId, Vec<(u64, ProgressHandler)>>;

struct MonitorInner {
    subscribers: Mutex<SubscriberMap>,
    history: RwLock<HashMap<String, VecDeque<ExecutionRecord>>>,
    history_capacity: usize,
    next_subscription: AtomicU64,
}

impl MonitorInner {
    fn unsubscribe(&self, execution_id: &ExecutionId, id: u64) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handlers) = subscribers.get_mut(execution_id) {
            handlers.retain(|(handler_id, _)| *handler_id != id);
            if handlers.is_empty() {
                subscribers.remove(execution_id);
            }
        }
    }
}

/// Progress publisher and history store.
///
/// Cheap to clone; clones share the same tables. Construct one per process
/// (or per test) and hand it to the orchestrator and scheduler.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("history_capacity", &self.inner.history_capacity)
            .finish_non_exhaustive()
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(RuntimeConfig::default().history_capacity)
    }
}

impl Monitor {
    /// Creates a monitor retaining `history_capacity` records per workflow.
    pub fn new(history_capacity: usize) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                subscribers: Mutex::new(HashMap::new()),
                history: RwLock::new(HashMap::new()),
                history_capacity: history_capacity.max(1),
                next_subscription: AtomicU64::new(1),
            }),
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.history_capacity)
    }

    /// Registers `handler` for updates of one execution.
    ///
    /// The handler runs synchronously on the publishing task and must not
    /// block. Dropping the returned [`Subscription`] unregisters it; call
    /// [`Subscription::detach`] to keep it until the execution ends.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let subscription = monitor.subscribe(handle.execution_id(), |update| {
    ///     println!("{}: {:.0}%", update.state, update.progress.fraction * 100.0);
    /// });
    /// ```
    pub fn subscribe<F>(&self, execution_id: ExecutionId, handler: F) -> Subscription
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(execution_id)
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            id,
            execution_id,
            monitor: Arc::downgrade(&self.inner),
            active: true,
        }
    }

    /// Subscribes through an unbounded channel instead of a callback.
    ///
    /// The channel closes after the terminal update of the execution.
    pub fn subscribe_channel(
        &self,
        execution_id: ExecutionId,
    ) -> (Subscription, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(execution_id, move |update| {
            // A closed receiver means the caller stopped listening.
            let _ = tx.send(update.clone());
        });
        (subscription, rx)
    }

    /// Number of live subscriptions for an execution.
    pub fn subscriber_count(&self, execution_id: &ExecutionId) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .map_or(0, Vec::len)
    }

    /// Delivers an update to every subscriber of its execution.
    ///
    /// Handlers run after the subscription lock is released, so a handler
    /// may subscribe or unsubscribe without deadlocking. After a terminal
    /// update the execution's subscriptions are dropped.
    pub fn publish(&self, update: &ProgressUpdate) {
        let handlers: Vec<ProgressHandler> = {
            let mut subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let handlers = subscribers
                .get(&update.execution_id)
                .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
                .unwrap_or_default();
            if update.is_final() {
                subscribers.remove(&update.execution_id);
            }
            handlers
        };

        for handler in handlers {
            handler(update);
        }
    }

    /// Appends a finished execution to its workflow's history.
    ///
    /// The oldest record is evicted once the workflow holds
    /// `history_capacity` records.
    pub fn record_execution(&self, record: ExecutionRecord) {
        tracing::debug!(
            workflow_id = %record.workflow_id,
            execution_id = %record.execution_id,
            state = %record.state,
            "Recording execution"
        );
        let mut history = self
            .inner
            .history
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let entries = history.entry(record.workflow_id.clone()).or_default();
        entries.push_back(record);
        while entries.len() > self.inner.history_capacity {
            entries.pop_front();
        }
    }

    /// Records a run that failed before any step executed.
    pub fn record_failure(&self, workflow: &Workflow, error: impl fmt::Display) {
        let message = error.to_string();
        tracing::warn!(
            workflow_id = %workflow.id(),
            error = %message,
            "Recording failed execution"
        );
        self.record_execution(ExecutionRecord::failure(workflow, message));
    }

    /// Most recent executions of a workflow, newest first.
    pub fn history(&self, workflow_id: &str, limit: usize) -> Vec<ExecutionRecord> {
        self.inner
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workflow_id)
            .map(|entries| entries.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Computes aggregates over records finished inside `range`.
    pub fn metrics(&self, range: TimeRange) -> AggregateMetrics {
        let history = self
            .inner
            .history
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut metrics = AggregateMetrics::default();
        let mut total_time = Duration::ZERO;
        let mut per_workflow: Vec<(String, String, usize, Duration)> = Vec::new();

        let mut workflow_ids: Vec<&String> = history.keys().collect();
        workflow_ids.sort();

        for workflow_id in workflow_ids {
            let mut count = 0;
            let mut time = Duration::ZERO;
            let mut name = String::new();
            for record in history[workflow_id]
                .iter()
                .filter(|record| range.contains(record.finished_at))
            {
                count += 1;
                let elapsed = record.duration().to_std().unwrap_or(Duration::ZERO);
                time += elapsed;
                name.clone_from(&record.workflow_name);
                match record.state {
                    WorkflowState::Completed => metrics.success_count += 1,
                    WorkflowState::Failed => metrics.failure_count += 1,
                    _ => {}
                }
            }
            if count > 0 {
                metrics.total_executions += count;
                total_time += time;
                per_workflow.push((workflow_id.clone(), name, count, time));
            }
        }

        if metrics.total_executions > 0 {
            metrics.average_execution_time = total_time / metrics.total_executions as u32;
            metrics.success_rate =
                metrics.success_count as f64 / metrics.total_executions as f64;
        }

        let mut by_count = per_workflow.clone();
        by_count.sort_by(|a, b| b.2.cmp(&a.2));
        metrics.top_executed_workflows = by_count
            .into_iter()
            .take(TOP_N)
            .map(|(workflow_id, workflow_name, executions, _)| WorkflowCount {
                workflow_id,
                workflow_name,
                executions,
            })
            .collect();

        let mut by_latency: Vec<WorkflowLatency> = per_workflow
            .into_iter()
            .map(|(workflow_id, workflow_name, count, time)| WorkflowLatency {
                workflow_id,
                workflow_name,
                average_execution_time: time / count as u32,
            })
            .collect();
        by_latency.sort_by(|a, b| b.average_execution_time.cmp(&a.average_execution_time));
        by_latency.truncate(TOP_N);
        metrics.slowest_workflows = by_latency;

        metrics
    }
}

/// Handle for a registered progress handler.
///
/// Unregisters on drop. Holds only a weak reference to the monitor.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    execution_id: ExecutionId,
    monitor: Weak<MonitorInner>,
    active: bool,
}

impl Subscription {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Unregisters the handler now.
    pub fn cancel(mut self) {
        self.release();
    }

    /// Keeps the handler registered until the execution finishes.
    pub fn detach(mut self) {
        self.active = false;
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(inner) = self.monitor.upgrade() {
            inner.unsubscribe(&self.execution_id, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("execution_id", &self.execution_id)
            .field("active", &self.active)
            .finish()
    }
}
