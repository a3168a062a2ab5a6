//! Time-based workflow triggers.
//!
//! The scheduler owns the table of pending triggers. Each schedule has one
//! background task:
//!
//! - one-shot schedules sleep until their time, remove themselves and run
//!   the workflow once
//! - recurring schedules poll every `scheduler_poll_interval`; when the
//!   clock has reached the next execution date the workflow is started in
//!   the background and the date advances by calendar arithmetic until it
//!   lies in the future
//!
//! Failures of triggered runs are logged and recorded in the monitor; they
//! never stop a recurring schedule. Cancelling a schedule does not cancel a
//! run it already started.

use crate::workflow::orchestrator::Orchestrator;
use crate::{AgentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use toolflow_core::{Schedule, Workflow};
use toolflow_runtime::RuntimeConfig;
use uuid::Uuid;

/// Source of the current time for schedule decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unique identifier of a schedule.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(Uuid);

impl ScheduleId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// When a scheduled workflow runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleKind {
    Once { at: DateTime<Utc> },
    Recurring(Schedule),
}

/// A registered trigger.
#[derive(Clone, Debug)]
pub struct ScheduledWorkflow {
    pub id: ScheduleId,
    pub workflow: Workflow,
    pub kind: ScheduleKind,
    pub next_execution: DateTime<Utc>,
    /// False only on the copy returned by [`Scheduler::cancel`]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    /// Runs started by this schedule so far
    pub run_count: u32,
}

struct Entry {
    info: ScheduledWorkflow,
    task: AbortHandle,
}

struct SchedulerInner {
    orchestrator: Orchestrator,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    schedules: Mutex<HashMap<ScheduleId, Entry>>,
}

/// Result of one poll of a recurring schedule.
enum Poll {
    Wait,
    Fire(Workflow),
    /// Fire, then stop: the schedule ended or its calendar overflowed
    Last(Workflow),
    Gone,
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<ScheduleId, Entry>> {
        self.schedules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `workflow` to completion, recording failures that left no
    /// execution record behind.
    async fn trigger(&self, workflow: Workflow) {
        match self.orchestrator.orchestrate(workflow.clone()).await {
            Ok(result) if result.is_success() => {}
            Ok(result) => tracing::warn!(
                workflow_id = %workflow.id(),
                execution_id = %result.execution_id,
                state = %result.state,
                "Scheduled run did not complete"
            ),
            Err(e) => {
                tracing::warn!(workflow_id = %workflow.id(), error = %e, "Scheduled run failed");
                self.orchestrator.monitor().record_failure(&workflow, &e);
            }
        }
    }

    fn poll(&self, id: &ScheduleId) -> Poll {
        let mut schedules = self.lock();
        let Some(entry) = schedules.get_mut(id) else {
            return Poll::Gone;
        };
        let ScheduleKind::Recurring(schedule) = &entry.info.kind else {
            return Poll::Gone;
        };
        let schedule = schedule.clone();

        let now = self.clock.now();
        if now < entry.info.next_execution {
            return Poll::Wait;
        }

        entry.info.run_count += 1;
        let workflow = entry.info.workflow.clone();

        let mut next = entry.info.next_execution;
        while next <= now {
            match schedule.next_after(next) {
                Some(date) => next = date,
                None => {
                    tracing::error!(
                        schedule_id = %id,
                        frequency = %schedule.frequency,
                        interval = schedule.interval,
                        "Next execution date overflows the calendar; removing schedule"
                    );
                    schedules.remove(id);
                    return Poll::Last(workflow);
                }
            }
        }

        if schedule.is_expired_at(next) {
            tracing::info!(schedule_id = %id, "Schedule reached its end date");
            schedules.remove(id);
            return Poll::Last(workflow);
        }

        entry.info.next_execution = next;
        Poll::Fire(workflow)
    }
}

/// Schedules workflows for one-shot and recurring execution.
///
/// Cheap to clone. Background triggers stop once every handle is dropped
/// or after [`shutdown`](Self::shutdown).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Creates a scheduler using the wall clock.
    pub fn new(orchestrator: Orchestrator, config: &RuntimeConfig) -> Self {
        Self::with_clock(orchestrator, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        orchestrator: Orchestrator,
        config: &RuntimeConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                orchestrator,
                clock,
                poll_interval: config.scheduler_poll_interval,
                schedules: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Runs `workflow` once at `at`.
    ///
    /// A time in the past fires immediately. Must be called from within a
    /// Tokio runtime.
    ///
    /// # Returns
    ///
    /// The id to use with [`cancel`](Self::cancel).
    pub fn schedule_once(&self, workflow: Workflow, at: DateTime<Utc>) -> Result<ScheduleId> {
        let id = ScheduleId::new();
        let now = self.inner.clock.now();
        let delay = (at - now).to_std().unwrap_or(Duration::ZERO);

        tracing::info!(
            schedule_id = %id,
            workflow_id = %workflow.id(),
            at = %at,
            "Scheduled one-shot workflow"
        );

        let info = ScheduledWorkflow {
            id,
            workflow,
            kind: ScheduleKind::Once { at },
            next_execution: at,
            active: true,
            created_at: now,
            run_count: 0,
        };

        let weak = Arc::downgrade(&self.inner);
        let mut schedules = self.inner.lock();
        let task = tokio::spawn(run_once(weak, id, delay)).abort_handle();
        schedules.insert(id, Entry { info, task });
        Ok(id)
    }

    /// Runs `workflow` repeatedly under `schedule`.
    ///
    /// Without a start date the first run is one interval from now.
    ///
    /// # Returns
    ///
    /// - `Ok(ScheduleId)` once the schedule is registered
    /// - `Err(AgentError::Flow)` if the rule itself is invalid
    /// - `Err(AgentError::InvalidSchedule)` if no execution date exists
    pub fn schedule_recurring(&self, workflow: Workflow, schedule: Schedule) -> Result<ScheduleId> {
        schedule.validate()?;

        let now = self.inner.clock.now();
        let first = schedule.first_execution(now).ok_or_else(|| {
            AgentError::InvalidSchedule("first execution date overflows the calendar".to_string())
        })?;
        if schedule.is_expired_at(first) {
            return Err(AgentError::InvalidSchedule(format!(
                "schedule ends before its first execution at {}",
                first
            )));
        }

        let id = ScheduleId::new();
        tracing::info!(
            schedule_id = %id,
            workflow_id = %workflow.id(),
            frequency = %schedule.frequency,
            interval = schedule.interval,
            first = %first,
            "Scheduled recurring workflow"
        );

        let info = ScheduledWorkflow {
            id,
            workflow,
            kind: ScheduleKind::Recurring(schedule),
            next_execution: first,
            active: true,
            created_at: now,
            run_count: 0,
        };

        let weak = Arc::downgrade(&self.inner);
        let mut schedules = self.inner.lock();
        let task = tokio::spawn(run_recurring(weak, id, self.inner.poll_interval)).abort_handle();
        schedules.insert(id, Entry { info, task });
        Ok(id)
    }

    /// Removes a schedule and stops its trigger task.
    ///
    /// Runs already started by the schedule continue.
    pub fn cancel(&self, id: &ScheduleId) -> Result<ScheduledWorkflow> {
        let entry = self
            .inner
            .lock()
            .remove(id)
            .ok_or(AgentError::ScheduleNotFound(*id))?;
        entry.task.abort();
        tracing::info!(schedule_id = %id, "Cancelled schedule");

        let mut info = entry.info;
        info.active = false;
        Ok(info)
    }

    /// Active schedules, soonest first.
    pub fn list(&self) -> Vec<ScheduledWorkflow> {
        let mut list: Vec<ScheduledWorkflow> = self
            .inner
            .lock()
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        list.sort_by_key(|info| info.next_execution);
        list
    }

    pub fn get(&self, id: &ScheduleId) -> Option<ScheduledWorkflow> {
        self.inner.lock().get(id).map(|entry| entry.info.clone())
    }

    /// Cancels every schedule.
    pub fn shutdown(&self) {
        let drained: Vec<Entry> = self.inner.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.task.abort();
        }
        tracing::info!(cancelled = drained.len(), "Scheduler shut down");
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.inner.orchestrator
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("poll_interval", &self.inner.poll_interval)
            .field("schedules", &self.inner.lock().len())
            .finish()
    }
}

async fn run_once(inner: Weak<SchedulerInner>, id: ScheduleId, delay: Duration) {
    tokio::time::sleep(delay).await;

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let Some(entry) = inner.lock().remove(&id) else {
        return;
    };

    let workflow = entry.info.workflow;
    tracing::info!(schedule_id = %id, workflow_id = %workflow.id(), "One-shot schedule fired");
    inner.trigger(workflow).await;
}

async fn run_recurring(inner: Weak<SchedulerInner>, id: ScheduleId, poll_interval: Duration) {
    loop {
        tokio::time::sleep(poll_interval).await;

        let Some(scheduler) = inner.upgrade() else {
            return;
        };
        let (workflow, last) = match scheduler.poll(&id) {
            Poll::Wait => continue,
            Poll::Gone => return,
            Poll::Fire(workflow) => (workflow, false),
            Poll::Last(workflow) => (workflow, true),
        };

        tracing::info!(schedule_id = %id, workflow_id = %workflow.id(), "Recurring schedule fired");
        tokio::spawn(async move { scheduler.trigger(workflow).await });
        if last {
            return;
        }
    }
}
