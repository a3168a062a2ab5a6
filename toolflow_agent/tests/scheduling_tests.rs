//! Scheduler tests driven through the public API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use common::test_orchestrator_with;
use toolflow_agent::{yaml::load_workflow_from_string, ManualClock, ScheduleKind, Scheduler};
use toolflow_core::{Frequency, Schedule, Step, Workflow, WorkflowState};
use toolflow_runtime::RuntimeConfig;

fn config() -> RuntimeConfig {
    RuntimeConfig {
        scheduler_poll_interval: Duration::from_secs(1),
        ..RuntimeConfig::default()
    }
}

fn report() -> Workflow {
    Workflow::builder("report")
        .id("report")
        .step(Step::new("collect", "ok").param("source", "db"))
        .step(Step::new("publish", "ok").depends_on("collect"))
        .build()
}

#[tokio::test(start_paused = true)]
async fn test_one_shot_fires_once_and_is_removed() {
    let config = config();
    let orchestrator = test_orchestrator_with(common::test_registry(), config.clone());
    let scheduler = Scheduler::new(orchestrator.clone(), &config);

    let at = Utc::now() + chrono::Duration::seconds(5);
    let id = scheduler.schedule_once(report(), at).unwrap();

    let listed = scheduler.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
    assert!(matches!(listed[0].kind, ScheduleKind::Once { at: when } if when == at));
    assert!(orchestrator.monitor().history("report", 1).is_empty());

    tokio::time::sleep(Duration::from_millis(6_100)).await;

    assert!(scheduler.list().is_empty());
    let history = orchestrator.monitor().history("report", 1);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, WorkflowState::Completed);
    assert!(scheduler.cancel(&id).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_recurring_yaml_workflow_on_manual_clock() {
    let yaml = r#"
id: digest
name: Hourly digest
steps:
  - id: gather
    tool: ok
    params:
      window: 1h
  - id: send
    tool: ok
    depends_on: [gather]
"#;
    let workflow = load_workflow_from_string(yaml).unwrap();

    let start = Utc.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let config = config();
    let orchestrator = test_orchestrator_with(common::test_registry(), config.clone());
    let scheduler = Scheduler::with_clock(orchestrator.clone(), &config, clock.clone());

    let id = scheduler
        .schedule_recurring(workflow, Schedule::new(Frequency::Hourly, 1))
        .unwrap();
    assert_eq!(
        scheduler.get(&id).unwrap().next_execution,
        start + chrono::Duration::hours(1)
    );

    // Not due yet: polls pass without firing.
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(orchestrator.monitor().history("digest", 10).is_empty());

    clock.advance(chrono::Duration::hours(1));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(orchestrator.monitor().history("digest", 10).len(), 1);

    let info = scheduler.get(&id).unwrap();
    assert_eq!(info.run_count, 1);
    assert_eq!(info.next_execution, start + chrono::Duration::hours(2));

    clock.advance(chrono::Duration::hours(1));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(orchestrator.monitor().history("digest", 10).len(), 2);

    let cancelled = scheduler.cancel(&id).unwrap();
    assert!(!cancelled.active);
    assert_eq!(cancelled.run_count, 2);

    clock.advance(chrono::Duration::hours(1));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(orchestrator.monitor().history("digest", 10).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_failures_reach_history() {
    let config = config();
    let orchestrator = test_orchestrator_with(common::test_registry(), config.clone());
    let scheduler = Scheduler::new(orchestrator.clone(), &config);

    let failing = Workflow::builder("nightly")
        .id("nightly")
        .step(Step::new("boom", "fail"))
        .build();
    scheduler
        .schedule_once(failing, Utc::now() + chrono::Duration::seconds(1))
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let history = orchestrator.monitor().history("nightly", 1);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, WorkflowState::Failed);
    assert_eq!(
        history[0].failed_step().map(|r| r.step_id.as_str()),
        Some("boom")
    );
}
