//! End-to-end orchestration tests.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{collect_until_final, subscribe, test_orchestrator, test_orchestrator_with, test_registry, wait_for_step};
use toolflow_agent::{
    AgentError, AuditEvent, AuditLog, ExecutionOptions, GenerateTool, GenerationError,
    SecurityContext, TextGenerator,
};
use toolflow_core::{
    ExecutionId, RetryPolicy, StepState, Value, Workflow, WorkflowOptimizer, WorkflowState,
};
use toolflow_runtime::{RuntimeConfig, TimeRange};

fn fan_out() -> Workflow {
    Workflow::builder("fan-out")
        .id("fan-out")
        .step(toolflow_core::Step::new("a", "ok").param("seed", 7))
        .step(
            toolflow_core::Step::new("b", "ok")
                .depends_on("a")
                .param("from", "${a.output}")
                .parallel(),
        )
        .step(
            toolflow_core::Step::new("c", "sleep")
                .depends_on("a")
                .param("ms", 20)
                .parallel(),
        )
        .build()
}

#[tokio::test]
async fn test_parallel_fan_out_completes() {
    let orchestrator = test_orchestrator();
    let handle = orchestrator
        .start(fan_out(), ExecutionOptions::new())
        .unwrap();
    let (_subscription, mut updates) = subscribe(&orchestrator, handle.execution_id());

    let result = handle.wait().await.unwrap();
    let seen = collect_until_final(&mut updates).await;

    assert_eq!(result.state, WorkflowState::Completed);
    assert_eq!(result.status.progress.completed, 3);
    assert_eq!(result.status.progress.total, 3);
    assert_eq!(result.status.progress.failed, 0);
    assert!((result.status.progress.fraction - 1.0).abs() < f64::EPSILON);

    let from = result.output("b").unwrap().as_map().unwrap()["from"].clone();
    assert_eq!(from.as_map().unwrap()["seed"], Value::from(7));

    let last = seen.last().unwrap();
    assert!(last.is_final());
    assert_eq!(last.state, WorkflowState::Completed);

    let history = orchestrator.monitor().history("fan-out", 10);
    assert_eq!(history.len(), 1);
    assert!(history[0].is_success());
}

#[tokio::test]
async fn test_sequential_siblings_complete() {
    let workflow = Workflow::builder("siblings")
        .id("siblings")
        .step(toolflow_core::Step::new("A", "ok"))
        .step(toolflow_core::Step::new("B", "ok").depends_on("A"))
        .step(toolflow_core::Step::new("C", "ok").depends_on("A"))
        .build();
    assert!(workflow.steps().iter().all(|step| !step.is_parallel()));

    let orchestrator = test_orchestrator();
    let result = orchestrator.orchestrate(workflow).await.unwrap();

    assert_eq!(result.state, WorkflowState::Completed);
    assert_eq!(result.status.progress.completed, 3);
    assert_eq!(result.status.progress.total, 3);
    assert_eq!(result.status.progress.failed, 0);
    assert!(result.status.failed_step().is_none());
    for id in ["A", "B", "C"] {
        assert_eq!(result.step(id).unwrap().state, StepState::Completed);
    }

    let history = orchestrator.monitor().history("siblings", 1);
    assert_eq!(history[0].state, WorkflowState::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_fail_the_workflow() {
    let workflow = Workflow::builder("flaky")
        .id("flaky")
        .step(
            toolflow_core::Step::new("x", "fail")
                .with_retry(RetryPolicy::fixed(2, Duration::from_millis(10))),
        )
        .step(toolflow_core::Step::new("y", "ok").depends_on("x"))
        .build();

    let orchestrator = test_orchestrator();
    let result = orchestrator.orchestrate(workflow).await.unwrap();

    assert_eq!(result.state, WorkflowState::Failed);
    let x = result.step("x").unwrap();
    assert_eq!(x.state, StepState::Failed);
    assert_eq!(x.retry_count, 1);
    assert!(x.error.as_deref().unwrap().contains("tool always fails"));
    assert_eq!(result.step("y").unwrap().state, StepState::Skipped);

    let retried = result
        .audit
        .iter()
        .filter(|e| matches!(e, AuditEvent::StepRetried { .. }))
        .count();
    assert_eq!(retried, 1);

    let metrics = orchestrator.monitor().metrics(TimeRange::all());
    assert_eq!(metrics.failure_count, 1);
}

#[tokio::test]
async fn test_control_rejects_invalid_transitions() {
    let orchestrator = test_orchestrator();
    let workflow = Workflow::builder("slow")
        .step(toolflow_core::Step::new("a", "sleep").param("ms", 200))
        .build();

    let handle = orchestrator.start(workflow, ExecutionOptions::new()).unwrap();
    let id = handle.execution_id();
    let (_subscription, mut updates) = subscribe(&orchestrator, id);
    wait_for_step(&mut updates, "a", StepState::Running).await;

    let err = orchestrator.resume(id).unwrap_err();
    assert!(matches!(
        err,
        AgentError::InvalidState {
            state: WorkflowState::Running,
            operation: "resume"
        }
    ));

    let result = handle.wait().await.unwrap();
    assert!(result.is_success());

    assert!(matches!(
        orchestrator.pause(id),
        Err(AgentError::InvalidState {
            state: WorkflowState::Completed,
            ..
        })
    ));
    assert!(orchestrator.cancel(id).is_err());
    assert_eq!(
        orchestrator.status(id).unwrap().state,
        WorkflowState::Completed
    );

    let unknown = ExecutionId::new();
    assert!(matches!(
        orchestrator.cancel(unknown),
        Err(AgentError::ExecutionNotFound(missing)) if missing == unknown
    ));
}

#[tokio::test(start_paused = true)]
async fn test_pause_holds_dispatch_until_resume() {
    let orchestrator = test_orchestrator();
    let workflow = Workflow::builder("pausable")
        .step(toolflow_core::Step::new("a", "sleep").param("ms", 100))
        .step(toolflow_core::Step::new("b", "ok").depends_on("a"))
        .build();

    let handle = orchestrator.start(workflow, ExecutionOptions::new()).unwrap();
    let id = handle.execution_id();
    let (_subscription, mut updates) = subscribe(&orchestrator, id);
    wait_for_step(&mut updates, "a", StepState::Running).await;

    orchestrator.pause(id).unwrap();
    assert_eq!(orchestrator.status(id).unwrap().state, WorkflowState::Paused);
    assert!(orchestrator.pause(id).is_err());

    // The running step finishes; its dependent must not start.
    tokio::time::sleep(Duration::from_millis(500)).await;
    let status = orchestrator.status(id).unwrap();
    assert_eq!(status.state, WorkflowState::Paused);
    assert_eq!(
        status.step_result(&"a".into()).map(|r| r.state),
        Some(StepState::Completed)
    );
    assert!(status.step_result(&"b".into()).is_none());
    assert!(!handle.is_finished());

    orchestrator.resume(id).unwrap();
    let result = handle.wait().await.unwrap();

    assert_eq!(result.state, WorkflowState::Completed);
    let paused = result
        .audit
        .iter()
        .position(|e| matches!(e, AuditEvent::Paused { .. }))
        .unwrap();
    let resumed = result
        .audit
        .iter()
        .position(|e| matches!(e, AuditEvent::Resumed { .. }))
        .unwrap();
    assert!(paused < resumed);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_run() {
    let orchestrator = test_orchestrator();
    let workflow = Workflow::builder("long")
        .id("long")
        .step(toolflow_core::Step::new("a", "sleep").param("ms", 60_000))
        .step(toolflow_core::Step::new("b", "ok").depends_on("a"))
        .build();

    let handle = orchestrator.start(workflow, ExecutionOptions::new()).unwrap();
    let id = handle.execution_id();
    let (_subscription, mut updates) = subscribe(&orchestrator, id);
    wait_for_step(&mut updates, "a", StepState::Running).await;

    orchestrator.cancel(id).unwrap();
    assert_eq!(
        orchestrator.status(id).unwrap().state,
        WorkflowState::Cancelled
    );

    let result = tokio::time::timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("cancelled run should settle promptly")
        .unwrap();

    assert_eq!(result.state, WorkflowState::Cancelled);
    assert_eq!(result.step("a").unwrap().state, StepState::Cancelled);
    assert_eq!(result.step("b").unwrap().state, StepState::Skipped);
    assert!(result.outputs.is_empty());
    assert!(result
        .audit
        .iter()
        .any(|e| matches!(e, AuditEvent::Cancelled { .. })));

    let history = orchestrator.monitor().history("long", 1);
    assert_eq!(history[0].state, WorkflowState::Cancelled);
}

#[tokio::test]
async fn test_cancel_right_after_start() {
    let orchestrator = test_orchestrator();
    let workflow = Workflow::builder("never")
        .step(toolflow_core::Step::new("a", "ok"))
        .build();

    let handle = orchestrator.start(workflow, ExecutionOptions::new()).unwrap();
    let id = handle.execution_id();
    assert_eq!(orchestrator.status(id).unwrap().state, WorkflowState::Running);

    orchestrator.cancel(id).unwrap();
    assert_eq!(orchestrator.status(id).unwrap().state, WorkflowState::Cancelled);

    let result = handle.wait().await.unwrap();
    assert_eq!(result.state, WorkflowState::Cancelled);
    assert_eq!(result.step("a").unwrap().state, StepState::Skipped);
    assert!(result
        .audit
        .iter()
        .any(|e| matches!(e, AuditEvent::Cancelled { .. })));
}

#[tokio::test]
async fn test_variables_and_audit_persistence() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = test_orchestrator().with_audit_dir(dir.path());

    let workflow = Workflow::builder("greet")
        .step(toolflow_core::Step::new("hello", "ok").param("msg", "hi ${who}"))
        .build();
    let options = ExecutionOptions::new()
        .variable("who", "ops")
        .security(SecurityContext::new("alice").with_role("operator"));

    let result = orchestrator.orchestrate_with(workflow, options).await.unwrap();
    assert!(result.is_success());
    assert_eq!(
        result.output("hello").unwrap().as_map().unwrap()["msg"],
        Value::from("hi ops")
    );

    let path = AuditLog::with_dir(result.execution_id, dir.path())
        .path()
        .unwrap();
    let persisted: Vec<AuditEvent> =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(persisted, result.audit);
    assert!(matches!(
        persisted.first(),
        Some(AuditEvent::WorkflowStarted { principal: Some(p), .. }) if p == "alice"
    ));
    assert!(matches!(
        persisted.last(),
        Some(AuditEvent::WorkflowFinished {
            state: WorkflowState::Completed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_optimized_workflow_still_runs() {
    let workflow = Workflow::builder("pipeline")
        .id("pipeline")
        .step(toolflow_core::Step::new("fetch", "ok").param("url", "a"))
        .step(
            toolflow_core::Step::new("parse", "sleep")
                .depends_on("fetch")
                .param("ms", 5),
        )
        .step(toolflow_core::Step::new("store", "ok").depends_on("parse"))
        .build();

    let optimized = WorkflowOptimizer::new().optimize(&workflow).optimized_workflow;
    assert_eq!(optimized.id(), "pipeline-optimized");

    let orchestrator = test_orchestrator();
    assert!(orchestrator.validate(&optimized).is_valid());

    let result = orchestrator.orchestrate(optimized).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.workflow_id, "pipeline-optimized");
}

struct CannedGenerator;

#[async_trait]
impl TextGenerator for CannedGenerator {
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        _temperature: f32,
    ) -> Result<String, GenerationError> {
        Ok(format!("[{}] {}", max_tokens, prompt.to_uppercase()))
    }
}

#[tokio::test]
async fn test_generate_tool_in_workflow() {
    let registry = test_registry().with_tool(GenerateTool::new("generate", Arc::new(CannedGenerator)));
    let orchestrator = test_orchestrator_with(registry, RuntimeConfig::default());

    let workflow = Workflow::builder("summarize")
        .step(toolflow_core::Step::new("topic", "ok").param("name", "rust"))
        .step(
            toolflow_core::Step::new("write", "generate")
                .depends_on("topic")
                .param("prompt", "write about ${topic}")
                .param("max_tokens", 32),
        )
        .build();

    let options = ExecutionOptions::new().variable("topic", "tokio");
    let result = orchestrator.orchestrate_with(workflow, options).await.unwrap();

    assert!(result.is_success());
    assert_eq!(
        result.output("write").unwrap().as_str(),
        Some("[32] WRITE ABOUT TOKIO")
    );
}

#[tokio::test]
async fn test_invalid_workflow_never_starts() {
    let orchestrator = test_orchestrator();
    let workflow = Workflow::builder("cyclic")
        .step(toolflow_core::Step::new("a", "ok").depends_on("b"))
        .step(toolflow_core::Step::new("b", "ok").depends_on("a"))
        .build();

    let err = orchestrator.orchestrate(workflow).await.unwrap_err();
    assert!(matches!(err, AgentError::Validation(_)));
    assert!(orchestrator.active_executions().is_empty());
}
