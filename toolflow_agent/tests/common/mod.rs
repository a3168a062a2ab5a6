//! Common test utilities for toolflow agent integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use toolflow_agent::{FnTool, Orchestrator, ToolError, ToolRegistry};
use toolflow_core::{ExecutionId, Parameters, ProgressUpdate, StepState, Value};
use toolflow_runtime::{Monitor, RuntimeConfig};

/// Registry with the tools shared by the integration tests.
///
/// - `ok`: echoes its parameters back as a map
/// - `fail`: always fails with a retryable error
/// - `sleep`: sleeps `ms` milliseconds (default 100), then returns "slept"
pub fn test_registry() -> ToolRegistry {
    ToolRegistry::new()
        .with_tool(FnTool::new("ok", |params: Parameters| async move {
            Ok(Value::Map(params))
        }))
        .with_tool(FnTool::new("fail", |_| async {
            Err(ToolError::ExecutionFailed("tool always fails".to_string()))
        }))
        .with_tool(FnTool::new("sleep", |params: Parameters| async move {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(Value::from("slept"))
        }))
}

/// Orchestrator over [`test_registry`] with the default configuration.
pub fn test_orchestrator() -> Orchestrator {
    test_orchestrator_with(test_registry(), RuntimeConfig::default())
}

pub fn test_orchestrator_with(registry: ToolRegistry, config: RuntimeConfig) -> Orchestrator {
    let monitor = Monitor::from_config(&config);
    Orchestrator::new(Arc::new(registry), monitor, config)
}

/// Receives updates until `step` reports `state`.
///
/// Panics if the channel closes first.
pub async fn wait_for_step(
    updates: &mut UnboundedReceiver<ProgressUpdate>,
    step: &str,
    state: StepState,
) -> ProgressUpdate {
    loop {
        let update = updates
            .recv()
            .await
            .unwrap_or_else(|| panic!("updates closed before {} became {}", step, state));
        if update.step.as_ref().map(|s| s.as_str()) == Some(step) && update.step_state == Some(state) {
            return update;
        }
    }
}

/// Drains updates up to and including the terminal one.
pub async fn collect_until_final(
    updates: &mut UnboundedReceiver<ProgressUpdate>,
) -> Vec<ProgressUpdate> {
    let mut seen = Vec::new();
    while let Some(update) = updates.recv().await {
        let done = update.is_final();
        seen.push(update);
        if done {
            break;
        }
    }
    seen
}

pub fn subscribe(
    orchestrator: &Orchestrator,
    execution_id: ExecutionId,
) -> (toolflow_runtime::Subscription, UnboundedReceiver<ProgressUpdate>) {
    orchestrator.monitor().subscribe_channel(execution_id)
}
