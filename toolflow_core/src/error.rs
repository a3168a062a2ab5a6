//! Error types for the workflow model.

use crate::model::StepId;

/// Main error type for model-level operations.
///
/// Structural problems found by the validator are reported through
/// [`ValidationReport`](crate::validate::ValidationReport) instead; this type
/// covers operations that cannot produce a result at all.
#[derive(thiserror::Error, Debug)]
pub enum FlowError {
    /// Workflow has no steps.
    #[error("Workflow cannot be empty")]
    EmptyWorkflow,

    /// Referenced step does not exist in the workflow.
    #[error("Step not found: {0}")]
    StepNotFound(StepId),

    /// Dependency relation contains a cycle.
    #[error("Cycle detected in workflow involving steps: {0:?}")]
    CycleDetected(Vec<StepId>),

    /// Value cannot be represented as a workflow [`Value`](crate::value::Value).
    #[error("Unsupported value: {0}")]
    UnsupportedValue(String),

    /// Schedule definition is not usable.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type alias for Result with FlowError.
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FlowError::StepNotFound(StepId::new("fetch"));
        assert_eq!(err.to_string(), "Step not found: fetch");

        let err = FlowError::InvalidSchedule("interval must be positive".to_string());
        assert_eq!(err.to_string(), "Invalid schedule: interval must be positive");
    }
}
