//! Per-attempt step timeouts.
//!
//! A step's effective timeout is its own, falling back to the runtime
//! default. The limit applies to each attempt separately; a timed-out
//! attempt counts as a failure and may be retried.

use std::future::Future;
use std::time::Duration;
use toolflow_core::{Step, StepId};

/// Error types for timeout operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TimeoutError {
    /// Step attempt exceeded its time limit
    #[error("Step '{step_id}' exceeded timeout limit of {timeout:?}")]
    StepTimeout { step_id: StepId, timeout: Duration },
}

/// Timeout for one step attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepTimeout(Duration);

impl StepTimeout {
    /// Creates a new StepTimeout with the specified duration.
    ///
    /// # Example
    ///
    /// ```
    /// use toolflow_agent::workflow::timeout::StepTimeout;
    /// use std::time::Duration;
    ///
    /// let timeout = StepTimeout::new(Duration::from_secs(30));
    /// assert_eq!(timeout.duration(), Duration::from_secs(30));
    /// ```
    pub fn new(duration: Duration) -> Self {
        Self(duration)
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub fn duration(&self) -> Duration {
        self.0
    }

    /// Effective timeout of `step`, using `default` when it declares none.
    pub fn for_step(step: &Step, default: Option<Duration>) -> Option<Self> {
        step.timeout().or(default).map(Self)
    }
}

/// Runs `future`, failing with [`TimeoutError::StepTimeout`] once `timeout`
/// elapses. Without a timeout the future runs to completion.
///
/// The future is dropped on timeout; callers that spawned work behind it
/// must abort that work themselves.
pub async fn with_timeout<F, T>(
    step_id: &StepId,
    timeout: Option<StepTimeout>,
    future: F,
) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    match timeout {
        None => Ok(future.await),
        Some(limit) => tokio::time::timeout(limit.duration(), future)
            .await
            .map_err(|_| TimeoutError::StepTimeout {
                step_id: step_id.clone(),
                timeout: limit.duration(),
            }),
    }
}
