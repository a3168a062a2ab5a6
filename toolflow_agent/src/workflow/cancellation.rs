//! Async cancellation tokens for workflow executions.
//!
//! A [`CancellationTokenSource`] is owned by the orchestrator for each run.
//! Step runners receive [`CancellationToken`] clones and race their tool
//! invocation and retry sleeps against [`CancellationToken::cancelled`].
//!
//! # Example
//!
//! ```ignore
//! use toolflow_agent::workflow::CancellationTokenSource;
//!
//! let source = CancellationTokenSource::new();
//! let token = source.token();
//!
//! tokio::spawn(async move {
//!     tokio::select! {
//!         _ = token.cancelled() => { /* stop */ }
//!         _ = do_work() => {}
//!     }
//! });
//!
//! source.cancel();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Thread-safe cancellation token.
///
/// Clones share state: once the owning source cancels, every clone reports
/// cancelled and every pending [`cancelled`](Self::cancelled) future wakes.
#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancellationToken {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Returns true if the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Completes once the token is cancelled.
    ///
    /// Returns immediately if cancellation already happened. The waiter is
    /// registered before the flag is checked, so a concurrent `cancel`
    /// cannot be missed.
    pub async fn cancelled(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Owner of a cancellation token.
#[derive(Clone, Debug)]
pub struct CancellationTokenSource {
    token: CancellationToken,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Returns a token sharing this source's state.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancels the token and wakes all waiters. Idempotent.
    pub fn cancel(&self) {
        self.token.cancelled.store(true, Ordering::SeqCst);
        self.token.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_token_initially_not_cancelled() {
        let source = CancellationTokenSource::new();
        assert!(!source.token().is_cancelled());
        assert!(!source.is_cancelled());
    }

    #[test]
    fn test_cancel_propagates_to_clones() {
        let source = CancellationTokenSource::new();
        let token1 = source.token();
        let token2 = token1.clone();

        source.cancel();
        source.cancel();

        assert!(token1.is_cancelled());
        assert!(token2.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let source = CancellationTokenSource::new();
        source.cancel();

        tokio::time::timeout(Duration::from_millis(50), source.token().cancelled())
            .await
            .expect("should not wait");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wakes_waiter() {
        let source = CancellationTokenSource::new();
        let token = source.token();

        let waiter = tokio::spawn(async move {
            token.cancelled().await;
            true
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        source.cancel();
        assert!(waiter.await.unwrap());
    }
}
