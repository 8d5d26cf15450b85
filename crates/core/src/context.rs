//! Cancellation and deadline propagation for a single request.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::GenerationError;

/// Cancellation signal plus optional deadline, passed down through every
/// blocking stage of a generation request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context with no deadline, cancelled when `cancel` is.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// A context that can never be cancelled and has no deadline.
    pub fn background() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Tighten the deadline to at most `timeout` from now. An earlier
    /// existing deadline is kept. A timeout too large to represent as an
    /// instant adds no deadline.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
            (Some(existing), Some(candidate)) => Some(existing.min(candidate)),
            (existing, None) => existing,
            (None, candidate) => candidate,
        };
        Self {
            cancel: self.cancel,
            deadline,
        }
    }

    /// A derived context whose cancellation does not propagate upwards.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the caller cancels.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Resolves when the deadline passes. Never resolves without one.
    pub async fn deadline_elapsed(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline expires first. Cancellation wins over the deadline.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, GenerationError>
    where
        F: Future<Output = Result<T, GenerationError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(GenerationError::cancelled()),
            _ = self.deadline_elapsed() => Err(GenerationError::timeout("request deadline exceeded")),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn run_returns_inner_result() {
        let ctx = RequestContext::background();
        let value = ctx.run(async { Ok::<_, GenerationError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn run_reports_cancellation() {
        let cancel = CancellationToken::new();
        let ctx = RequestContext::new(cancel.clone());
        cancel.cancel();

        let result = ctx
            .run(std::future::pending::<Result<(), GenerationError>>())
            .await;
        assert_matches!(result, Err(e) if e.kind() == ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn run_reports_deadline_as_timeout() {
        let ctx = RequestContext::background().with_timeout(Duration::from_secs(5));

        let result = ctx
            .run(std::future::pending::<Result<(), GenerationError>>())
            .await;
        assert_matches!(result, Err(e) if e.kind() == ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn with_timeout_keeps_earlier_deadline() {
        let ctx = RequestContext::background().with_timeout(Duration::from_secs(1));
        let first = ctx.deadline().unwrap();
        let ctx = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(first));
    }

    #[tokio::test]
    async fn unrepresentable_timeout_adds_no_deadline() {
        let ctx = RequestContext::background().with_timeout(Duration::MAX);
        assert_eq!(ctx.deadline(), None);

        let value = ctx.run(async { Ok::<_, GenerationError>(1) }).await.unwrap();
        assert_eq!(value, 1);

        let bounded = RequestContext::background().with_timeout(Duration::from_secs(1));
        let first = bounded.deadline();
        assert_eq!(bounded.with_timeout(Duration::MAX).deadline(), first);
    }

    #[tokio::test]
    async fn child_cancellation_stays_local() {
        let parent = RequestContext::background();
        let child = parent.child();
        child.cancel_token().cancel();

        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel_token().cancel();
        assert!(child.is_cancelled());
    }
}
