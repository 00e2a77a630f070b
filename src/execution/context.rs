//! Run Context
//!
//! Carries the run-wide cancellation signal and an optional deadline.
//! Every handler receives one; blocking handlers should select on
//! [`RunContext::cancelled`] so they return promptly on fail-fast.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::RunError;

/// Cancellation and deadline scope for a run or a single node.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    node: Option<String>,
}

impl RunContext {
    /// Creates a context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limits the context to `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Sets an absolute deadline, keeping the earlier of the two.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        self
    }

    /// Context whose cancellation follows this one but can also be cancelled alone.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            node: self.node.clone(),
        }
    }

    /// Context handed to one node's handler.
    pub fn for_node(&self, node: impl Into<String>, timeout: Option<Duration>) -> Self {
        let ctx = Self {
            token: self.token.clone(),
            deadline: self.deadline,
            node: Some(node.into()),
        };
        match timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    /// Triggers cancellation for this context and every child.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once the context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Identifier of the node this context belongs to.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// Token backing this context.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Runs `fut` until it completes, the context is cancelled, or the deadline passes.
    pub async fn guard<F, T>(&self, fut: F) -> Result<T, RunError>
    where
        F: Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(RunError::Cancelled),
                result = tokio::time::timeout_at(deadline, fut) => Ok(result?),
            },
            None => tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(RunError::Cancelled),
                result = fut => Ok(result),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let ctx = RunContext::new();
        let value = ctx.guard(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_guard_reports_deadline() {
        let ctx = RunContext::new().with_timeout(Duration::from_millis(20));
        let result = ctx
            .guard(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(matches!(result, Err(RunError::DeadlineExceeded(_))));
    }

    #[tokio::test]
    async fn test_guard_observes_cancellation() {
        let ctx = RunContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = ctx
            .guard(tokio::time::sleep(Duration::from_secs(5)))
            .await;
        assert!(matches!(result, Err(RunError::Cancelled)));
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_child_cancelled_by_parent_only() {
        let parent = RunContext::new();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());

        let other = parent.child();
        parent.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_keeps_earliest() {
        let early = Instant::now() + Duration::from_millis(10);
        let late = early + Duration::from_secs(10);
        let ctx = RunContext::new().with_deadline(early).with_deadline(late);
        assert_eq!(ctx.deadline(), Some(early));

        let node = ctx.for_node("step.a", Some(Duration::from_secs(60)));
        assert_eq!(node.deadline(), Some(early));
        assert_eq!(node.node(), Some("step.a"));
    }
}
