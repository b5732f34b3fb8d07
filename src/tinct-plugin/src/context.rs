//! Per-call cancellation and deadlines.
//!
//! Every plugin operation takes a [`CallContext`]. A context ends when its
//! token is cancelled or its deadline passes, whichever happens first.
//! Contexts derived with [`CallContext::with_timeout_inside`] share the
//! parent's cancellation and can only ever shorten its deadline.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Why a context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context cancelled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for CallContext {
    fn default() -> Self {
        Self::background()
    }
}

impl CallContext {
    /// A context that never expires on its own.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context that expires after `timeout`. A timeout too large to
    /// represent as an instant means no deadline at all.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Wraps an existing token, e.g. one tied to Ctrl-C handling.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derives a context that ends after `timeout` or when `self` ends,
    /// whichever is sooner.
    pub fn with_timeout_inside(&self, timeout: Duration) -> Self {
        let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
            (Some(existing), Some(candidate)) => Some(existing.min(candidate)),
            (existing, None) => existing,
            (None, candidate) => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    /// Derives a context sharing this one's deadline whose cancellation can
    /// be triggered independently.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Why the context has ended, or `None` while it is still live.
    pub fn error(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if deadline <= Instant::now() => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context ends.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => ContextError::Cancelled,
                _ = sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// Drives `future` unless the context ends first. An already-ended
    /// context never polls the future.
    pub async fn run<F>(&self, future: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        if let Some(err) = self.error() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            output = future => Ok(output),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_pending_work() {
        let ctx = CallContext::with_timeout(Duration::from_millis(100));
        let result = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(result, Err(ContextError::DeadlineExceeded));
        assert_eq!(ctx.error(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn inner_timeout_never_extends_parent() {
        let parent = CallContext::with_timeout(Duration::from_secs(1));
        let inner = parent.with_timeout_inside(Duration::from_secs(5));
        assert_eq!(inner.deadline(), parent.deadline());

        let tighter = parent.with_timeout_inside(Duration::from_millis(10));
        assert!(tighter.deadline() < parent.deadline());
    }

    #[tokio::test]
    async fn unrepresentable_timeouts_mean_no_deadline() {
        let huge = Duration::from_secs(u64::MAX / 2);
        assert!(CallContext::with_timeout(huge).deadline().is_none());
        assert!(CallContext::background()
            .with_timeout_inside(huge)
            .deadline()
            .is_none());

        let parent = CallContext::with_timeout(Duration::from_secs(1));
        let inner = parent.with_timeout_inside(huge);
        assert_eq!(inner.deadline(), parent.deadline());
        assert_eq!(inner.run(async { 3 }).await, Ok(3));
    }

    #[tokio::test]
    async fn parent_cancellation_reaches_children() {
        let parent = CallContext::background();
        let inner = parent.with_timeout_inside(Duration::from_secs(30));
        parent.cancel();
        assert_eq!(inner.error(), Some(ContextError::Cancelled));
        assert_eq!(inner.done().await, ContextError::Cancelled);
    }

    #[tokio::test]
    async fn child_cancellation_leaves_parent_live() {
        let parent = CallContext::background();
        let child = parent.child();
        child.cancel();
        assert!(parent.error().is_none());
        assert_eq!(child.error(), Some(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn completed_work_wins() {
        let ctx = CallContext::with_timeout(Duration::from_secs(10));
        assert_eq!(ctx.run(async { 7 }).await, Ok(7));
        assert!(CallContext::background().remaining().is_none());
    }
}
