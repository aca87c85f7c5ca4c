//! Explicit per-request call context.
//!
//! A `Context` travels through every store and collaborator call. It carries
//! the request deadline and, while a unit of work is open, an opaque binding
//! to that unit of work. The binding type is private to the transaction
//! module, so nothing else can forge or inspect it.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::transaction::Binding;

/// Returned when a guarded call outlives the context deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("deadline exceeded")]
pub struct DeadlineExceeded;

#[derive(Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    unit_of_work: Option<Binding>,
}

impl Context {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with the given deadline. An existing earlier
    /// deadline wins.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(current) if current <= deadline => current,
            _ => deadline,
        };
        Self {
            deadline: Some(deadline),
            unit_of_work: self.unit_of_work.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Drive `fut` to completion unless the deadline fires first.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, DeadlineExceeded> {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, fut)
                .await
                .map_err(|_| DeadlineExceeded),
            None => Ok(fut.await),
        }
    }

    pub(crate) fn unit_of_work(&self) -> Option<&Binding> {
        self.unit_of_work.as_ref()
    }

    pub(crate) fn bind(&self, binding: Binding) -> Self {
        Self {
            deadline: self.deadline,
            unit_of_work: Some(binding),
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("deadline", &self.deadline)
            .field("in_unit_of_work", &self.unit_of_work.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_context_never_times_out() {
        let ctx = Context::background();
        assert!(ctx.deadline().is_none());
        assert!(!ctx.is_expired());
        assert_eq!(ctx.guard(async { 5 }).await, Ok(5));
    }

    #[tokio::test]
    async fn test_guard_aborts_after_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let result = ctx
            .guard(tokio::time::sleep(Duration::from_millis(500)))
            .await;
        assert_eq!(result, Err(DeadlineExceeded));
        assert!(ctx.is_expired());
    }

    #[test]
    fn test_earlier_deadline_is_kept() {
        let ctx = Context::background().with_timeout(Duration::from_millis(10));
        let looser = ctx.with_timeout(Duration::from_secs(60));
        assert_eq!(looser.deadline(), ctx.deadline());
    }

    #[test]
    fn test_fresh_context_has_no_unit_of_work() {
        assert!(Context::background().unit_of_work().is_none());
    }
}
