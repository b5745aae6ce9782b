//! Cancellation scopes.
//!
//! A scope is a monotone flag: once cancelled it stays cancelled, and the
//! first reason given wins. Job scopes are children of the run scope, so
//! cancelling the run reaches every job while aborting one job leaves the
//! rest alone.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Why a scope was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The user interrupted the run (e.g. Ctrl-C).
    UserInterrupt,
    /// A job failed under the `terminate` error policy.
    FailFast,
    /// A per-job timeout expired.
    Timeout,
    /// Cancellation was requested programmatically.
    Requested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::UserInterrupt => "interrupted by user",
            CancelReason::FailFast => "terminated after a failure",
            CancelReason::Timeout => "timed out",
            CancelReason::Requested => "cancellation requested",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct CancelScope {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    parent: Option<Arc<CancelScope>>,
}

impl CancelScope {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            parent: None,
        }
    }

    /// Create a scope that is cancelled whenever this one is, but can also
    /// be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::new(OnceLock::new()),
            parent: Some(Arc::new(self.clone())),
        }
    }

    /// Cancel the scope. Returns true if this call was the one that
    /// cancelled it.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        // Already cancelled, possibly through an ancestor whose reason
        // stands.
        if self.token.is_cancelled() {
            return false;
        }
        // The reason is published before the token fires so anyone woken
        // by the token can read it.
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason this scope was cancelled, inherited from the nearest
    /// cancelled ancestor when it was not cancelled directly.
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        self.reason
            .get()
            .copied()
            .or_else(|| self.parent.as_ref().and_then(|p| p.reason()))
    }

    /// Wait until the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let scope = CancelScope::new();
        assert!(scope.reason().is_none());

        assert!(scope.cancel(CancelReason::UserInterrupt));
        assert!(!scope.cancel(CancelReason::Timeout));

        assert!(scope.is_cancelled());
        assert_eq!(scope.reason(), Some(CancelReason::UserInterrupt));
    }

    #[test]
    fn test_child_inherits_parent_reason() {
        let run = CancelScope::new();
        let job = run.child();

        run.cancel(CancelReason::FailFast);

        assert!(job.is_cancelled());
        assert_eq!(job.reason(), Some(CancelReason::FailFast));
    }

    #[test]
    fn test_child_cancel_does_not_reach_parent() {
        let run = CancelScope::new();
        let job = run.child();
        let sibling = run.child();

        job.cancel(CancelReason::Timeout);

        assert!(job.is_cancelled());
        assert!(!run.is_cancelled());
        assert!(!sibling.is_cancelled());
        assert_eq!(job.reason(), Some(CancelReason::Timeout));
    }

    #[test]
    fn test_child_keeps_parent_reason_after_own_cancel() {
        let run = CancelScope::new();
        let job = run.child();

        run.cancel(CancelReason::UserInterrupt);

        assert!(!job.cancel(CancelReason::Timeout));
        assert_eq!(job.reason(), Some(CancelReason::UserInterrupt));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let scope = CancelScope::new();
        let waiter = scope.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        scope.cancel(CancelReason::Requested);
        handle.await.unwrap();
    }
}
