//! Shared cancellable execution scope for listeners and background loops.
//!
//! A [`Lifetime`] is a cancellation token that remembers *why* it was cancelled. The
//! first cause wins; later `cancel` calls are no-ops, so cancellation is monotonic and
//! idempotent. Child scopes observe their parent's cancellation but cancelling a child
//! never reaches the parent.
use std::{
    fmt,
    sync::{Arc, OnceLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// What ended a serving session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Operator signal (SIGINT / SIGTERM).
    Signal,
    /// The configured absolute deadline elapsed.
    Deadline,
    /// A listener stopped on its own, ending the whole session.
    ListenerFailure,
    /// Programmatic cancellation (tests, embedding applications).
    Requested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CancelReason::Signal => "signal",
            CancelReason::Deadline => "deadline",
            CancelReason::ListenerFailure => "listener failure",
            CancelReason::Requested => "requested",
        };
        f.write_str(s)
    }
}

#[derive(Clone)]
pub struct Lifetime {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
    parent: Option<Arc<OnceLock<CancelReason>>>,
}

impl Lifetime {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
            parent: None,
        }
    }

    /// Derive a scope that is cancelled with `self` but can also be cancelled alone.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: Arc::new(OnceLock::new()),
            parent: Some(self.reason.clone()),
        }
    }

    /// Cancel the scope, recording `reason` if this is the first cancellation.
    pub fn cancel(&self, reason: CancelReason) {
        if self.token.is_cancelled() {
            return;
        }
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the scope (or any ancestor) is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// The first recorded cause, falling back to the parent's when the cancellation
    /// came from above.
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.token.is_cancelled() {
            return None;
        }
        self.reason
            .get()
            .or_else(|| self.parent.as_ref().and_then(|p| p.get()))
            .copied()
            .or(Some(CancelReason::Requested))
    }

    /// Raw token for APIs that take a `CancellationToken`.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this scope with [`CancelReason::Deadline`] at the given wall-clock instant.
    ///
    /// A deadline in the past cancels on the timer task's first poll. The task exits early
    /// if the scope is cancelled for any other reason.
    pub fn bind_deadline(&self, deadline: DateTime<Utc>) -> JoinHandle<()> {
        let remaining = until(deadline);
        tracing::info!(
            deadline = %deadline,
            duration = %humantime::format_duration(remaining),
            "deadline set"
        );

        let scope = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {
                    tracing::info!(deadline = %deadline, "deadline reached");
                    scope.cancel(CancelReason::Deadline);
                }
                _ = scope.cancelled() => {}
            }
        })
    }
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Lifetime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifetime")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

/// Time left until `deadline`, zero if it already passed. Sub-millisecond precision is
/// dropped.
fn until(deadline: DateTime<Utc>) -> Duration {
    (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}
