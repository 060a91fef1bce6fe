//! Per-request cancellation and deadline.
//!
//! Access checks and store calls are the only points where a mutation can block. Each one is
//! run through [`RequestContext::run`], which races it against the caller's cancellation token
//! and deadline. A store write that loses the race is dropped before it commits.

use crate::error::{MutationError, MutationResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context cancelled through `token`.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancel: token,
            deadline: None,
        }
    }

    /// Adds a deadline `timeout` from now. An earlier existing deadline is kept.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fails fast if the request is already cancelled or past its deadline.
    pub fn check(&self) -> MutationResult<()> {
        if self.cancel.is_cancelled() {
            return Err(MutationError::Cancelled);
        }
        if matches!(self.deadline, Some(deadline) if Instant::now() >= deadline) {
            return Err(MutationError::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drives `fut` to completion unless the request is cancelled or times out first.
    pub async fn run<F, T>(&self, fut: F) -> MutationResult<T>
    where
        F: Future<Output = T>,
    {
        self.check()?;

        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(MutationError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => Err(MutationError::DeadlineExceeded),
                out = fut => Ok(out),
            },
            None => tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(MutationError::Cancelled),
                out = fut => Ok(out),
            },
        }
    }
}
