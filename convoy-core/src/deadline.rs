//! Request deadlines passed down from the inbound turn.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Request deadline exceeded")]
pub struct DeadlineExceeded;

impl From<DeadlineExceeded> for convoy_common::Error {
    fn from(_: DeadlineExceeded) -> Self {
        Self::Timeout
    }
}

/// Absolute point in time by which a request must finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// `limit`, shortened to what is left of the deadline.
    pub fn cap(&self, limit: Duration) -> Duration {
        limit.min(self.remaining())
    }

    /// Run `fut`, abandoning it once the deadline passes.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, DeadlineExceeded> {
        tokio::time::timeout_at(self.at, fut)
            .await
            .map_err(|_| DeadlineExceeded)
    }
}
