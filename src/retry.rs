use crate::error::{CopyError, StoreError};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Bounded exponential backoff for object-level store calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn backoff_for_retry(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, CopyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.run_transfer(what, || {
            let attempt = op();
            async move { attempt.await.map_err(CopyError::Store) }
        })
        .await
    }

    /// Like [`run`](Self::run) for a unit of work that spans several calls,
    /// such as opening a download and draining it to staging. Only transient
    /// store errors restart the unit; every other error is returned as is.
    pub async fn run_transfer<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, CopyError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CopyError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(CopyError::Store(e)) if e.is_transient() && attempt < self.max_attempts => {
                    let backoff = self.backoff_for_retry(attempt);
                    warn!(
                        what = %what,
                        error = %e,
                        attempt = attempt,
                        max_attempts = self.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient store failure, retrying after backoff"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(CopyError::Store(e)) if e.is_transient() => {
                    return Err(CopyError::RetriesExhausted {
                        what: what.to_string(),
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}
