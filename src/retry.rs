//! Fixed-attempt retry with a constant backoff.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};
use crate::throttle::Throttle;

pub const DEFAULT_ATTEMPTS: usize = 5;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: usize, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out.  Non-retryable errors are returned unchanged;
    /// exhaustion wraps the last error in [`Error::RetriesExhausted`].
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempt >= attempts {
                return Err(Error::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }
            warn!(what, attempt, error = %err, "retrying");
            tokio::time::sleep(self.backoff).await;
        }
    }
}

/// Retry `op`, holding a throttle slot for the duration of each attempt
/// (not across backoff sleeps).
pub async fn throttled<T, F, Fut>(
    throttle: &Throttle,
    retry: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry
        .run(what, || {
            let fut = op();
            let throttle = throttle.clone();
            async move {
                let _slot = throttle.take().await?;
                fut.await
            }
        })
        .await
}
