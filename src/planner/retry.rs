//! Per-operation timeout and bounded exponential backoff.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ApplyConfig;
use crate::error::ProviderError;

/// Retry settings for plugin operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

impl From<&ApplyConfig> for RetryPolicy {
    fn from(config: &ApplyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: 2,
        }
    }
}

/// Outcome of a retried operation.
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result.
    pub result: Result<T, ProviderError>,
    /// Attempts made.
    pub attempts: u32,
}

impl RetryPolicy {
    /// Retries with no delay, for tests.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Delay after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// Runs `operation` until it succeeds, fails permanently, or the attempt
    /// ceiling is reached. Each attempt is bounded by `timeout`.
    ///
    /// Only transient failures and timeouts are retried. No new attempt
    /// starts once `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = tokio::time::timeout(timeout, operation())
                .await
                .unwrap_or_else(|_| {
                    Err(ProviderError::Timeout {
                        operation: name.to_string(),
                        timeout_secs: timeout.as_secs(),
                    })
                });

            match result {
                Err(e) if e.is_transient() && attempt < max_attempts && !cancel.is_cancelled() => {
                    let delay = self.backoff(attempt);
                    warn!("{name} failed (attempt {attempt}/{max_attempts}): {e}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                }
                result => {
                    if attempt > 1 {
                        debug!("{name} finished after {attempt} attempts");
                    }
                    return Attempted {
                        result,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}
