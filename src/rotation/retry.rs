//! Bounded retry for external calls.
//!
//! Only [`ClientError::Transient`] is retried. Everything else is returned on
//! the first attempt, since retrying cannot fix permissions or configuration.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::ClientError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No retries, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Exponential backoff with up to 25% jitter, capped at `max_delay`.
    /// `attempt` is the attempt that just failed, starting at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_ms = base.as_millis() as u64 / 4;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        (base + Duration::from_millis(jitter)).min(self.max_delay.max(base))
    }

    /// Upper bound of [`delay_after`](Self::delay_after), jitter included.
    pub fn max_delay_after(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        (base + base / 4).min(self.max_delay.max(base))
    }

    /// Longest time `retry_transient` can spend sleeping between attempts.
    pub fn max_total_backoff(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|attempt| self.max_delay_after(attempt)).sum()
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Result of a retried operation along with the number of attempts made.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, ClientError>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy's attempt budget is spent.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_after(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    ?delay,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return Attempted {
                    result: Err(err),
                    attempts: attempt,
                }
            }
        }
    }
}
