//! Retry policy with exponential backoff and full jitter.
//!
//! Transport errors (network, object store, fleet API) are retried up to
//! `max_retries` times. Each attempt waits `base * 2^attempt` capped at
//! `max_delay`, with full jitter to spread simultaneous retries.

use std::future::Future;
use std::time::Duration;

/// Backoff configuration.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// Maximum retry attempts after the initial try.
    pub max_retries: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), with full jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        let max_ms = exp.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::random_range(0..=max_ms))
    }

    /// Deterministic upper bound for retry number `attempt` (0-based).
    ///
    /// Used by callers that need to report `retryAfterMs`-style hints without
    /// sampling jitter.
    pub fn max_delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Run `op` with retries per `config`.
///
/// `should_retry` classifies errors; non-retryable errors and exhaustion
/// both surface the last error unchanged.
pub async fn retry_with_backoff<T, E, Fut>(
    config: &RetryConfig,
    should_retry: impl Fn(&E) -> bool,
    mut op: impl FnMut() -> Fut,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if should_retry(&err) && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
