//! Capped exponential backoff for retryable failures.
//!
//! Callers wrap an operation explicitly:
//!
//! ```rust,ignore
//! let result = with_retry(&policy, "query", || async {
//!     manager.query(sql, &params, &options).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Random extra delay, as a fraction of the exponential delay (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay after failed attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1) * (1 + jitter), max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.delay_with_sample(attempt, rand::random::<f64>())
    }

    /// [`RetryPolicy::delay_for_attempt`] with the random draw in `[0, 1)`
    /// supplied by the caller
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.min(31) as i32 - 1;
        let jitter = 1.0 + self.jitter_factor * sample.clamp(0.0, 1.0);
        let delay_ms = self.base_delay.as_millis() as f64 * 2f64.powi(exponent) * jitter;
        let capped = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped as u64)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the attempt ceiling is reached. The last error is returned unchanged.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    "{} failed on attempt {}/{} ({}), retrying in {}ms",
                    label,
                    attempt,
                    policy.max_attempts,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
