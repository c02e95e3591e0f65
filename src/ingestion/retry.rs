//! Bounded retry with exponential backoff
//!
//! Wraps flaky I/O (object storage, source and destination databases).
//! Only errors that report themselves as retryable are attempted again.

use crate::config::duration_ms;
use crate::error::{LumosError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: usize,
    /// Delay before the second attempt
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Maximum delay between attempts
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
    /// Random extra delay as a fraction of the computed delay (0.0 - 1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Single attempt, no waiting. Useful in tests and for dry runs.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter: 0.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(LumosError::Configuration(
                "retry max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter) || self.backoff_multiplier < 1.0 {
            return Err(LumosError::Configuration(
                "retry jitter must be within [0, 1] and backoff_multiplier >= 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn delay_for_retry(&self, retry: usize) -> Duration {
        let delay_ms =
            (self.base_delay.as_millis() as f64) * self.backoff_multiplier.powi(retry as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay.mul_f64(1.0 + extra)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempt budget is spent. Returns the last error and the number
    /// of attempts made.
    pub async fn run<F, Fut, T>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> std::result::Result<T, (LumosError, usize)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.max_attempts.max(1);

        for attempt in 1..=attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt == attempts || !err.is_retryable() {
                        return Err((err, attempt));
                    }
                    let delay = self.jittered(self.delay_for_retry(attempt - 1));
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        unreachable!("retry loop always returns within the attempt budget")
    }
}
