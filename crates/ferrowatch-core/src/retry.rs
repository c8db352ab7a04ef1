//! Retry logic with exponential backoff, triggered only by the rate-limited
//! error class.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::SyncError;

/// Exponential backoff: `base * factor^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    /// Spread each delay uniformly over +/- 50%.
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            factor: 2.0,
            max: Duration::from_secs(60),
            jitter: false,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt + 1` (`attempt` is 0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let seconds = self.base.as_secs_f64() * self.factor.powi(exponent);
        let mut delay = Duration::from_secs_f64(seconds.min(self.max.as_secs_f64()));

        // Uniform in [delay / 2, delay * 3 / 2].
        if self.jitter {
            let half = delay / 2;
            delay = half + delay.mul_f64(fastrand::f64());
        }

        delay
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt; `0` surfaces the first rate limit.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff {
                base,
                max,
                ..Backoff::default()
            },
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.backoff.jitter = jitter;
        self
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

/// Classifies errors for [`retry_rate_limited`].
pub trait RetryClass {
    fn is_rate_limited(&self) -> bool;
}

impl RetryClass for SyncError {
    fn is_rate_limited(&self) -> bool {
        SyncError::is_rate_limited(self)
    }
}

/// Run `operation` until it succeeds, fails with a non-rate-limited error, or
/// exhausts `max_retries`. The closure receives the 0-based attempt number.
///
/// # Errors
/// Returns the last error produced by `operation`.
pub async fn retry_rate_limited<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClass + Display,
{
    let mut attempt = 0u32;

    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_rate_limited() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                attempt += 1;
                warn!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "upstream rate limited, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}
