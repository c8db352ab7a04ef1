use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::retry::{retry_rate_limited, RetryConfig};
use crate::throttling::RateLimiter;
use crate::SyncError;

/// Runs outbound calls through the shared limiter with per-attempt timeouts
/// and rate-limit retries.
///
/// Every attempt, retries included, consumes one limiter admission. A timeout
/// is reported as [`SyncError::Timeout`] and never retried.
#[derive(Debug, Clone)]
pub struct UpstreamExecutor {
    limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    call_timeout: Duration,
}

impl UpstreamExecutor {
    pub fn new(limiter: Arc<RateLimiter>, retry: RetryConfig, call_timeout: Duration) -> Self {
        Self {
            limiter,
            retry,
            call_timeout,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// # Errors
    /// Returns the last error of `call`, a timeout, or limiter back-pressure.
    pub async fn execute<T, F, Fut>(&self, mut call: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let limiter = &self.limiter;
        let call_timeout = self.call_timeout;

        retry_rate_limited(&self.retry, |attempt| {
            let pending = call();
            async move {
                limiter.acquire().await?;
                debug!(attempt, "outbound call admitted");

                match tokio::time::timeout(call_timeout, pending).await {
                    Ok(result) => result,
                    Err(_) => Err(SyncError::Timeout {
                        timeout_ms: u64::try_from(call_timeout.as_millis()).unwrap_or(u64::MAX),
                    }),
                }
            }
        })
        .await
    }
}
