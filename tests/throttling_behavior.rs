//! Behavior-driven tests for the shared call budget
//!
//! These tests verify HOW outbound calls are paced when every job shares one
//! limiter, focusing on admission times rather than limiter internals.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ferrowatch_core::{
    RateLimitPolicy, RateLimiter, RetryConfig, SyncError, ThrottleError, UpstreamExecutor,
};
use tokio::time::Instant;

fn partner_budget() -> RateLimitPolicy {
    RateLimitPolicy::new(60, Duration::from_secs(60), Duration::from_secs(1)).expect("valid")
}

async fn admit_all(limiter: &Arc<RateLimiter>, calls: usize, start: Instant) -> Vec<Duration> {
    let handles: Vec<_> = (0..calls)
        .map(|_| {
            let limiter = Arc::clone(limiter);
            tokio::spawn(async move {
                limiter
                    .acquire()
                    .await
                    .expect("unbounded queue")
                    .duration_since(start)
            })
        })
        .collect();

    let mut offsets = Vec::with_capacity(calls);
    for handle in handles {
        offsets.push(handle.await.expect("task should not panic"));
    }
    offsets.sort();
    offsets
}

// =============================================================================
// Limiter: Rolling Window
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_hundred_calls_arrive_at_once_no_window_admits_more_than_sixty() {
    // Given: The partner budget of 60 calls per rolling minute, 1s apart
    let limiter = Arc::new(RateLimiter::new(partner_budget()));
    let start = Instant::now();

    // When: 100 calls are issued at the same instant
    let offsets = admit_all(&limiter, 100, start).await;

    // Then: Consecutive admissions are at least one second apart
    for pair in offsets.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(1));
    }

    // And: Each admission is a full window after the one 60 places earlier
    for i in 60..offsets.len() {
        assert!(offsets[i] - offsets[i - 60] >= Duration::from_secs(60));
    }

    // And: Exactly 60 made it in before the first window closed
    assert_eq!(
        offsets
            .iter()
            .filter(|at| **at < Duration::from_secs(60))
            .count(),
        60
    );

    // And: Nothing was dropped
    assert_eq!(offsets.len(), 100);
    assert!(offsets[99] >= Duration::from_secs(99));
}

#[tokio::test(start_paused = true)]
async fn when_two_jobs_share_the_limiter_their_combined_rate_is_bounded() {
    // Given: A tight budget of 4 calls per 10 seconds with no spacing
    let limiter = Arc::new(RateLimiter::new(
        RateLimitPolicy::new(4, Duration::from_secs(10), Duration::ZERO).expect("valid"),
    ));
    let start = Instant::now();

    // When: Two jobs each issue 4 calls at once
    let (first, second) = tokio::join!(
        admit_all(&limiter, 4, start),
        admit_all(&limiter, 4, start)
    );

    // Then: Only 4 calls get through in the first window
    let mut all: Vec<Duration> = first.into_iter().chain(second).collect();
    all.sort();
    assert_eq!(all.iter().filter(|at| **at < Duration::from_secs(10)).count(), 4);
    assert_eq!(all[4], Duration::from_secs(10));
}

// =============================================================================
// Limiter: Back-pressure
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_queue_is_bounded_excess_callers_fail_fast() {
    // Given: A limiter that lets only one caller wait
    let limiter = Arc::new(RateLimiter::new(partner_budget().with_max_queue(1)));
    limiter.acquire().await.expect("first call admitted");

    let waiting = Arc::clone(&limiter);
    let queued = tokio::spawn(async move { waiting.acquire().await });
    while limiter.queued() == 0 {
        tokio::task::yield_now().await;
    }

    // When: Another caller arrives while one is already waiting
    let rejected = limiter.acquire().await;

    // Then: It is refused immediately instead of queueing
    assert_eq!(rejected, Err(ThrottleError::QueueFull { max_queue: 1 }));
    assert!(queued.await.expect("no panic").is_ok());
}

// =============================================================================
// Executor: Retry Interplay
// =============================================================================

#[tokio::test(start_paused = true)]
async fn when_upstream_rate_limits_the_retry_waits_and_spends_a_new_slot() {
    // Given: An executor over the partner budget backing off from 2s
    let executor = UpstreamExecutor::new(
        Arc::new(RateLimiter::new(partner_budget())),
        RetryConfig::exponential(3, Duration::from_secs(2), Duration::from_secs(60)),
        Duration::from_secs(10),
    );
    let attempts = AtomicU32::new(0);
    let start = Instant::now();

    // When: The first attempt is rate limited and the second succeeds
    let result = executor
        .execute(|| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(SyncError::rate_limited("too many requests"))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

    // Then: The call succeeds after the backoff
    assert_eq!(result, Ok(1));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(start.elapsed() >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn when_upstream_fails_otherwise_the_error_surfaces_without_retry() {
    // Given: An executor with retries enabled
    let executor = UpstreamExecutor::new(
        Arc::new(RateLimiter::new(partner_budget())),
        RetryConfig::default(),
        Duration::from_secs(10),
    );
    let attempts = AtomicU32::new(0);

    // When: Upstream answers with a non rate-limit error
    let result: Result<(), SyncError> = executor
        .execute(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::upstream(Some(9), "API disabled")) }
        })
        .await;

    // Then: The error is returned after a single attempt
    assert!(matches!(result, Err(SyncError::Upstream { code: Some(9), .. })));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}
