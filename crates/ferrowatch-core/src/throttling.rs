//! Shared outbound-call limiter.
//!
//! Admits at most `capacity` calls in any rolling `window` and keeps at least
//! `min_spacing` between two admissions. Callers over budget wait in FIFO
//! order: the state lock is a fair `tokio::sync::Mutex` held across the wait,
//! so later callers queue behind it in arrival order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::debug;

use crate::ValidationError;

/// Rejection raised instead of queueing when the waiter bound is reached.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleError {
    #[error("rate limiter queue is full ({max_queue} waiters)")]
    QueueFull { max_queue: usize },
}

/// Budget enforced by [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub capacity: u32,
    pub window: Duration,
    pub min_spacing: Duration,
    /// Maximum number of concurrent waiters; `None` queues without bound.
    pub max_queue: Option<usize>,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            capacity: 60,
            window: Duration::from_secs(60),
            min_spacing: Duration::from_secs(1),
            max_queue: None,
        }
    }
}

impl RateLimitPolicy {
    pub fn new(
        capacity: u32,
        window: Duration,
        min_spacing: Duration,
    ) -> Result<Self, ValidationError> {
        let policy = Self {
            capacity,
            window,
            min_spacing,
            max_queue: None,
        };
        policy.validate()?;
        Ok(policy)
    }

    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = Some(max_queue);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.capacity == 0 {
            return Err(ValidationError::ZeroCapacity);
        }
        if self.window.is_zero() {
            return Err(ValidationError::ZeroWindow);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct AdmissionLog {
    admitted: VecDeque<Instant>,
    last: Option<Instant>,
}

impl AdmissionLog {
    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.admitted.front() {
            if now.saturating_duration_since(*front) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    /// Earliest instant at which the next call may be admitted.
    fn next_slot(&self, now: Instant, policy: &RateLimitPolicy) -> Instant {
        let mut ready = now;

        if self.admitted.len() >= policy.capacity as usize {
            if let Some(front) = self.admitted.front() {
                ready = ready.max(*front + policy.window);
            }
        }
        if let Some(last) = self.last {
            ready = ready.max(last + policy.min_spacing);
        }

        ready
    }

    fn record(&mut self, at: Instant) {
        self.admitted.push_back(at);
        self.last = Some(at);
    }
}

/// Process-wide limiter every outbound call passes through.
#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    log: Mutex<AdmissionLog>,
    waiting: AtomicUsize,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            log: Mutex::new(AdmissionLog::default()),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Callers currently waiting for a slot.
    pub fn queued(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Wait for an admission slot and consume it.
    ///
    /// A caller admitted on arrival never counts against `max_queue`.
    ///
    /// # Errors
    /// Returns [`ThrottleError::QueueFull`] when `max_queue` callers are
    /// already waiting.
    pub async fn acquire(&self) -> Result<Instant, ThrottleError> {
        // A held or contended lock means someone is already queued ahead.
        if let Ok(mut log) = self.log.try_lock() {
            if let Some(admitted) = self.admit_now(&mut log) {
                return Ok(admitted);
            }
            let _waiter = self.enter_queue()?;
            return Ok(self.wait_for_slot(log).await);
        }

        let _waiter = self.enter_queue()?;
        let log = self.log.lock().await;
        Ok(self.wait_for_slot(log).await)
    }

    fn admit_now(&self, log: &mut AdmissionLog) -> Option<Instant> {
        let now = Instant::now();
        log.evict(now, self.policy.window);
        if log.next_slot(now, &self.policy) <= now {
            log.record(now);
            return Some(now);
        }
        None
    }

    async fn wait_for_slot(&self, mut log: MutexGuard<'_, AdmissionLog>) -> Instant {
        loop {
            if let Some(admitted) = self.admit_now(&mut log) {
                return admitted;
            }

            let now = Instant::now();
            let ready = log.next_slot(now, &self.policy);
            debug!(
                wait_ms = u64::try_from(ready.saturating_duration_since(now).as_millis())
                    .unwrap_or(u64::MAX),
                in_window = log.admitted.len(),
                "rate limiter budget exhausted, waiting"
            );
            tokio::time::sleep_until(ready).await;
        }
    }

    fn enter_queue(&self) -> Result<WaiterGuard<'_>, ThrottleError> {
        let previous = self.waiting.fetch_add(1, Ordering::SeqCst);
        let guard = WaiterGuard {
            waiting: &self.waiting,
        };

        if let Some(max_queue) = self.policy.max_queue {
            if previous >= max_queue {
                return Err(ThrottleError::QueueFull { max_queue });
            }
        }

        Ok(guard)
    }
}

struct WaiterGuard<'a> {
    waiting: &'a AtomicUsize,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}
