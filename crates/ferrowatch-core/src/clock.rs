//! Wall-clock abstraction.
//!
//! Staleness and gate decisions compare wall-clock timestamps; they take the
//! time from a [`Clock`] so tests can pin it. Waiting (limiter, backoff) uses
//! `tokio::time` instead, which tests pause and advance.

use std::sync::Mutex;
use std::time::Duration;

use crate::domain::UtcDateTime;

pub trait Clock: Send + Sync {
    fn now(&self) -> UtcDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> UtcDateTime {
        UtcDateTime::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<UtcDateTime>,
}

impl ManualClock {
    pub fn new(start: UtcDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: UtcDateTime) {
        *self.now.lock().expect("manual clock lock is not poisoned") = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("manual clock lock is not poisoned");
        if let Some(next) = now.checked_add(by) {
            *now = next;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> UtcDateTime {
        *self.now.lock().expect("manual clock lock is not poisoned")
    }
}
