//! Job descriptor collaborator.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use ferrowatch_warehouse::Warehouse;

use crate::domain::UtcDateTime;
use crate::SyncError;

type RegistryFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SyncError>> + Send + 'a>>;

/// Read before a cycle, written after it.
pub trait JobRegistry: Send + Sync {
    fn is_enabled<'a>(&'a self, job: &'a str) -> RegistryFuture<'a, bool>;

    fn record_run<'a>(&'a self, job: &'a str, at: UtcDateTime) -> RegistryFuture<'a, ()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct JobState {
    enabled: bool,
    last_run: Option<UtcDateTime>,
}

/// Registry kept in memory. Jobs it has never heard of count as enabled.
#[derive(Debug, Default)]
pub struct InMemoryJobRegistry {
    jobs: Mutex<HashMap<String, JobState>>,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_enabled(&self, job: &str, enabled: bool) {
        self.jobs
            .lock()
            .expect("job registry lock is not poisoned")
            .entry(job.to_owned())
            .or_default()
            .enabled = enabled;
    }

    pub fn last_run(&self, job: &str) -> Option<UtcDateTime> {
        self.jobs
            .lock()
            .expect("job registry lock is not poisoned")
            .get(job)
            .and_then(|state| state.last_run)
    }
}

impl JobRegistry for InMemoryJobRegistry {
    fn is_enabled<'a>(&'a self, job: &'a str) -> RegistryFuture<'a, bool> {
        Box::pin(async move {
            Ok(self
                .jobs
                .lock()
                .expect("job registry lock is not poisoned")
                .get(job)
                .map_or(true, |state| state.enabled))
        })
    }

    fn record_run<'a>(&'a self, job: &'a str, at: UtcDateTime) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            self.jobs
                .lock()
                .expect("job registry lock is not poisoned")
                .entry(job.to_owned())
                .or_insert_with(|| JobState {
                    enabled: true,
                    last_run: None,
                })
                .last_run = Some(at);
            Ok(())
        })
    }
}

impl JobRegistry for Warehouse {
    fn is_enabled<'a>(&'a self, job: &'a str) -> RegistryFuture<'a, bool> {
        Box::pin(async move {
            let warehouse = self.clone();
            let name = job.to_owned();
            let record = tokio::task::spawn_blocking(move || warehouse.job(&name))
                .await
                .map_err(|error| SyncError::Registry(format!("registry task failed: {error}")))?
                .map_err(|error| SyncError::Registry(error.to_string()))?;

            Ok(record.map_or(true, |record| record.enabled))
        })
    }

    fn record_run<'a>(&'a self, job: &'a str, at: UtcDateTime) -> RegistryFuture<'a, ()> {
        Box::pin(async move {
            let warehouse = self.clone();
            let name = job.to_owned();
            let ran_at = at.format_rfc3339();
            tokio::task::spawn_blocking(move || warehouse.record_job_run(&name, &ran_at))
                .await
                .map_err(|error| SyncError::Registry(format!("registry task failed: {error}")))?
                .map_err(|error| SyncError::Registry(error.to_string()))
        })
    }
}
