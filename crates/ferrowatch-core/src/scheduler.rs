//! Interval driver for registered jobs.
//!
//! Each job gets its own ticker. Ticks missed while the runtime was busy are
//! skipped, never bunched up. Every tick spawns a cycle, so a slow cycle does
//! not delay the next tick; non-reentrant jobs turn the overlap into a skip
//! inside [`JobRunner::run_cycle`]. A separate ticker sweeps expired
//! notification records.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::gate::NotificationGate;
use crate::polling::{CycleReport, JobRunner};

struct ScheduledJob {
    runner: Arc<JobRunner>,
    period: Duration,
}

pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    gate: Arc<NotificationGate>,
    clock: Arc<dyn Clock>,
    sweep_every: Duration,
}

impl Scheduler {
    pub fn new(gate: Arc<NotificationGate>, clock: Arc<dyn Clock>, sweep_every: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            gate,
            clock,
            sweep_every,
        }
    }

    /// Drive `runner` every `period`. Zero periods are ignored.
    pub fn register(&mut self, runner: Arc<JobRunner>, period: Duration) {
        if period.is_zero() {
            warn!(job = runner.name(), "zero interval, job not scheduled");
            return;
        }
        self.jobs.push(ScheduledJob { runner, period });
    }

    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|job| job.runner.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// One cycle of every job, concurrently.
    pub async fn run_once(&self) -> Vec<CycleReport> {
        join_all(self.jobs.iter().map(|job| job.runner.run_cycle())).await
    }

    /// Start the tickers on the current runtime.
    pub fn start(self) -> SchedulerHandle {
        let (shutdown, watcher) = watch::channel(false);
        let mut tasks = Vec::with_capacity(self.jobs.len() + 1);

        for job in self.jobs {
            info!(
                job = job.runner.name(),
                interval_ms = u64::try_from(job.period.as_millis()).unwrap_or(u64::MAX),
                "scheduling job"
            );
            tasks.push(tokio::spawn(drive(job, watcher.clone())));
        }
        tasks.push(tokio::spawn(sweep(
            self.gate,
            self.clock,
            self.sweep_every,
            watcher,
        )));

        SchedulerHandle { shutdown, tasks }
    }
}

/// Stops the tickers started by [`Scheduler::start`].
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Stop ticking and wait for in-flight cycles to finish.
    pub async fn shutdown(self) {
        // Receivers only disappear once their task has ended.
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(error) = task.await {
                warn!(error = %error, "scheduler task ended abnormally");
            }
        }
    }
}

async fn drive(job: ScheduledJob, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(job.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycles = JoinSet::new();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let runner = Arc::clone(&job.runner);
                cycles.spawn(async move { runner.run_cycle().await });
            }
            Some(finished) = cycles.join_next(), if !cycles.is_empty() => {
                if let Err(error) = finished {
                    warn!(job = job.runner.name(), error = %error, "cycle task panicked");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    while cycles.join_next().await.is_some() {}
    debug!(job = job.runner.name(), "job stopped");
}

async fn sweep(
    gate: Arc<NotificationGate>,
    clock: Arc<dyn Clock>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick completes immediately; nothing to sweep yet.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = gate.sweep(clock.now());
                if removed > 0 {
                    debug!(removed, "swept expired notification records");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
