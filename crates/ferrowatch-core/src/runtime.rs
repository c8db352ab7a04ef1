//! Wiring from [`SyncConfig`] to a running [`Scheduler`].

use std::sync::Arc;

use tracing::info;

use crate::cache::AdaptiveCache;
use crate::clock::Clock;
use crate::config::{ConfigError, JobSchedule, SyncConfig};
use crate::executor::UpstreamExecutor;
use crate::http_client::HttpClient;
use crate::jobs::{
    FactionChainJob, MarketWatchJob, UserStatusJob, FACTION_CHAIN_JOB, MARKET_WATCH_JOB,
    USER_STATUS_JOB,
};
use crate::notify::{AlertSink, LogSink, WebhookSink};
use crate::partner_api::{HttpPartnerApi, PartnerApi};
use crate::polling::{JobRunner, JobSpec, SyncContext};
use crate::registry::{InMemoryJobRegistry, JobRegistry};
use crate::rotation::CredentialRotator;
use crate::scheduler::Scheduler;
use crate::store::{FieldStore, InMemoryFieldStore};
use crate::throttling::RateLimiter;

/// External collaborators a context is built around.
pub struct Collaborators {
    pub api: Arc<dyn PartnerApi>,
    pub store: Arc<dyn FieldStore>,
    pub sink: Arc<dyn AlertSink>,
    pub registry: Arc<dyn JobRegistry>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    /// In-memory store and registry, alerts logged instead of sent.
    pub fn in_memory(api: Arc<dyn PartnerApi>, clock: Arc<dyn Clock>) -> Self {
        Self {
            api,
            store: Arc::new(InMemoryFieldStore::new()),
            sink: Arc::new(LogSink),
            registry: Arc::new(InMemoryJobRegistry::new()),
            clock,
        }
    }
}

/// # Errors
/// Returns an error when the rate limit settings are invalid.
pub fn build_context(
    config: &SyncConfig,
    collaborators: Collaborators,
) -> Result<SyncContext, ConfigError> {
    let limiter = Arc::new(RateLimiter::new(config.rate_limit_policy()?));
    let executor = UpstreamExecutor::new(limiter, config.retry_config(), config.call_timeout());
    let cache = AdaptiveCache::new(
        collaborators.store,
        config.field_policies(),
        Arc::clone(&collaborators.clock),
    );

    Ok(SyncContext {
        executor,
        api: collaborators.api,
        cache: Arc::new(cache),
        gate: Arc::new(config.notification_gate()),
        sink: collaborators.sink,
        registry: collaborators.registry,
        rotator: Arc::new(CredentialRotator::new()),
        clock: collaborators.clock,
    })
}

pub fn partner_api(config: &SyncConfig, http_client: Arc<dyn HttpClient>) -> HttpPartnerApi {
    HttpPartnerApi::new(http_client, &config.api.base_url, config.api.call_timeout_ms)
}

pub fn webhook_sink(config: &SyncConfig, http_client: Arc<dyn HttpClient>) -> WebhookSink {
    config.notify.routes.iter().fold(
        WebhookSink::new(
            http_client,
            config.notify.webhook_url.clone(),
            config.webhook_per_minute(),
            config.notify.timeout_ms,
        ),
        |sink, (target, url)| sink.with_route(target, url),
    )
}

/// Configured jobs with their schedules, disabled ones included.
pub fn configured_jobs(config: &SyncConfig) -> Vec<(Arc<dyn JobSpec>, JobSchedule)> {
    let jobs = &config.jobs;
    config
        .schedules()
        .into_iter()
        .filter_map(|schedule| {
            let spec: Arc<dyn JobSpec> = match schedule.name {
                USER_STATUS_JOB => Arc::new(UserStatusJob::new(jobs.user_status.users.clone())),
                FACTION_CHAIN_JOB => {
                    Arc::new(FactionChainJob::new(jobs.faction_chain.factions.clone()))
                }
                MARKET_WATCH_JOB => Arc::new(MarketWatchJob::new(
                    jobs.market_watch.watches.clone(),
                    &jobs.market_watch.pool_keys,
                )),
                _ => return None,
            };
            Some((spec, schedule))
        })
        .collect()
}

/// Scheduler driving every enabled job against `ctx`.
pub fn build_scheduler(config: &SyncConfig, ctx: &SyncContext) -> Scheduler {
    let mut scheduler = Scheduler::new(
        Arc::clone(&ctx.gate),
        Arc::clone(&ctx.clock),
        config.sweep_interval(),
    );

    for (spec, schedule) in configured_jobs(config) {
        if !schedule.enabled {
            info!(job = schedule.name, "job disabled in config, not scheduled");
            continue;
        }
        scheduler.register(
            Arc::new(JobRunner::new(spec, ctx.clone())),
            schedule.interval,
        );
    }
    scheduler
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::http_client::ScriptedHttpClient;

    fn in_memory(config: &SyncConfig) -> SyncContext {
        let api = Arc::new(partner_api(config, Arc::new(ScriptedHttpClient::new())));
        build_context(config, Collaborators::in_memory(api, Arc::new(SystemClock)))
            .expect("valid config")
    }

    #[test]
    fn schedules_only_enabled_jobs() {
        let mut config = SyncConfig::default();
        config.jobs.market_watch.enabled = false;

        let scheduler = build_scheduler(&config, &in_memory(&config));

        assert_eq!(scheduler.job_names(), [USER_STATUS_JOB, FACTION_CHAIN_JOB]);
    }

    #[test]
    fn context_uses_configured_limits() {
        let mut config = SyncConfig::default();
        config.limits.capacity_per_window = 100;

        let ctx = in_memory(&config);

        assert_eq!(ctx.executor.limiter().policy().capacity, 100);
    }

    #[test]
    fn invalid_limits_fail_to_build() {
        let mut config = SyncConfig::default();
        config.limits.window_ms = 0;
        let api = Arc::new(partner_api(&config, Arc::new(ScriptedHttpClient::new())));

        let result = build_context(&config, Collaborators::in_memory(api, Arc::new(SystemClock)));
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn every_job_is_configured() {
        let jobs = configured_jobs(&SyncConfig::default());

        let names: Vec<&str> = jobs.iter().map(|(spec, _)| spec.name()).collect();
        assert_eq!(names, [USER_STATUS_JOB, FACTION_CHAIN_JOB, MARKET_WATCH_JOB]);
        assert!(jobs.iter().all(|(_, schedule)| schedule.enabled));
    }
}
