//! Process configuration.
//!
//! [`SyncConfig`] is read from a JSON file where every section is optional,
//! then overridden by `FERROWATCH_*` environment variables:
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `FERROWATCH_API_BASE_URL` | `api.base_url` |
//! | `FERROWATCH_WEBHOOK_URL` | `notify.webhook_url` |
//! | `FERROWATCH_WAREHOUSE_PATH` | `warehouse.path` |

use std::collections::BTreeMap;
use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ferrowatch_warehouse::WarehouseConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::FieldKind;
use crate::gate::{AlertClass, AlertClassPolicy, NotificationGate};
use crate::jobs::{
    FactionWatch, PriceWatch, UserWatch, FACTION_CHAIN_JOB, MARKET_WATCH_JOB, USER_STATUS_JOB,
};
use crate::retry::RetryConfig;
use crate::staleness::FieldPolicies;
use crate::throttling::RateLimitPolicy;

pub const ENV_API_BASE_URL: &str = "FERROWATCH_API_BASE_URL";
pub const ENV_WEBHOOK_URL: &str = "FERROWATCH_WEBHOOK_URL";
pub const ENV_WAREHOUSE_PATH: &str = "FERROWATCH_WAREHOUSE_PATH";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config value for '{key}': {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api: ApiSettings,
    pub limits: LimitSettings,
    pub retry: RetrySettings,
    /// Per-field `max_age_ms` overrides; unlisted fields keep their defaults.
    pub fields: BTreeMap<FieldKind, FieldSettings>,
    /// Per-class overrides; unlisted classes keep their defaults.
    pub alerts: BTreeMap<AlertClass, AlertSettings>,
    pub notify: NotifySettings,
    pub warehouse: WarehouseSettings,
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub call_timeout_ms: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: String::from("https://api.torn.com"),
            call_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub capacity_per_window: u32,
    pub window_ms: u64,
    pub min_spacing_ms: u64,
    /// Callers allowed to wait for a slot; unbounded when absent.
    pub max_queue: Option<usize>,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            capacity_per_window: 60,
            window_ms: 60_000,
            min_spacing_ms: 1_000,
            max_queue: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            jitter: false,
        }
    }
}

/// Only valid for the age-bounded policies; daily fields roll over at UTC
/// midnight instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldSettings {
    pub max_age_ms: Option<u64>,
}

/// Absent values keep the class default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub cooldown_ms: Option<u64>,
    pub horizon_ms: Option<u64>,
    pub change_overrides_cooldown: Option<bool>,
}

impl AlertSettings {
    fn apply_to(self, defaults: AlertClassPolicy) -> AlertClassPolicy {
        AlertClassPolicy {
            cooldown: self
                .cooldown_ms
                .map_or(defaults.cooldown, Duration::from_millis),
            horizon: self.horizon_ms.map_or(defaults.horizon, Duration::from_millis),
            change_overrides_cooldown: self
                .change_overrides_cooldown
                .unwrap_or(defaults.change_overrides_cooldown),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifySettings {
    pub webhook_url: Option<String>,
    /// Delivery target to webhook URL.
    pub routes: BTreeMap<String, String>,
    pub per_minute: u32,
    pub timeout_ms: u64,
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            webhook_url: None,
            routes: BTreeMap::new(),
            per_minute: 30,
            timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseSettings {
    /// Database file; `$FERROWATCH_HOME/warehouse.duckdb` when absent.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub user_status: UserStatusConfig,
    pub faction_chain: FactionChainConfig,
    pub market_watch: MarketWatchConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserStatusConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub users: Vec<UserWatch>,
}

impl Default for UserStatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 60_000,
            users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactionChainConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    pub factions: Vec<FactionWatch>,
}

impl Default for FactionChainConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 10_000,
            factions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketWatchConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Keys shared by every market lookup.
    pub pool_keys: Vec<String>,
    pub watches: Vec<PriceWatch>,
}

impl Default for MarketWatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            pool_keys: Vec::new(),
            watches: Vec::new(),
        }
    }
}

/// Name, enabled flag and interval of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobSchedule {
    pub name: &'static str,
    pub enabled: bool,
    pub interval: Duration,
}

impl SyncConfig {
    /// Load from `path` (defaults when `None`) and apply environment overrides.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, or when the
    /// result does not validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a config file without overrides or validation.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `FERROWATCH_*` overrides looked up through `lookup`. Empty values
    /// are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(base_url) = lookup(ENV_API_BASE_URL) {
            self.api.base_url = base_url;
        }
        if let Some(webhook_url) = lookup(ENV_WEBHOOK_URL) {
            self.notify.webhook_url = Some(webhook_url);
        }
        if let Some(path) = lookup(ENV_WAREHOUSE_PATH) {
            self.warehouse.path = Some(PathBuf::from(path));
        }
    }

    /// # Errors
    /// Returns the first invalid setting found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::invalid("api.base_url", "must not be empty"));
        }
        if self.api.call_timeout_ms == 0 {
            return Err(ConfigError::invalid(
                "api.call_timeout_ms",
                "must be greater than zero",
            ));
        }

        self.rate_limit_policy()?;

        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::invalid(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        let defaults = FieldPolicies::default();
        for (kind, settings) in &self.fields {
            let Some(max_age_ms) = settings.max_age_ms else {
                continue;
            };
            let policy = defaults.policy_for(*kind);
            if policy.max_age().is_none() {
                return Err(ConfigError::invalid(
                    format!("fields.{kind}.max_age_ms"),
                    format!("not supported by the {} policy", policy.kind().as_str()),
                ));
            }
            if max_age_ms == 0 {
                return Err(ConfigError::invalid(
                    format!("fields.{kind}.max_age_ms"),
                    "must be greater than zero",
                ));
            }
        }
        if self.notify.per_minute == 0 {
            return Err(ConfigError::invalid(
                "notify.per_minute",
                "must be greater than zero",
            ));
        }

        for schedule in self.schedules() {
            if schedule.interval.is_zero() {
                return Err(ConfigError::invalid(
                    format!("jobs.{}.interval_ms", schedule.name),
                    "must be greater than zero",
                ));
            }
        }
        for user in &self.jobs.user_status.users {
            if user.api_key.trim().is_empty() {
                return Err(ConfigError::invalid(
                    format!("jobs.user_status.users[{}].api_key", user.user_id),
                    "must not be empty",
                ));
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error for a zero capacity or window.
    pub fn rate_limit_policy(&self) -> Result<RateLimitPolicy, ConfigError> {
        let limits = &self.limits;
        let policy = RateLimitPolicy::new(
            limits.capacity_per_window,
            Duration::from_millis(limits.window_ms),
            Duration::from_millis(limits.min_spacing_ms),
        )
        .map_err(|error| ConfigError::invalid("limits", error.to_string()))?;

        Ok(match limits.max_queue {
            Some(max_queue) => policy.with_max_queue(max_queue),
            None => policy,
        })
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::exponential(
            self.retry.max_retries,
            Duration::from_millis(self.retry.base_delay_ms),
            Duration::from_millis(self.retry.max_delay_ms),
        )
        .with_jitter(self.retry.jitter)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.api.call_timeout_ms)
    }

    pub fn field_policies(&self) -> FieldPolicies {
        self.fields
            .iter()
            .filter_map(|(kind, settings)| Some((*kind, settings.max_age_ms?)))
            .fold(FieldPolicies::default(), |policies, (kind, max_age_ms)| {
                policies.with_max_age(kind, Duration::from_millis(max_age_ms))
            })
    }

    pub fn notification_gate(&self) -> NotificationGate {
        self.alerts
            .iter()
            .fold(NotificationGate::new(), |gate, (class, settings)| {
                gate.with_policy(
                    *class,
                    settings.apply_to(AlertClassPolicy::default_for(*class)),
                )
            })
    }

    /// Shortest alert horizon, used as the gate sweep period.
    pub fn sweep_interval(&self) -> Duration {
        let gate = self.notification_gate();
        AlertClass::ALL
            .into_iter()
            .map(|class| gate.policy(class).horizon)
            .filter(|horizon| !horizon.is_zero())
            .min()
            .unwrap_or(Duration::from_secs(60))
    }

    pub fn webhook_per_minute(&self) -> NonZeroU32 {
        NonZeroU32::new(self.notify.per_minute).unwrap_or(NonZeroU32::MIN)
    }

    pub fn warehouse_config(&self) -> WarehouseConfig {
        match &self.warehouse.path {
            Some(path) => WarehouseConfig::at_path(path),
            None => WarehouseConfig::default(),
        }
    }

    pub fn schedules(&self) -> [JobSchedule; 3] {
        let jobs = &self.jobs;
        [
            JobSchedule {
                name: USER_STATUS_JOB,
                enabled: jobs.user_status.enabled,
                interval: Duration::from_millis(jobs.user_status.interval_ms),
            },
            JobSchedule {
                name: FACTION_CHAIN_JOB,
                enabled: jobs.faction_chain.enabled,
                interval: Duration::from_millis(jobs.faction_chain.interval_ms),
            },
            JobSchedule {
                name: MARKET_WATCH_JOB,
                enabled: jobs.market_watch.enabled,
                interval: Duration::from_millis(jobs.market_watch.interval_ms),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::staleness::StalenessPolicy;

    #[test]
    fn empty_file_yields_defaults() {
        let config: SyncConfig = serde_json::from_str("{}").expect("parses");

        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.limits.capacity_per_window, 60);
        assert_eq!(config.jobs.faction_chain.interval_ms, 10_000);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn partial_sections_keep_remaining_defaults() {
        let config: SyncConfig = serde_json::from_str(
            r#"{
                "limits": { "capacity_per_window": 100 },
                "fields": { "profile": { "max_age_ms": 300000 } },
                "alerts": { "chain_timeout": { "cooldown_ms": 30000, "horizon_ms": 600000, "change_overrides_cooldown": true } },
                "jobs": { "market_watch": { "pool_keys": ["a", "b"], "watches": [{ "item_id": 206, "below": 800000, "deliver_to": "traders" }] } }
            }"#,
        )
        .expect("parses");

        assert_eq!(config.limits.capacity_per_window, 100);
        assert_eq!(config.limits.window_ms, 60_000);
        assert_eq!(
            config.field_policies().policy_for(FieldKind::Profile),
            StalenessPolicy::simple_ttl(Duration::from_secs(300))
        );
        let chain = config.notification_gate().policy(AlertClass::ChainTimeout);
        assert_eq!(chain.cooldown, Duration::from_secs(30));
        assert!(chain.change_overrides_cooldown);
        assert_eq!(config.jobs.market_watch.interval_ms, 30_000);
        assert_eq!(config.jobs.market_watch.watches[0].item_id, 206);
    }

    #[test]
    fn alert_override_with_only_a_cooldown_keeps_class_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{ "alerts": { "chain_timeout": { "cooldown_ms": 30000 } } }"#)
                .expect("parses");
        config.validate().expect("validates");

        let chain = config.notification_gate().policy(AlertClass::ChainTimeout);
        let defaults = AlertClassPolicy::default_for(AlertClass::ChainTimeout);
        assert_eq!(chain.cooldown, Duration::from_secs(30));
        assert_eq!(chain.horizon, defaults.horizon);
        assert_eq!(
            chain.change_overrides_cooldown,
            defaults.change_overrides_cooldown
        );
    }

    #[test]
    fn max_age_is_refused_for_daily_fields() {
        for raw in [
            r#"{ "fields": { "daily_tasks": { "max_age_ms": 60000 } } }"#,
            r#"{ "fields": { "refills": { "max_age_ms": 60000 } } }"#,
        ] {
            let config: SyncConfig = serde_json::from_str(raw).expect("parses");
            assert!(matches!(
                config.validate(),
                Err(ConfigError::Invalid { key, .. }) if key.ends_with(".max_age_ms")
            ));
        }

        let empty: SyncConfig =
            serde_json::from_str(r#"{ "fields": { "refills": {} } }"#).expect("parses");
        empty.validate().expect("no override is fine");
        assert_eq!(
            empty.field_policies().policy_for(FieldKind::Refills),
            StalenessPolicy::DailySubItem
        );
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut config = SyncConfig::default();
        config.apply_env(|key| match key {
            ENV_API_BASE_URL => Some(String::from("http://localhost:8080")),
            ENV_WEBHOOK_URL => Some(String::from("  ")),
            ENV_WAREHOUSE_PATH => Some(String::from("/tmp/fw.duckdb")),
            _ => None,
        });

        assert_eq!(config.api.base_url, "http://localhost:8080");
        assert_eq!(config.notify.webhook_url, None);
        assert_eq!(
            config.warehouse_config().db_path,
            PathBuf::from("/tmp/fw.duckdb")
        );
    }

    #[test]
    fn rejects_invalid_values() {
        let mut zero_capacity = SyncConfig::default();
        zero_capacity.limits.capacity_per_window = 0;
        assert!(matches!(
            zero_capacity.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "limits"
        ));

        let mut zero_interval = SyncConfig::default();
        zero_interval.jobs.faction_chain.interval_ms = 0;
        assert!(matches!(
            zero_interval.validate(),
            Err(ConfigError::Invalid { key, .. }) if key == "jobs.faction_chain.interval_ms"
        ));

        let mut inverted_backoff = SyncConfig::default();
        inverted_backoff.retry.base_delay_ms = 120_000;
        assert!(inverted_backoff.validate().is_err());
    }

    #[test]
    fn load_reports_parse_errors_with_path() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"{ not json").expect("write");

        let error = SyncConfig::from_file(file.path()).expect_err("must fail");
        assert!(matches!(error, ConfigError::Parse { .. }));
        assert!(error.to_string().contains("cannot parse config file"));
    }

    #[test]
    fn max_queue_becomes_limiter_back_pressure() {
        let mut config = SyncConfig::default();
        config.limits.max_queue = Some(5);

        let policy = config.rate_limit_policy().expect("valid");
        assert_eq!(policy.max_queue, Some(5));
        assert_eq!(config.sweep_interval(), Duration::from_secs(5 * 60));
    }
}
