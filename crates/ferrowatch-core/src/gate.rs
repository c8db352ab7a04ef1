//! Notification dedup and cooldown gate.
//!
//! Keyed by (subject, alert class). An alert is suppressed when the last
//! emitted value for the key is identical, or when the class cooldown has not
//! elapsed and the class does not let a changed value override it. Callers
//! record an emission only after the alert was delivered, so a failed delivery
//! is retried on the next cycle.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::domain::{SubjectKey, UtcDateTime};
use crate::ValidationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertClass {
    /// Watched item listed at or below the target price.
    PriceAlert,
    /// Faction chain about to time out.
    ChainTimeout,
}

impl AlertClass {
    pub const ALL: [Self; 2] = [Self::PriceAlert, Self::ChainTimeout];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PriceAlert => "price_alert",
            Self::ChainTimeout => "chain_timeout",
        }
    }
}

impl Display for AlertClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertClass {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "price_alert" => Ok(Self::PriceAlert),
            "chain_timeout" => Ok(Self::ChainTimeout),
            other => Err(ValidationError::InvalidAlertClass {
                value: other.to_owned(),
            }),
        }
    }
}

/// Per-class suppression rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlertClassPolicy {
    pub cooldown: Duration,
    /// Records idle this long are dropped by [`NotificationGate::sweep`].
    pub horizon: Duration,
    /// A changed value is emitted even inside the cooldown.
    pub change_overrides_cooldown: bool,
}

impl AlertClassPolicy {
    pub const fn default_for(class: AlertClass) -> Self {
        match class {
            AlertClass::PriceAlert => Self {
                cooldown: Duration::ZERO,
                horizon: Duration::from_secs(60 * 60),
                change_overrides_cooldown: true,
            },
            AlertClass::ChainTimeout => Self {
                cooldown: Duration::from_secs(60),
                horizon: Duration::from_secs(5 * 60),
                change_overrides_cooldown: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Allow,
    /// Same value as the last emission.
    Duplicate,
    Cooldown { remaining: Duration },
}

impl GateDecision {
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationRecord {
    pub last_emitted_value: Value,
    pub last_emitted_at: UtcDateTime,
}

#[derive(Debug)]
pub struct NotificationGate {
    policies: BTreeMap<AlertClass, AlertClassPolicy>,
    records: Mutex<HashMap<(SubjectKey, AlertClass), NotificationRecord>>,
}

impl Default for NotificationGate {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationGate {
    pub fn new() -> Self {
        Self {
            policies: AlertClass::ALL
                .into_iter()
                .map(|class| (class, AlertClassPolicy::default_for(class)))
                .collect(),
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_policy(mut self, class: AlertClass, policy: AlertClassPolicy) -> Self {
        self.policies.insert(class, policy);
        self
    }

    pub fn policy(&self, class: AlertClass) -> AlertClassPolicy {
        self.policies
            .get(&class)
            .copied()
            .unwrap_or_else(|| AlertClassPolicy::default_for(class))
    }

    pub fn evaluate(
        &self,
        subject: SubjectKey,
        class: AlertClass,
        candidate: &Value,
        now: UtcDateTime,
    ) -> GateDecision {
        let policy = self.policy(class);
        let records = self.records.lock().expect("gate records lock is not poisoned");

        let Some(record) = records.get(&(subject, class)) else {
            return GateDecision::Allow;
        };

        if record.last_emitted_value == *candidate {
            return GateDecision::Duplicate;
        }

        let elapsed = now.duration_since(record.last_emitted_at);
        if elapsed < policy.cooldown && !policy.change_overrides_cooldown {
            return GateDecision::Cooldown {
                remaining: policy.cooldown - elapsed,
            };
        }

        GateDecision::Allow
    }

    pub fn should_emit(
        &self,
        subject: SubjectKey,
        class: AlertClass,
        candidate: &Value,
        now: UtcDateTime,
    ) -> bool {
        self.evaluate(subject, class, candidate, now).is_allowed()
    }

    /// Call only after the alert was delivered.
    pub fn record_emission(
        &self,
        subject: SubjectKey,
        class: AlertClass,
        value: Value,
        now: UtcDateTime,
    ) {
        self.records
            .lock()
            .expect("gate records lock is not poisoned")
            .insert(
                (subject, class),
                NotificationRecord {
                    last_emitted_value: value,
                    last_emitted_at: now,
                },
            );
    }

    pub fn record(&self, subject: SubjectKey, class: AlertClass) -> Option<NotificationRecord> {
        self.records
            .lock()
            .expect("gate records lock is not poisoned")
            .get(&(subject, class))
            .cloned()
    }

    /// Drop records idle past their class horizon. Returns how many were removed.
    pub fn sweep(&self, now: UtcDateTime) -> usize {
        let mut records = self.records.lock().expect("gate records lock is not poisoned");
        let before = records.len();
        records.retain(|(_, class), record| {
            now.duration_since(record.last_emitted_at) < self.policy(*class).horizon
        });

        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, remaining = records.len(), "swept notification records");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .expect("gate records lock is not poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
