//! Staleness policies.
//!
//! Every cached field is governed by exactly one [`StalenessPolicy`]. The
//! policy is a pure function of the field's [`FieldMetadata`] and the current
//! wall-clock time; the cache dispatches on it and never inspects payloads.
//!
//! | Kind | Fresh iff |
//! |------|-----------|
//! | `expiry_gated` | active, `now < expires_at`, and younger than `max_age` |
//! | `simple_ttl` | younger than `max_age` |
//! | `daily_completion` | completed and fetched on the current UTC day |
//! | `daily_sub_item` | non-empty and every sub-item completed on the current UTC day |

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{FieldKind, UtcDateTime};
use crate::ValidationError;

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    ExpiryGated,
    SimpleTtl,
    DailyCompletion,
    DailySubItem,
}

impl PolicyKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ExpiryGated => "expiry_gated",
            Self::SimpleTtl => "simple_ttl",
            Self::DailyCompletion => "daily_completion",
            Self::DailySubItem => "daily_sub_item",
        }
    }
}

impl Display for PolicyKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "expiry_gated" => Ok(Self::ExpiryGated),
            "simple_ttl" => Ok(Self::SimpleTtl),
            "daily_completion" => Ok(Self::DailyCompletion),
            "daily_sub_item" => Ok(Self::DailySubItem),
            other => Err(ValidationError::InvalidPolicyKind {
                value: other.to_owned(),
            }),
        }
    }
}

/// One named once-per-day item of a daily-sub-item field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubItemState {
    pub completed: bool,
    pub last_fetched: UtcDateTime,
}

impl SubItemState {
    fn is_fresh(self, now: UtcDateTime) -> bool {
        self.completed && self.last_fetched.same_utc_day(now)
    }
}

/// Metadata the staleness policies look at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMetadata {
    /// Whether the underlying condition held when fetched.
    pub active: bool,
    /// When the active condition ends. Only meaningful while `active`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<UtcDateTime>,
    pub last_fetched: UtcDateTime,
    /// Daily target reached.
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_items: BTreeMap<String, SubItemState>,
}

impl FieldMetadata {
    /// Metadata for an inactive, incomplete field fetched at `last_fetched`.
    pub fn fetched_at(last_fetched: UtcDateTime) -> Self {
        Self {
            active: false,
            expires_at: None,
            last_fetched,
            completed: false,
            sub_items: BTreeMap::new(),
        }
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        if !active {
            self.expires_at = None;
        }
        self
    }

    /// Mark active until `expires_at`.
    pub fn active_until(mut self, expires_at: UtcDateTime) -> Self {
        self.active = true;
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_completed(mut self, completed: bool) -> Self {
        self.completed = completed;
        self
    }

    pub fn with_sub_item(mut self, name: impl Into<String>, completed: bool) -> Self {
        self.sub_items.insert(
            name.into(),
            SubItemState {
                completed,
                last_fetched: self.last_fetched,
            },
        );
        self
    }
}

/// Closed set of decay rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalenessPolicy {
    ExpiryGated { max_age: Duration },
    SimpleTtl { max_age: Duration },
    DailyCompletion,
    DailySubItem,
}

impl StalenessPolicy {
    pub const fn expiry_gated() -> Self {
        Self::ExpiryGated {
            max_age: DEFAULT_MAX_AGE,
        }
    }

    pub const fn simple_ttl(max_age: Duration) -> Self {
        Self::SimpleTtl { max_age }
    }

    pub const fn kind(self) -> PolicyKind {
        match self {
            Self::ExpiryGated { .. } => PolicyKind::ExpiryGated,
            Self::SimpleTtl { .. } => PolicyKind::SimpleTtl,
            Self::DailyCompletion => PolicyKind::DailyCompletion,
            Self::DailySubItem => PolicyKind::DailySubItem,
        }
    }

    pub fn is_fresh(self, metadata: &FieldMetadata, now: UtcDateTime) -> bool {
        match self {
            // Inactive is always stale: the condition may have just started.
            Self::ExpiryGated { max_age } => {
                metadata.active
                    && metadata.expires_at.is_some_and(|expires_at| now < expires_at)
                    && now.duration_since(metadata.last_fetched) < max_age
            }
            Self::SimpleTtl { max_age } => now.duration_since(metadata.last_fetched) < max_age,
            Self::DailyCompletion => {
                metadata.completed && metadata.last_fetched.same_utc_day(now)
            }
            Self::DailySubItem => {
                !metadata.sub_items.is_empty()
                    && metadata.sub_items.values().all(|item| item.is_fresh(now))
            }
        }
    }

    /// `None` for the day-based variants.
    pub const fn max_age(self) -> Option<Duration> {
        match self {
            Self::ExpiryGated { max_age } | Self::SimpleTtl { max_age } => Some(max_age),
            Self::DailyCompletion | Self::DailySubItem => None,
        }
    }

    /// Same variant with a different `max_age`; day-based variants are returned
    /// unchanged.
    pub const fn with_max_age(self, max_age: Duration) -> Self {
        match self {
            Self::ExpiryGated { .. } => Self::ExpiryGated { max_age },
            Self::SimpleTtl { .. } => Self::SimpleTtl { max_age },
            other => other,
        }
    }
}

/// Field kind to policy mapping, fixed at configuration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPolicies {
    policies: BTreeMap<FieldKind, StalenessPolicy>,
}

impl Default for FieldPolicies {
    fn default() -> Self {
        let policies = FieldKind::ALL
            .into_iter()
            .map(|kind| (kind, default_policy(kind)))
            .collect();
        Self { policies }
    }
}

impl FieldPolicies {
    pub fn policy_for(&self, kind: FieldKind) -> StalenessPolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_policy(kind))
    }

    pub fn set(&mut self, kind: FieldKind, policy: StalenessPolicy) {
        self.policies.insert(kind, policy);
    }

    pub fn with_max_age(mut self, kind: FieldKind, max_age: Duration) -> Self {
        let policy = self.policy_for(kind).with_max_age(max_age);
        self.set(kind, policy);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldKind, StalenessPolicy)> + '_ {
        self.policies.iter().map(|(kind, policy)| (*kind, *policy))
    }
}

fn default_policy(kind: FieldKind) -> StalenessPolicy {
    match kind {
        FieldKind::Education | FieldKind::Investment => StalenessPolicy::expiry_gated(),
        FieldKind::Profile => StalenessPolicy::simple_ttl(DEFAULT_MAX_AGE),
        FieldKind::DailyTasks => StalenessPolicy::DailyCompletion,
        FieldKind::Refills => StalenessPolicy::DailySubItem,
        FieldKind::Chain => StalenessPolicy::simple_ttl(Duration::from_secs(5)),
        FieldKind::MarketPrice => StalenessPolicy::simple_ttl(Duration::from_secs(30)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(input: &str) -> UtcDateTime {
        UtcDateTime::parse(input).expect("timestamp should parse")
    }

    fn plus(base: UtcDateTime, seconds: u64) -> UtcDateTime {
        base.checked_add(Duration::from_secs(seconds))
            .expect("in range")
    }

    #[test]
    fn expiry_gated_inactive_is_always_stale() {
        let now = at("2024-01-01T12:00:00Z");
        let metadata = FieldMetadata::fetched_at(now);

        assert!(!StalenessPolicy::expiry_gated().is_fresh(&metadata, now));
    }

    #[test]
    fn expiry_gated_fresh_until_expiry() {
        let now = at("2024-01-01T12:00:00Z");
        let metadata = FieldMetadata::fetched_at(now).active_until(plus(now, 10));
        let policy = StalenessPolicy::expiry_gated();

        assert!(policy.is_fresh(&metadata, now));
        assert!(policy.is_fresh(&metadata, plus(now, 9)));
        assert!(!policy.is_fresh(&metadata, plus(now, 10)));
    }

    #[test]
    fn expiry_gated_goes_stale_with_age_before_expiry() {
        let now = at("2024-01-01T00:00:00Z");
        let metadata = FieldMetadata::fetched_at(now).active_until(plus(now, 86_400));
        let policy = StalenessPolicy::expiry_gated();

        assert!(policy.is_fresh(&metadata, plus(now, 3_599)));
        assert!(!policy.is_fresh(&metadata, plus(now, 3_600)));
    }

    #[test]
    fn expiry_gated_active_without_expiry_is_stale() {
        let now = at("2024-01-01T00:00:00Z");
        let metadata = FieldMetadata::fetched_at(now).with_active(true);

        assert!(!StalenessPolicy::expiry_gated().is_fresh(&metadata, now));
    }

    #[test]
    fn simple_ttl_ignores_active_flag() {
        let now = at("2024-01-01T00:00:00Z");
        let policy = StalenessPolicy::simple_ttl(Duration::from_secs(60));

        for active in [true, false] {
            let metadata = FieldMetadata::fetched_at(now).with_active(active);
            assert!(policy.is_fresh(&metadata, plus(now, 59)));
            assert!(!policy.is_fresh(&metadata, plus(now, 60)));
        }
    }

    #[test]
    fn daily_completion_rolls_over_at_utc_midnight() {
        let fetched = at("2024-01-01T23:59:00Z");
        let metadata = FieldMetadata::fetched_at(fetched).with_completed(true);
        let policy = StalenessPolicy::DailyCompletion;

        assert!(policy.is_fresh(&metadata, at("2024-01-01T23:59:59Z")));
        assert!(!policy.is_fresh(&metadata, at("2024-01-02T00:01:00Z")));
    }

    #[test]
    fn daily_completion_incomplete_is_stale() {
        let now = at("2024-01-01T10:00:00Z");
        let metadata = FieldMetadata::fetched_at(now);

        assert!(!StalenessPolicy::DailyCompletion.is_fresh(&metadata, now));
    }

    #[test]
    fn daily_sub_item_requires_every_item_fresh() {
        let now = at("2024-01-01T10:00:00Z");
        let policy = StalenessPolicy::DailySubItem;

        let all_done = FieldMetadata::fetched_at(now)
            .with_sub_item("energy", true)
            .with_sub_item("nerve", true);
        assert!(policy.is_fresh(&all_done, now));
        assert!(!policy.is_fresh(&all_done, at("2024-01-02T00:00:00Z")));

        let partial = all_done.clone().with_sub_item("token", false);
        assert!(!policy.is_fresh(&partial, now));

        let empty = FieldMetadata::fetched_at(now);
        assert!(!policy.is_fresh(&empty, now));
    }

    #[test]
    fn default_mapping_and_overrides() {
        let policies = FieldPolicies::default()
            .with_max_age(FieldKind::Education, Duration::from_secs(120))
            .with_max_age(FieldKind::DailyTasks, Duration::from_secs(120));

        assert_eq!(
            policies.policy_for(FieldKind::Education),
            StalenessPolicy::ExpiryGated {
                max_age: Duration::from_secs(120)
            }
        );
        assert_eq!(
            policies.policy_for(FieldKind::DailyTasks),
            StalenessPolicy::DailyCompletion
        );
        assert_eq!(
            policies.policy_for(FieldKind::Refills).kind(),
            PolicyKind::DailySubItem
        );
    }
}
