use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{expires_in, integer, object};
use crate::cache::CachedField;
use crate::domain::{FieldKind, SubjectKey, UtcDateTime};
use crate::gate::AlertClass;
use crate::notify::DeliveryTarget;
use crate::partner_api::{ApiRequest, ApiSection, RawResponse};
use crate::polling::{AlertCandidate, FieldSnapshot, JobSpec, PollTarget};
use crate::rotation::{Credential, CredentialRotator};
use crate::staleness::FieldMetadata;
use crate::SyncError;

pub const FACTION_CHAIN_JOB: &str = "faction_chain";

const fn default_warn_below_secs() -> u64 {
    90
}

const fn default_min_chain() -> u64 {
    10
}

/// A faction whose chain timer is watched with keys lent by its members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactionWatch {
    pub faction_id: u64,
    /// Member keys, rotated so no member carries the whole load.
    pub member_keys: Vec<String>,
    pub deliver_to: Option<DeliveryTarget>,
    #[serde(default = "default_warn_below_secs")]
    pub warn_below_secs: u64,
    /// Chains shorter than this are not worth saving.
    #[serde(default = "default_min_chain")]
    pub min_chain: u64,
}

struct Watched {
    watch: FactionWatch,
    credentials: Vec<Credential>,
}

/// Polls faction chains and warns before a running chain times out.
///
/// Not reentrant: a slow cycle must not be overtaken by the next one, or the
/// same member key would be spent twice for one timer reading.
pub struct FactionChainJob {
    factions: Vec<Watched>,
}

impl FactionChainJob {
    pub fn new(factions: Vec<FactionWatch>) -> Self {
        let factions = factions
            .into_iter()
            .map(|watch| {
                let credentials = watch
                    .member_keys
                    .iter()
                    .enumerate()
                    .map(|(index, key)| {
                        Credential::new(format!("faction:{}#{index}", watch.faction_id), key)
                    })
                    .collect();
                Watched { watch, credentials }
            })
            .collect();
        Self { factions }
    }

    fn watch_for(&self, subject: SubjectKey) -> Option<&FactionWatch> {
        self.factions
            .iter()
            .map(|watched| &watched.watch)
            .find(|watch| SubjectKey::faction(watch.faction_id) == subject)
    }
}

impl JobSpec for FactionChainJob {
    fn name(&self) -> &str {
        FACTION_CHAIN_JOB
    }

    fn reentrant(&self) -> bool {
        false
    }

    fn targets(&self, rotator: &CredentialRotator) -> Vec<PollTarget> {
        self.factions
            .iter()
            .filter_map(|watched| {
                let subject = SubjectKey::faction(watched.watch.faction_id);
                let credential = rotator.next(&subject.to_string(), &watched.credentials)?;
                Some(PollTarget {
                    subject,
                    credential: credential.clone(),
                    deliver_to: watched.watch.deliver_to.clone(),
                })
            })
            .collect()
    }

    fn fields(&self, _subject: SubjectKey) -> Vec<FieldKind> {
        vec![FieldKind::Chain]
    }

    fn request(&self, subject: SubjectKey, kind: FieldKind) -> Result<ApiRequest, SyncError> {
        if kind != FieldKind::Chain {
            return Err(SyncError::Transform(format!("{kind} is not a chain field")));
        }
        Ok(ApiRequest::new(ApiSection::Faction, Some(subject.id()), ["chain"])?)
    }

    fn transform(
        &self,
        _subject: SubjectKey,
        _kind: FieldKind,
        raw: &RawResponse,
        now: UtcDateTime,
    ) -> Result<FieldSnapshot, SyncError> {
        let chain = object(raw, "chain")?;
        let current = integer(chain, "current")?;
        let timeout = integer(chain, "timeout")?;
        let max = chain.get("max").and_then(Value::as_i64).unwrap_or(0);

        let metadata = match expires_in(now, timeout) {
            Some(times_out_at) if current > 0 => {
                FieldMetadata::fetched_at(now).active_until(times_out_at)
            }
            _ => FieldMetadata::fetched_at(now),
        };
        Ok(FieldSnapshot {
            value: json!({ "current": current, "max": max, "timeout": timeout }),
            metadata,
        })
    }

    fn alerts(
        &self,
        subject: SubjectKey,
        fields: &BTreeMap<FieldKind, CachedField>,
        now: UtcDateTime,
    ) -> Vec<AlertCandidate> {
        let (Some(watch), Some(chain)) = (self.watch_for(subject), fields.get(&FieldKind::Chain))
        else {
            return Vec::new();
        };
        if !chain.metadata.active {
            return Vec::new();
        }

        let current = chain.value.get("current").and_then(Value::as_u64).unwrap_or(0);
        let Some(times_out_at) = chain.metadata.expires_at else {
            return Vec::new();
        };
        let remaining = times_out_at.duration_since(now).as_secs();

        if current < watch.min_chain || remaining > watch.warn_below_secs {
            return Vec::new();
        }

        vec![AlertCandidate {
            class: AlertClass::ChainTimeout,
            title: format!("Chain {current} about to drop"),
            body: format!(
                "Faction {} chain times out in {remaining}s. Hit someone!",
                watch.faction_id
            ),
            value: json!({ "chain": current }),
        }]
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::jobs::raw;
    use crate::staleness::PolicyKind;

    fn now() -> UtcDateTime {
        UtcDateTime::parse("2024-01-01T12:00:00Z").expect("must parse")
    }

    fn job(member_keys: &[&str]) -> FactionChainJob {
        FactionChainJob::new(vec![FactionWatch {
            faction_id: 9,
            member_keys: member_keys.iter().map(|key| (*key).to_owned()).collect(),
            deliver_to: Some(DeliveryTarget::new("faction-9-chat")),
            warn_below_secs: 90,
            min_chain: 10,
        }])
    }

    fn chain_field(job: &FactionChainJob, current: i64, timeout: i64) -> BTreeMap<FieldKind, CachedField> {
        let snapshot = job
            .transform(
                SubjectKey::faction(9),
                FieldKind::Chain,
                &raw(json!({ "chain": { "current": current, "max": 100, "timeout": timeout } })),
                now(),
            )
            .expect("transform");
        BTreeMap::from([(
            FieldKind::Chain,
            CachedField {
                value: snapshot.value,
                policy: PolicyKind::SimpleTtl,
                metadata: snapshot.metadata,
            },
        )])
    }

    #[test]
    fn rotates_member_keys_between_cycles() {
        let job = job(&["a", "b"]);
        let rotator = CredentialRotator::new();

        let owners: Vec<String> = (0..3)
            .map(|_| job.targets(&rotator)[0].credential.owner().to_owned())
            .collect();

        assert_eq!(owners, ["faction:9#0", "faction:9#1", "faction:9#0"]);
    }

    #[test]
    fn faction_without_keys_is_skipped() {
        let job = job(&[]);
        assert!(job.targets(&CredentialRotator::new()).is_empty());
        assert!(!job.reentrant());
    }

    #[test]
    fn warns_when_running_chain_is_close_to_timing_out() {
        let job = job(&["a"]);
        let alerts = job.alerts(SubjectKey::faction(9), &chain_field(&job, 45, 80), now());

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].class, AlertClass::ChainTimeout);
        assert_eq!(alerts[0].value, json!({ "chain": 45 }));
    }

    #[test]
    fn quiet_for_short_safe_or_idle_chains() {
        let job = job(&["a"]);
        let subject = SubjectKey::faction(9);

        assert!(job.alerts(subject, &chain_field(&job, 5, 30), now()).is_empty());
        assert!(job.alerts(subject, &chain_field(&job, 45, 200), now()).is_empty());
        assert!(job.alerts(subject, &chain_field(&job, 0, 0), now()).is_empty());
    }

    #[test]
    fn missing_chain_object_is_a_transform_error() {
        let error = job(&["a"])
            .transform(
                SubjectKey::faction(9),
                FieldKind::Chain,
                &raw(json!({ "error": "nope" })),
                now(),
            )
            .expect_err("must fail");
        assert!(matches!(error, SyncError::Transform(_)));
    }
}
