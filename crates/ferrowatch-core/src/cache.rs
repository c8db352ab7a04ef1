//! Per-field adaptive staleness cache.
//!
//! Wraps a [`FieldStore`] and applies the configured [`StalenessPolicy`] of
//! each field on read. Writes go to the store first; memory is only updated
//! once the store accepted the value, so the two never diverge.
//!
//! Every subject owns a slot with an async mutex. Callers that read, fetch and
//! write the same subject hold [`AdaptiveCache::lock_subject`] for the whole
//! sequence; different subjects never contend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::domain::{FieldKind, SubjectKey};
use crate::staleness::{FieldMetadata, FieldPolicies, PolicyKind, StalenessPolicy};
use crate::store::FieldStore;
use crate::SyncError;

/// One tracked attribute of one subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedField {
    /// Opaque payload.
    pub value: Value,
    pub policy: PolicyKind,
    pub metadata: FieldMetadata,
}

/// Outcome of [`AdaptiveCache::read`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheRead {
    Fresh(CachedField),
    /// Must be refetched. `previous` is the last known value, if any, and can
    /// still be served while the refresh is pending or failing.
    Stale { previous: Option<CachedField> },
}

impl CacheRead {
    pub const fn is_fresh(&self) -> bool {
        matches!(self, Self::Fresh(_))
    }

    /// Best value available, fresh or not.
    pub fn into_value(self) -> Option<CachedField> {
        match self {
            Self::Fresh(field) => Some(field),
            Self::Stale { previous } => previous,
        }
    }
}

/// Held while a subject's fields are read, refreshed and written.
pub type SubjectGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
struct SubjectSlot {
    guard: Arc<tokio::sync::Mutex<()>>,
    fields: RwLock<BTreeMap<FieldKind, CachedField>>,
}

pub struct AdaptiveCache {
    store: Arc<dyn FieldStore>,
    policies: FieldPolicies,
    clock: Arc<dyn Clock>,
    subjects: Mutex<HashMap<SubjectKey, Arc<SubjectSlot>>>,
}

impl AdaptiveCache {
    pub fn new(store: Arc<dyn FieldStore>, policies: FieldPolicies, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policies,
            clock,
            subjects: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy_for(&self, kind: FieldKind) -> StalenessPolicy {
        self.policies.policy_for(kind)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Serialize access to one subject until the guard is dropped.
    pub async fn lock_subject(&self, subject: SubjectKey) -> SubjectGuard {
        let slot = self.slot(subject);
        Arc::clone(&slot.guard).lock_owned().await
    }

    /// Apply the field's policy to the cached value. A memory miss falls
    /// through to the store; a store failure reads as stale.
    pub async fn read(&self, subject: SubjectKey, kind: FieldKind) -> CacheRead {
        let slot = self.slot(subject);
        let policy = self.policy_for(kind);

        let cached = slot
            .fields
            .read()
            .expect("cache slot lock is not poisoned")
            .get(&kind)
            .cloned();

        let cached = match cached {
            Some(field) => Some(field),
            None => match self.store.find_latest(subject, kind).await {
                Ok(Some(field)) => {
                    debug!(%subject, field = %kind, "hydrated cache from store");
                    slot.fields
                        .write()
                        .expect("cache slot lock is not poisoned")
                        .insert(kind, field.clone());
                    Some(field)
                }
                Ok(None) => None,
                Err(error) => {
                    warn!(%subject, field = %kind, error = %error, "store lookup failed, treating field as stale");
                    None
                }
            },
        };

        let now = self.clock.now();
        match cached {
            // A value written under a different policy cannot be judged by this one.
            Some(field) if field.policy == policy.kind() && policy.is_fresh(&field.metadata, now) => {
                CacheRead::Fresh(field)
            }
            previous => CacheRead::Stale { previous },
        }
    }

    /// Write through to the store, then replace the in-memory value.
    ///
    /// # Errors
    /// Returns the store's error; the in-memory value is left untouched.
    pub async fn write(
        &self,
        subject: SubjectKey,
        kind: FieldKind,
        field: CachedField,
    ) -> Result<(), SyncError> {
        self.store.upsert(subject, kind, &field).await?;

        let slot = self.slot(subject);
        slot.fields
            .write()
            .expect("cache slot lock is not poisoned")
            .insert(kind, field);
        Ok(())
    }

    /// Every field of `subject` currently held in memory.
    pub fn snapshot(&self, subject: SubjectKey) -> Vec<(FieldKind, CachedField)> {
        let slot = {
            let subjects = self.subjects.lock().expect("cache index lock is not poisoned");
            subjects.get(&subject).cloned()
        };

        slot.map(|slot| {
            slot.fields
                .read()
                .expect("cache slot lock is not poisoned")
                .iter()
                .map(|(kind, field)| (*kind, field.clone()))
                .collect()
        })
        .unwrap_or_default()
    }

    /// Number of fields held in memory across all subjects.
    pub fn len(&self) -> usize {
        let subjects = self.subjects.lock().expect("cache index lock is not poisoned");
        subjects
            .values()
            .map(|slot| slot.fields.read().expect("cache slot lock is not poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, subject: SubjectKey) -> Arc<SubjectSlot> {
        let mut subjects = self.subjects.lock().expect("cache index lock is not poisoned");
        Arc::clone(subjects.entry(subject).or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::UtcDateTime;
    use crate::store::InMemoryFieldStore;

    struct Fixture {
        store: Arc<InMemoryFieldStore>,
        clock: Arc<ManualClock>,
        cache: AdaptiveCache,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryFieldStore::new());
        let clock = Arc::new(ManualClock::new(
            UtcDateTime::parse("2024-01-01T12:00:00Z").expect("must parse"),
        ));
        let cache = AdaptiveCache::new(
            Arc::clone(&store) as Arc<dyn FieldStore>,
            FieldPolicies::default(),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        Fixture {
            store,
            clock,
            cache,
        }
    }

    fn profile(level: u32, fetched: UtcDateTime) -> CachedField {
        CachedField {
            value: json!({ "level": level }),
            policy: PolicyKind::SimpleTtl,
            metadata: FieldMetadata::fetched_at(fetched),
        }
    }

    #[tokio::test]
    async fn miss_is_stale_without_previous() {
        let fx = fixture();
        let read = fx.cache.read(SubjectKey::user(1), FieldKind::Profile).await;
        assert_eq!(read, CacheRead::Stale { previous: None });
    }

    #[tokio::test]
    async fn written_value_is_fresh_until_ttl_expires() {
        let fx = fixture();
        let subject = SubjectKey::user(1);
        let field = profile(10, fx.clock.now());

        fx.cache
            .write(subject, FieldKind::Profile, field.clone())
            .await
            .expect("write");
        assert_eq!(
            fx.cache.read(subject, FieldKind::Profile).await,
            CacheRead::Fresh(field.clone())
        );

        fx.clock.advance(Duration::from_secs(3_600));
        assert_eq!(
            fx.cache.read(subject, FieldKind::Profile).await,
            CacheRead::Stale {
                previous: Some(field)
            }
        );
    }

    #[tokio::test]
    async fn failed_write_leaves_previous_value() {
        let fx = fixture();
        let subject = SubjectKey::user(1);
        let old = profile(10, fx.clock.now());
        fx.cache
            .write(subject, FieldKind::Profile, old.clone())
            .await
            .expect("write");

        fx.store.fail_writes(true);
        let result = fx
            .cache
            .write(subject, FieldKind::Profile, profile(11, fx.clock.now()))
            .await;

        assert!(matches!(result, Err(SyncError::Persistence(_))));
        assert_eq!(
            fx.cache.read(subject, FieldKind::Profile).await,
            CacheRead::Fresh(old)
        );
    }

    #[tokio::test]
    async fn miss_falls_through_to_store() {
        let fx = fixture();
        let subject = SubjectKey::user(2);
        let stored = profile(30, fx.clock.now());
        fx.store.insert(subject, FieldKind::Profile, stored.clone());

        assert!(fx.cache.is_empty());
        assert_eq!(
            fx.cache.read(subject, FieldKind::Profile).await,
            CacheRead::Fresh(stored)
        );
        assert_eq!(fx.cache.len(), 1);
    }

    #[tokio::test]
    async fn value_under_other_policy_is_stale() {
        let fx = fixture();
        let subject = SubjectKey::user(3);
        let mut field = profile(1, fx.clock.now());
        field.policy = PolicyKind::DailyCompletion;
        field.metadata.completed = true;
        fx.cache
            .write(subject, FieldKind::Profile, field)
            .await
            .expect("write");

        assert!(!fx.cache.read(subject, FieldKind::Profile).await.is_fresh());
    }

    #[tokio::test]
    async fn subject_locks_are_independent() {
        let fx = fixture();
        let held = fx.cache.lock_subject(SubjectKey::user(1)).await;

        let other = tokio::time::timeout(
            Duration::from_secs(1),
            fx.cache.lock_subject(SubjectKey::user(2)),
        )
        .await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(
            Duration::from_millis(50),
            fx.cache.lock_subject(SubjectKey::user(1)),
        )
        .await;
        assert!(same.is_err());
        drop(held);
    }

    #[tokio::test]
    async fn snapshot_lists_subject_fields() {
        let fx = fixture();
        let subject = SubjectKey::user(4);
        let now = fx.clock.now();
        fx.cache
            .write(subject, FieldKind::Profile, profile(5, now))
            .await
            .expect("write");
        fx.cache
            .write(
                subject,
                FieldKind::DailyTasks,
                CachedField {
                    value: json!({ "done": 3, "target": 3 }),
                    policy: PolicyKind::DailyCompletion,
                    metadata: FieldMetadata::fetched_at(now).with_completed(true),
                },
            )
            .await
            .expect("write");

        let kinds: Vec<FieldKind> = fx.cache.snapshot(subject).into_iter().map(|(k, _)| k).collect();
        assert_eq!(kinds, vec![FieldKind::Profile, FieldKind::DailyTasks]);
        assert!(fx.cache.snapshot(SubjectKey::user(99)).is_empty());
    }
}
