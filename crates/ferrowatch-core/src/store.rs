//! Durable field storage behind the adaptive cache.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use ferrowatch_warehouse::{FieldRecord, Warehouse};

use crate::cache::CachedField;
use crate::domain::{FieldKind, SubjectKey, UtcDateTime};
use crate::staleness::{FieldMetadata, PolicyKind};
use crate::SyncError;

type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SyncError>> + Send + 'a>>;

/// Storage collaborator the cache writes through to and falls back on.
pub trait FieldStore: Send + Sync {
    /// Replace the latest value of `(subject, kind)`.
    fn upsert<'a>(
        &'a self,
        subject: SubjectKey,
        kind: FieldKind,
        field: &'a CachedField,
    ) -> StoreFuture<'a, ()>;

    fn find_latest<'a>(
        &'a self,
        subject: SubjectKey,
        kind: FieldKind,
    ) -> StoreFuture<'a, Option<CachedField>>;
}

/// Map-backed store for tests and dry runs. Writes can be made to fail.
#[derive(Debug, Default)]
pub struct InMemoryFieldStore {
    fields: Mutex<BTreeMap<(SubjectKey, FieldKind), CachedField>>,
    fail_writes: AtomicBool,
    upserts: AtomicUsize,
}

impl InMemoryFieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Successful upserts so far.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    pub fn get(&self, subject: SubjectKey, kind: FieldKind) -> Option<CachedField> {
        self.fields
            .lock()
            .expect("in-memory store lock is not poisoned")
            .get(&(subject, kind))
            .cloned()
    }

    /// Seed a value without counting it as an upsert.
    pub fn insert(&self, subject: SubjectKey, kind: FieldKind, field: CachedField) {
        self.fields
            .lock()
            .expect("in-memory store lock is not poisoned")
            .insert((subject, kind), field);
    }
}

impl FieldStore for InMemoryFieldStore {
    fn upsert<'a>(
        &'a self,
        subject: SubjectKey,
        kind: FieldKind,
        field: &'a CachedField,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(SyncError::Persistence(format!(
                    "write rejected for {subject}/{kind}"
                )));
            }

            self.insert(subject, kind, field.clone());
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn find_latest<'a>(
        &'a self,
        subject: SubjectKey,
        kind: FieldKind,
    ) -> StoreFuture<'a, Option<CachedField>> {
        Box::pin(async move { Ok(self.get(subject, kind)) })
    }
}

impl FieldStore for Warehouse {
    fn upsert<'a>(
        &'a self,
        subject: SubjectKey,
        kind: FieldKind,
        field: &'a CachedField,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let record = to_record(subject, kind, field)?;
            let warehouse = self.clone();
            tokio::task::spawn_blocking(move || warehouse.upsert_field(&record))
                .await
                .map_err(|error| SyncError::Persistence(format!("storage task failed: {error}")))?
                .map_err(|error| SyncError::Persistence(error.to_string()))
        })
    }

    fn find_latest<'a>(
        &'a self,
        subject: SubjectKey,
        kind: FieldKind,
    ) -> StoreFuture<'a, Option<CachedField>> {
        Box::pin(async move {
            let warehouse = self.clone();
            let subject_key = subject.to_string();
            let record = tokio::task::spawn_blocking(move || {
                warehouse.latest_field(&subject_key, kind.as_str())
            })
            .await
            .map_err(|error| SyncError::Persistence(format!("storage task failed: {error}")))?
            .map_err(|error| SyncError::Persistence(error.to_string()))?;

            record.map(|record| from_record(&record)).transpose()
        })
    }
}

fn to_record(
    subject: SubjectKey,
    kind: FieldKind,
    field: &CachedField,
) -> Result<FieldRecord, SyncError> {
    let encode = |error: serde_json::Error| {
        SyncError::Persistence(format!("cannot encode {subject}/{kind}: {error}"))
    };

    Ok(FieldRecord {
        subject: subject.to_string(),
        field: kind.as_str().to_string(),
        policy: field.policy.as_str().to_string(),
        value_json: serde_json::to_string(&field.value).map_err(encode)?,
        metadata_json: serde_json::to_string(&field.metadata).map_err(encode)?,
        active: field.metadata.active,
        last_fetched: field.metadata.last_fetched.format_rfc3339(),
    })
}

fn from_record(record: &FieldRecord) -> Result<CachedField, SyncError> {
    let decode = |what: &str, detail: String| {
        SyncError::Persistence(format!(
            "stored {what} for {}/{} is unreadable: {detail}",
            record.subject, record.field
        ))
    };

    let policy = record
        .policy
        .parse::<PolicyKind>()
        .map_err(|error| decode("policy", error.to_string()))?;
    let value = serde_json::from_str(&record.value_json)
        .map_err(|error| decode("value", error.to_string()))?;
    let mut metadata: FieldMetadata = serde_json::from_str(&record.metadata_json)
        .map_err(|error| decode("metadata", error.to_string()))?;

    // Columns win over the JSON copy.
    metadata.active = record.active;
    metadata.last_fetched = UtcDateTime::parse(&record.last_fetched)
        .map_err(|error| decode("last_fetched", error.to_string()))?;

    Ok(CachedField {
        value,
        policy,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;
    use ferrowatch_warehouse::WarehouseConfig;

    fn field() -> CachedField {
        let fetched = UtcDateTime::parse("2024-01-01T08:00:00Z").expect("must parse");
        let expires = UtcDateTime::parse("2024-01-03T08:00:00Z").expect("must parse");
        CachedField {
            value: json!({ "course": 42, "time_left": 172_800 }),
            policy: PolicyKind::ExpiryGated,
            metadata: FieldMetadata::fetched_at(fetched).active_until(expires),
        }
    }

    #[tokio::test]
    async fn warehouse_store_round_trips_fields() {
        let temp = tempdir().expect("tempdir");
        let warehouse = Warehouse::open(WarehouseConfig::at_path(temp.path().join("w.duckdb")))
            .expect("warehouse opens");
        let subject = SubjectKey::user(7);

        assert_eq!(
            warehouse
                .find_latest(subject, FieldKind::Education)
                .await
                .expect("query"),
            None
        );

        let stored = field();
        warehouse
            .upsert(subject, FieldKind::Education, &stored)
            .await
            .expect("upsert");

        let loaded = warehouse
            .find_latest(subject, FieldKind::Education)
            .await
            .expect("query");
        assert_eq!(loaded, Some(stored));
    }

    #[tokio::test]
    async fn in_memory_store_can_reject_writes() {
        let store = InMemoryFieldStore::new();
        store.fail_writes(true);

        let error = store
            .upsert(SubjectKey::user(1), FieldKind::Profile, &field())
            .await
            .expect_err("write should fail");

        assert!(matches!(error, SyncError::Persistence(_)));
        assert_eq!(store.upsert_count(), 0);
        assert!(store.get(SubjectKey::user(1), FieldKind::Profile).is_none());
    }
}
