//! # Ferrowatch Warehouse
//!
//! DuckDB-backed durable storage for ferrowatch.
//!
//! The warehouse keeps two things the polling core needs to survive a
//! restart:
//!
//! - **Field snapshots**: the latest value of every tracked field per subject
//!   (`fields_latest`) plus an append-only history (`field_snapshots`).
//! - **Job descriptors**: enabled flag, interval and last-run timestamp for
//!   each background job (`job_descriptors`).
//!
//! Payloads are stored as opaque JSON text; the core owns their shape.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ferrowatch_warehouse::{FieldRecord, Warehouse};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let warehouse = Warehouse::open_default()?;
//!     warehouse.upsert_field(&FieldRecord {
//!         subject: "user:1".to_string(),
//!         field: "profile".to_string(),
//!         policy: "simple_ttl".to_string(),
//!         value_json: r#"{"level":12}"#.to_string(),
//!         metadata_json: "{}".to_string(),
//!         active: true,
//!         last_fetched: "2024-01-01T00:00:00Z".to_string(),
//!     })?;
//!     Ok(())
//! }
//! ```
//!
//! ## Tables
//!
//! | Table | Description |
//! |-------|-------------|
//! | `fields_latest` | Latest snapshot per (subject, field) |
//! | `field_snapshots` | Every snapshot ever written |
//! | `job_descriptors` | Job enabled flags and last runs |
//! | `schema_migrations` | Applied migration versions |

pub mod migrations;
pub mod pool;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::{params, Row};
use serde::Serialize;
use thiserror::Error;

pub use pool::{ConnectionPool, PooledConnection};

/// Errors that can occur during warehouse operations.
#[derive(Debug, Error)]
pub enum WarehouseError {
    /// `DuckDB` database error.
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    /// I/O error while preparing the database directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Caller passed a value the warehouse refuses to store.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Configuration for the warehouse database.
#[derive(Debug, Clone)]
pub struct WarehouseConfig {
    /// Root directory for ferrowatch data.
    pub ferrowatch_home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Maximum number of idle connections kept in the pool.
    pub max_pool_size: usize,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        let ferrowatch_home = resolve_ferrowatch_home();
        let db_path = ferrowatch_home.join("warehouse.duckdb");
        Self {
            ferrowatch_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

impl WarehouseConfig {
    /// Default configuration pointed at an explicit database file.
    pub fn at_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }
}

/// One stored field snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldRecord {
    /// Subject key, e.g. `user:42`.
    pub subject: String,
    /// Field kind, e.g. `education`.
    pub field: String,
    /// Staleness policy kind the field was written under.
    pub policy: String,
    /// Opaque JSON payload.
    pub value_json: String,
    /// JSON-encoded staleness metadata.
    pub metadata_json: String,
    /// Whether the underlying condition held when fetched.
    pub active: bool,
    /// RFC3339 fetch timestamp.
    pub last_fetched: String,
}

/// Persisted job descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub name: String,
    pub enabled: bool,
    pub interval_ms: u64,
    /// RFC3339 timestamp of the last finished cycle.
    pub last_run: Option<String>,
}

/// The main warehouse interface.
#[derive(Clone)]
pub struct Warehouse {
    config: WarehouseConfig,
    pool: ConnectionPool,
}

impl Warehouse {
    /// Open a warehouse with default configuration.
    pub fn open_default() -> Result<Self, WarehouseError> {
        Self::open(WarehouseConfig::default())
    }

    /// Open a warehouse with the specified configuration.
    pub fn open(config: WarehouseConfig) -> Result<Self, WarehouseError> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let pool = ConnectionPool::open(config.db_path.clone(), config.max_pool_size)?;
        let warehouse = Self { config, pool };
        warehouse.initialize()?;
        Ok(warehouse)
    }

    /// Apply pending migrations.
    pub fn initialize(&self) -> Result<(), WarehouseError> {
        let connection = self.pool.checkout()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    /// Get the path to the database file.
    pub fn db_path(&self) -> &Path {
        self.pool.db_path()
    }

    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    /// Versions of every migration applied to this database.
    pub fn schema_versions(&self) -> Result<Vec<String>, WarehouseError> {
        let connection = self.pool.checkout()?;
        Ok(migrations::applied_versions(&connection)?)
    }

    /// Replace the latest snapshot for the record's (subject, field) and append
    /// it to the history, in one transaction.
    pub fn upsert_field(&self, record: &FieldRecord) -> Result<(), WarehouseError> {
        if record.subject.trim().is_empty() || record.field.trim().is_empty() {
            return Err(WarehouseError::InvalidRecord(String::from(
                "subject and field must not be empty",
            )));
        }

        let connection = self.pool.checkout()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<(), WarehouseError> {
            connection.execute(
                "INSERT OR REPLACE INTO fields_latest \
                 (subject, field, policy, value_json, metadata_json, active, last_fetched, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)",
                params![
                    record.subject,
                    record.field,
                    record.policy,
                    record.value_json,
                    record.metadata_json,
                    record.active,
                    record.last_fetched,
                ],
            )?;
            connection.execute(
                "INSERT INTO field_snapshots \
                 (subject, field, policy, value_json, metadata_json, active, last_fetched, recorded_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP)",
                params![
                    record.subject,
                    record.field,
                    record.policy,
                    record.value_json,
                    record.metadata_json,
                    record.active,
                    record.last_fetched,
                ],
            )?;
            Ok(())
        })();

        finalize_transaction(&connection, result)
    }

    /// Latest snapshot for one (subject, field), if any was ever written.
    pub fn latest_field(
        &self,
        subject: &str,
        field: &str,
    ) -> Result<Option<FieldRecord>, WarehouseError> {
        let connection = self.pool.checkout()?;
        let mut statement = connection.prepare(
            "SELECT subject, field, policy, value_json, metadata_json, active, last_fetched \
             FROM fields_latest WHERE subject = ? AND field = ?",
        )?;
        let mut rows = statement.query_map(params![subject, field], read_field_row)?;
        Ok(rows.next().transpose()?)
    }

    /// Latest snapshots of every field of one subject, ordered by field name.
    pub fn subject_fields(&self, subject: &str) -> Result<Vec<FieldRecord>, WarehouseError> {
        let connection = self.pool.checkout()?;
        let mut statement = connection.prepare(
            "SELECT subject, field, policy, value_json, metadata_json, active, last_fetched \
             FROM fields_latest WHERE subject = ? ORDER BY field",
        )?;
        let rows = statement.query_map(params![subject], read_field_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recent snapshots of one (subject, field), newest first.
    pub fn field_history(
        &self,
        subject: &str,
        field: &str,
        limit: usize,
    ) -> Result<Vec<FieldRecord>, WarehouseError> {
        let limit = i64::try_from(limit.max(1)).unwrap_or(i64::MAX);
        let connection = self.pool.checkout()?;
        let mut statement = connection.prepare(
            "SELECT subject, field, policy, value_json, metadata_json, active, last_fetched \
             FROM field_snapshots WHERE subject = ? AND field = ? \
             ORDER BY recorded_at DESC, last_fetched DESC LIMIT ?",
        )?;
        let rows = statement.query_map(params![subject, field, limit], read_field_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Register a job if it is unknown. Existing descriptors keep their
    /// enabled flag; the interval is refreshed.
    pub fn ensure_job(&self, name: &str, interval_ms: u64) -> Result<(), WarehouseError> {
        let interval_ms = to_i64(interval_ms)?;
        let connection = self.pool.checkout()?;
        let existing: i64 = connection.query_row(
            "SELECT COUNT(*) FROM job_descriptors WHERE name = ?",
            params![name],
            |row| row.get(0),
        )?;

        if existing == 0 {
            connection.execute(
                "INSERT INTO job_descriptors (name, enabled, interval_ms, last_run, updated_at) \
                 VALUES (?, TRUE, ?, NULL, CURRENT_TIMESTAMP)",
                params![name, interval_ms],
            )?;
        } else {
            connection.execute(
                "UPDATE job_descriptors SET interval_ms = ?, updated_at = CURRENT_TIMESTAMP \
                 WHERE name = ?",
                params![interval_ms, name],
            )?;
        }
        Ok(())
    }

    /// Flip a job's enabled flag. Returns `false` when no such job exists.
    pub fn set_job_enabled(&self, name: &str, enabled: bool) -> Result<bool, WarehouseError> {
        let connection = self.pool.checkout()?;
        let changed = connection.execute(
            "UPDATE job_descriptors SET enabled = ?, updated_at = CURRENT_TIMESTAMP WHERE name = ?",
            params![enabled, name],
        )?;
        Ok(changed > 0)
    }

    pub fn job(&self, name: &str) -> Result<Option<JobRecord>, WarehouseError> {
        let connection = self.pool.checkout()?;
        let mut statement = connection.prepare(
            "SELECT name, enabled, interval_ms, last_run FROM job_descriptors WHERE name = ?",
        )?;
        let mut rows = statement.query_map(params![name], read_job_row)?;
        Ok(rows.next().transpose()?)
    }

    pub fn jobs(&self) -> Result<Vec<JobRecord>, WarehouseError> {
        let connection = self.pool.checkout()?;
        let mut statement = connection.prepare(
            "SELECT name, enabled, interval_ms, last_run FROM job_descriptors ORDER BY name",
        )?;
        let rows = statement.query_map([], read_job_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Store the last-run timestamp. Unknown jobs are registered on the fly
    /// with a zero interval.
    pub fn record_job_run(&self, name: &str, ran_at: &str) -> Result<(), WarehouseError> {
        let connection = self.pool.checkout()?;
        let changed = connection.execute(
            "UPDATE job_descriptors SET last_run = ?, updated_at = CURRENT_TIMESTAMP WHERE name = ?",
            params![ran_at, name],
        )?;
        if changed == 0 {
            connection.execute(
                "INSERT INTO job_descriptors (name, enabled, interval_ms, last_run, updated_at) \
                 VALUES (?, TRUE, 0, ?, CURRENT_TIMESTAMP)",
                params![name, ran_at],
            )?;
        }
        Ok(())
    }
}

/// Finalize a transaction, committing on success or rolling back on failure.
fn finalize_transaction<T>(
    connection: &::duckdb::Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(error)
        }
    }
}

fn read_field_row(row: &Row<'_>) -> Result<FieldRecord, ::duckdb::Error> {
    Ok(FieldRecord {
        subject: row.get(0)?,
        field: row.get(1)?,
        policy: row.get(2)?,
        value_json: row.get(3)?,
        metadata_json: row.get(4)?,
        active: row.get(5)?,
        last_fetched: row.get(6)?,
    })
}

fn read_job_row(row: &Row<'_>) -> Result<JobRecord, ::duckdb::Error> {
    let interval_ms: i64 = row.get(2)?;
    Ok(JobRecord {
        name: row.get(0)?,
        enabled: row.get(1)?,
        interval_ms: u64::try_from(interval_ms).unwrap_or(0),
        last_run: row.get(3)?,
    })
}

fn to_i64(value: u64) -> Result<i64, WarehouseError> {
    i64::try_from(value)
        .map_err(|_| WarehouseError::InvalidRecord(format!("value {value} exceeds BIGINT range")))
}

/// Resolve the ferrowatch home directory from the environment.
fn resolve_ferrowatch_home() -> PathBuf {
    if let Some(path) = env::var_os("FERROWATCH_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    if let Some(home) = env::var_os("HOME") {
        return PathBuf::from(home).join(".ferrowatch");
    }

    PathBuf::from(".ferrowatch")
}
