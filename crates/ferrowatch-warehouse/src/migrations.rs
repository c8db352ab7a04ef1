use ::duckdb::{params, Connection};

struct Migration {
    version: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_field_snapshots",
        sql: r#"
CREATE TABLE IF NOT EXISTS fields_latest (
    subject TEXT NOT NULL,
    field TEXT NOT NULL,
    policy TEXT NOT NULL,
    value_json TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    active BOOLEAN NOT NULL,
    last_fetched TEXT NOT NULL,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY(subject, field)
);

CREATE TABLE IF NOT EXISTS field_snapshots (
    subject TEXT NOT NULL,
    field TEXT NOT NULL,
    policy TEXT NOT NULL,
    value_json TEXT NOT NULL,
    metadata_json TEXT NOT NULL,
    active BOOLEAN NOT NULL,
    last_fetched TEXT NOT NULL,
    recorded_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    },
    Migration {
        version: "0002_job_descriptors",
        sql: r#"
CREATE TABLE IF NOT EXISTS job_descriptors (
    name TEXT PRIMARY KEY,
    enabled BOOLEAN NOT NULL DEFAULT TRUE,
    interval_ms BIGINT NOT NULL,
    last_run TEXT,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    },
    Migration {
        version: "0003_indexes",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_field_snapshots_subject_field ON field_snapshots(subject, field);
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            params![migration.version],
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                params![migration.version],
            )?;
        }
    }

    Ok(())
}

pub fn applied_versions(connection: &Connection) -> Result<Vec<String>, ::duckdb::Error> {
    let mut statement =
        connection.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}
