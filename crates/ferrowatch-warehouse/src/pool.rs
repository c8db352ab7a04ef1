//! Small `DuckDB` connection pool shared by warehouse clones.
//!
//! Every pooled connection is cloned from one root connection so all of them
//! share a single database instance (and its file lock).

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use ::duckdb::Connection;

struct PoolShared {
    db_path: PathBuf,
    max_idle: usize,
    root: Mutex<Connection>,
    idle: Mutex<Vec<Connection>>,
}

/// Hands out connections to one database file and keeps up to `max_idle`
/// around for reuse.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Open the database file and build a pool around it.
    ///
    /// # Errors
    /// Returns an error if the database file cannot be opened.
    pub fn open(path: impl Into<PathBuf>, max_idle: usize) -> Result<Self, ::duckdb::Error> {
        let db_path = path.into();
        let root = Connection::open(db_path.as_path())?;
        root.execute_batch("PRAGMA disable_progress_bar;")?;

        Ok(Self {
            shared: Arc::new(PoolShared {
                db_path,
                max_idle: max_idle.max(1),
                root: Mutex::new(root),
                idle: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Check out a connection, cloning a new one when none is idle.
    ///
    /// # Errors
    /// Returns an error if a new connection cannot be cloned from the root.
    ///
    /// # Panics
    /// Panics if a pool mutex is poisoned.
    pub fn checkout(&self) -> Result<PooledConnection, ::duckdb::Error> {
        let reused = self
            .shared
            .idle
            .lock()
            .expect("warehouse pool mutex poisoned")
            .pop();

        let connection = match reused {
            Some(connection) => connection,
            None => self
                .shared
                .root
                .lock()
                .expect("warehouse root connection mutex poisoned")
                .try_clone()?,
        };

        Ok(PooledConnection {
            shared: Arc::clone(&self.shared),
            connection: Some(connection),
        })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        self.shared.db_path.as_path()
    }
}

/// Connection that goes back to the idle list when dropped.
pub struct PooledConnection {
    shared: Arc<PoolShared>,
    connection: Option<Connection>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        self.connection
            .as_ref()
            .expect("pooled connection is present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };

        let Ok(mut idle) = self.shared.idle.lock() else {
            return;
        };
        if idle.len() < self.shared.max_idle {
            idle.push(connection);
        }
    }
}
