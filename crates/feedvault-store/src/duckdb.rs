//! `DuckDB` connections for the cache file.
//!
//! `DuckDB` allows one process at a time to hold a database file, whatever
//! the access mode. A file-backed [`Connector`] therefore opens a connection
//! per operation and closes it on drop, so the file lock is held only while a
//! statement runs. When another process holds the lock, opening is retried
//! until the configured lock timeout elapses.

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use ::duckdb::{Config, Connection};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// How the underlying database file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Inspection only; writes are refused before they reach the engine.
    ReadOnly,
    /// The single writer for the file.
    ReadWrite,
}

enum Backing {
    File { path: PathBuf, mode: AccessMode },
    /// In-memory databases live as long as a connection does, so the root is
    /// kept and every operation works on a clone of it.
    Memory(Mutex<Connection>),
}

/// Opens short-lived connections to one `DuckDB` database.
pub struct Connector {
    backing: Backing,
    lock_timeout: Duration,
}

impl Connector {
    /// Connector for the database file at `path`. Nothing is opened yet.
    pub fn file(path: impl Into<PathBuf>, mode: AccessMode, lock_timeout: Duration) -> Self {
        Self {
            backing: Backing::File {
                path: path.into(),
                mode,
            },
            lock_timeout,
        }
    }

    /// Private in-memory database. Used by tests and dry runs.
    pub fn in_memory() -> Result<Self, ::duckdb::Error> {
        let root = Connection::open_in_memory()?;
        configure_connection(&root)?;
        Ok(Self {
            backing: Backing::Memory(Mutex::new(root)),
            lock_timeout: Duration::ZERO,
        })
    }

    /// Open a connection for one operation, waiting out a file lock held by
    /// another process for at most the lock timeout.
    ///
    /// # Panics
    /// Panics if the in-memory root mutex is poisoned.
    pub fn connect(&self) -> Result<StoreConnection, ::duckdb::Error> {
        let (path, mode) = match &self.backing {
            Backing::Memory(root) => {
                let connection = root
                    .lock()
                    .expect("duckdb root connection mutex poisoned")
                    .try_clone()?;
                return Ok(StoreConnection(connection));
            }
            Backing::File { path, mode } => (path, *mode),
        };

        let started = Instant::now();
        loop {
            match open_connection(path, mode) {
                Ok(connection) => return Ok(StoreConnection(connection)),
                Err(error) if is_lock_conflict(&error) && started.elapsed() < self.lock_timeout => {
                    thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(error) => return Err(error),
            }
        }
    }

    pub fn mode(&self) -> AccessMode {
        match &self.backing {
            Backing::File { mode, .. } => *mode,
            Backing::Memory(_) => AccessMode::ReadWrite,
        }
    }

    /// Database file path; `None` for in-memory databases.
    pub fn db_path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::File { path, .. } => Some(path.as_path()),
            Backing::Memory(_) => None,
        }
    }
}

/// A connection scoped to one store operation. Dropping it releases the
/// file lock.
pub struct StoreConnection(Connection);

impl Deref for StoreConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

fn open_connection(path: &Path, mode: AccessMode) -> Result<Connection, ::duckdb::Error> {
    let access = match mode {
        AccessMode::ReadOnly => ::duckdb::AccessMode::ReadOnly,
        AccessMode::ReadWrite => ::duckdb::AccessMode::ReadWrite,
    };
    let connection = Connection::open_with_flags(path, Config::default().access_mode(access)?)?;
    configure_connection(&connection)?;
    Ok(connection)
}

fn configure_connection(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch("PRAGMA disable_progress_bar;")
}

/// `DuckDB` reports a file held by another process as an IO error naming the
/// lock; there is no dedicated error code for it.
pub(crate) fn is_lock_conflict(error: &::duckdb::Error) -> bool {
    let message = error.to_string();
    message.contains("Could not set lock on file") || message.contains("Conflicting lock")
}
