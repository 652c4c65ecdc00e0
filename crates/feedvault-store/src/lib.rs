//! # Feedvault Store
//!
//! Persistent response cache for the feedvault fetch layer, backed by an
//! embedded `DuckDB` file.
//!
//! The store is a single table keyed by the canonical request fingerprint:
//!
//! | Column | Type | Description |
//! |--------|------|-------------|
//! | `key` | `TEXT` (primary key) | Canonical request fingerprint |
//! | `value` | `TEXT` | Response payload as received |
//! | `updated_at` | `BIGINT` | Fetch time, unix milliseconds (UTC) |
//! | `ttl_seconds` | `BIGINT` | Freshness window the entry was written with |
//! | `source` | `TEXT` | Provider identifier |
//! | `endpoint` | `TEXT` | Provider endpoint |
//! | `checksum` | `TEXT` | SHA-256 of `value`, verified on every read |
//!
//! Writes are single-statement `INSERT OR REPLACE` upserts, so a reader sees
//! either the previous row or the new one. The checksum guards against rows
//! that were damaged outside the engine.
//!
//! ## Sharing the file between processes
//!
//! `DuckDB` lets only one process hold a database file at a time, even for
//! reading. A file-backed store therefore keeps no connection open between
//! operations: each `get`, `put`, `invalidate` or `prune` opens the file,
//! runs its statement and closes it again. A process that finds the file
//! locked retries for up to [`StoreConfig::lock_timeout`] before failing with
//! [`StoreError::Locked`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use feedvault_store::{CacheEntry, CacheStore, StoreConfig};
//! use time::OffsetDateTime;
//!
//! let store = CacheStore::open(StoreConfig::default())?;
//! store.put(&CacheEntry {
//!     key: String::from("fred|series|id=CPIAUCSL"),
//!     payload: String::from(r#"{"observations":[]}"#),
//!     fetched_at: OffsetDateTime::now_utc(),
//!     ttl_seconds: 86_400,
//!     source: String::from("fred"),
//!     endpoint: String::from("series"),
//! })?;
//! let entry = store.get("fred|series|id=CPIAUCSL")?;
//! assert!(entry.is_some());
//! # Ok::<(), feedvault_store::StoreError>(())
//! ```

pub mod duckdb;
pub mod migrations;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ::duckdb::{params, Connection, Row};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

pub use duckdb::{AccessMode, Connector, StoreConnection};

/// Errors raised by cache storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `DuckDB` engine error.
    #[error(transparent)]
    DuckDb(::duckdb::Error),

    /// Another process held the cache file for longer than the lock timeout.
    #[error("cache file is locked by another process: {0}")]
    Locked(::duckdb::Error),

    /// File system error while preparing the cache directory.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Stored payload does not match its checksum.
    #[error("cache entry '{key}' failed checksum verification")]
    ChecksumMismatch { key: String },

    /// A column holds a value that cannot be decoded.
    #[error("cache entry '{key}' is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    /// Write attempted on a store opened read-only.
    #[error("cache store at '{path}' is open read-only")]
    ReadOnly { path: String },
}

/// Where and how the cache file is opened.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the `DuckDB` cache file.
    pub db_path: PathBuf,
    /// How long an operation waits for another process to release the file.
    pub lock_timeout: std::time::Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: resolve_feedvault_home().join("cache").join("cache.duckdb"),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

const DEFAULT_LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: path.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, lock_timeout: std::time::Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }
}

impl From<::duckdb::Error> for StoreError {
    fn from(error: ::duckdb::Error) -> Self {
        if duckdb::is_lock_conflict(&error) {
            Self::Locked(error)
        } else {
            Self::DuckDb(error)
        }
    }
}

/// One cached response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Canonical request fingerprint.
    pub key: String,
    /// Response body exactly as received.
    pub payload: String,
    /// When the payload was fetched from the network.
    pub fetched_at: OffsetDateTime,
    /// Freshness window in seconds.
    pub ttl_seconds: u64,
    pub source: String,
    pub endpoint: String,
}

impl CacheEntry {
    pub fn age(&self, now: OffsetDateTime) -> Duration {
        now - self.fetched_at
    }

    pub fn expires_at(&self) -> OffsetDateTime {
        self.fetched_at + ttl_duration(self.ttl_seconds)
    }

    /// `true` iff `now - fetched_at < ttl_seconds`.
    pub fn is_fresh(&self, now: OffsetDateTime) -> bool {
        self.is_fresh_within(now, self.ttl_seconds)
    }

    /// Freshness judged against a reader-supplied ttl instead of the stored one.
    pub fn is_fresh_within(&self, now: OffsetDateTime, ttl_seconds: u64) -> bool {
        self.age(now) < ttl_duration(ttl_seconds)
    }
}

/// Aggregate view of the cache contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub oldest_fetched_at: Option<OffsetDateTime>,
    pub newest_fetched_at: Option<OffsetDateTime>,
    /// Entry count per source, sorted by source name.
    pub per_source: Vec<(String, u64)>,
}

/// Durable key/value cache for provider responses.
#[derive(Clone)]
pub struct CacheStore {
    connector: Arc<Connector>,
}

impl CacheStore {
    /// Open the cache with default configuration.
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(StoreConfig::default())
    }

    /// Open the cache for writing, creating the file and schema if needed.
    ///
    /// The file is locked only while an operation runs, so readers in other
    /// processes can open it between writes.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let connector = Connector::file(config.db_path, AccessMode::ReadWrite, config.lock_timeout);
        let store = Self {
            connector: Arc::new(connector),
        };
        store.initialize()?;
        Ok(store)
    }

    /// Open an existing cache file for reading only, waiting up to the
    /// default lock timeout whenever a writer is mid-operation.
    pub fn open_read_only(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_read_only_with(StoreConfig::at(path))
    }

    /// Read-only open with an explicit lock timeout. The file must exist.
    pub fn open_read_only_with(config: StoreConfig) -> Result<Self, StoreError> {
        let connector = Connector::file(config.db_path, AccessMode::ReadOnly, config.lock_timeout);
        drop(connector.connect()?);
        Ok(Self {
            connector: Arc::new(connector),
        })
    }

    /// Open a throwaway in-memory cache.
    pub fn in_memory() -> Result<Self, StoreError> {
        let store = Self {
            connector: Arc::new(Connector::in_memory()?),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), StoreError> {
        let connection = self.connector.connect()?;
        migrations::apply_migrations(&connection)?;
        Ok(())
    }

    /// Path of the cache file; `None` for in-memory stores.
    pub fn db_path(&self) -> Option<&Path> {
        self.connector.db_path()
    }

    /// Point lookup. Returns stale entries too; freshness is the reader's call.
    pub fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        let connection = self.connector.connect()?;
        let row = connection.query_row(
            "SELECT key, value, updated_at, ttl_seconds, source, endpoint, checksum \
             FROM cache_entries WHERE key = ?",
            params![key],
            read_row,
        );

        match row {
            Ok(raw) => raw.into_entry().map(Some),
            Err(::duckdb::Error::QueryReturnedNoRows) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    /// Upsert an entry. Replaces any prior row for the same key in one
    /// statement; the prior row survives if the statement fails.
    pub fn put(&self, entry: &CacheEntry) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let connection = self.connector.connect()?;
        let checksum = payload_checksum(&entry.payload);
        let ttl_seconds = clamped_ttl(entry.ttl_seconds);

        connection.execute(
            "INSERT OR REPLACE INTO cache_entries \
             (key, value, updated_at, ttl_seconds, source, endpoint, checksum) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                entry.key,
                entry.payload,
                to_unix_millis(entry.fetched_at),
                ttl_seconds,
                entry.source,
                entry.endpoint,
                checksum,
            ],
        )?;
        Ok(())
    }

    /// Remove one entry. Returns whether a row existed.
    pub fn invalidate(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_writable()?;
        let connection = self.connector.connect()?;
        let removed = connection.execute("DELETE FROM cache_entries WHERE key = ?", params![key])?;
        Ok(removed > 0)
    }

    /// Delete entries fetched before `older_than`. Returns the number removed.
    pub fn prune(&self, older_than: OffsetDateTime) -> Result<usize, StoreError> {
        self.ensure_writable()?;
        let connection = self.connector.connect()?;
        let removed = connection.execute(
            "DELETE FROM cache_entries WHERE updated_at < ?",
            params![to_unix_millis(older_than)],
        )?;
        Ok(removed)
    }

    /// Delete entries whose own ttl has elapsed at `now`.
    pub fn prune_expired(&self, now: OffsetDateTime) -> Result<usize, StoreError> {
        self.ensure_writable()?;
        let connection = self.connector.connect()?;
        let removed = connection.execute(
            "DELETE FROM cache_entries WHERE updated_at + ttl_seconds * 1000 <= ?",
            params![to_unix_millis(now)],
        )?;
        Ok(removed)
    }

    /// Keys starting with `prefix`, sorted, at most `limit`.
    pub fn list_keys(&self, prefix: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let connection = self.connector.connect()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut statement = connection.prepare(
            "SELECT key FROM cache_entries WHERE starts_with(key, ?) ORDER BY key LIMIT ?",
        )?;
        let rows = statement.query_map(params![prefix, limit], |row| row.get::<_, String>(0))?;
        let keys = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    pub fn stats(&self) -> Result<CacheStats, StoreError> {
        let connection = self.connector.connect()?;
        let (entries, oldest, newest): (i64, Option<i64>, Option<i64>) = connection.query_row(
            "SELECT COUNT(*), MIN(updated_at), MAX(updated_at) FROM cache_entries",
            params![],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let per_source = source_counts(&connection)?;

        Ok(CacheStats {
            entries: u64::try_from(entries).unwrap_or(0),
            oldest_fetched_at: oldest.map(from_unix_millis).transpose().map_err(|reason| {
                StoreError::Corrupt {
                    key: String::from("<stats>"),
                    reason,
                }
            })?,
            newest_fetched_at: newest.map(from_unix_millis).transpose().map_err(|reason| {
                StoreError::Corrupt {
                    key: String::from("<stats>"),
                    reason,
                }
            })?,
            per_source,
        })
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.connector.mode() == AccessMode::ReadOnly {
            return Err(StoreError::ReadOnly {
                path: self
                    .connector
                    .db_path()
                    .map(|path| path.display().to_string())
                    .unwrap_or_else(|| String::from(":memory:")),
            });
        }
        Ok(())
    }
}

fn source_counts(connection: &Connection) -> Result<Vec<(String, u64)>, StoreError> {
    let mut statement = connection.prepare(
        "SELECT source, COUNT(*) FROM cache_entries GROUP BY source ORDER BY source",
    )?;
    let rows = statement.query_map(params![], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut counts = Vec::new();
    for row in rows {
        let (source, count) = row?;
        counts.push((source, u64::try_from(count).unwrap_or(0)));
    }
    Ok(counts)
}

struct RawRow {
    key: String,
    value: String,
    updated_at: i64,
    ttl_seconds: i64,
    source: String,
    endpoint: String,
    checksum: String,
}

fn read_row(row: &Row<'_>) -> Result<RawRow, ::duckdb::Error> {
    Ok(RawRow {
        key: row.get(0)?,
        value: row.get(1)?,
        updated_at: row.get(2)?,
        ttl_seconds: row.get(3)?,
        source: row.get(4)?,
        endpoint: row.get(5)?,
        checksum: row.get(6)?,
    })
}

impl RawRow {
    fn into_entry(self) -> Result<CacheEntry, StoreError> {
        if payload_checksum(&self.value) != self.checksum {
            return Err(StoreError::ChecksumMismatch { key: self.key });
        }

        let fetched_at = from_unix_millis(self.updated_at).map_err(|reason| StoreError::Corrupt {
            key: self.key.clone(),
            reason,
        })?;
        let ttl_seconds = u64::try_from(self.ttl_seconds).map_err(|_| StoreError::Corrupt {
            key: self.key.clone(),
            reason: format!("negative ttl_seconds {}", self.ttl_seconds),
        })?;

        Ok(CacheEntry {
            key: self.key,
            payload: self.value,
            fetched_at,
            ttl_seconds,
            source: self.source,
            endpoint: self.endpoint,
        })
    }
}

fn payload_checksum(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Upper bound for stored ttls; keeps `updated_at + ttl` arithmetic in range.
const MAX_TTL_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

fn clamped_ttl(ttl_seconds: u64) -> i64 {
    i64::try_from(ttl_seconds.min(MAX_TTL_SECONDS)).unwrap_or(i64::MAX)
}

fn ttl_duration(ttl_seconds: u64) -> Duration {
    Duration::seconds(clamped_ttl(ttl_seconds))
}

fn to_unix_millis(at: OffsetDateTime) -> i64 {
    let millis = at.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(i64::MAX)
}

fn from_unix_millis(millis: i64) -> Result<OffsetDateTime, String> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|error| format!("invalid updated_at {millis}: {error}"))
}

fn resolve_feedvault_home() -> PathBuf {
    if let Some(path) = env::var_os("FEEDVAULT_HOME") {
        let path = PathBuf::from(path);
        if !path.as_os_str().is_empty() {
            return path;
        }
    }

    PathBuf::from("data")
}
