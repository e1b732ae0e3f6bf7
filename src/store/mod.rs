//! Durable relational state for the pipeline.
//!
//! Every table lives in one SQLite database behind a single connection. All
//! multi-row mutations run inside one transaction, so the invariants that span
//! tables (event + job admission, payout confirmation + escrow decrement) are
//! committed atomically or not at all.
//!
//! Timestamps are stored as Unix milliseconds so that lease and backoff checks
//! are plain integer comparisons.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use thiserror::Error;

mod escrow;
mod events;
mod jobs;
mod projects;
mod schema;
mod submissions;

pub use escrow::{EscrowError, FinalizeOutcome, NewBounty, NewPayout, PayoutClaim};
pub use events::{Admission, SyncRequest};
pub use jobs::FailureRecorded;
pub use projects::LinkedAccount;
pub use submissions::NewSubmission;

use crate::types::{JobId, JobStatus};

/// Default retry budget for new jobs.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Errors returned by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store mutex poisoned")]
    Poisoned,

    /// The job is no longer leased by the caller (lease expired and was reclaimed).
    #[error("lease on job {job_id} is no longer held by {owner}")]
    LeaseLost { job_id: JobId, owner: String },

    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// Manual retry was requested for a job that is not in a terminal failure state.
    #[error("job {job_id} is {status}, not failed or dead")]
    NotRetryable { job_id: JobId, status: JobStatus },

    #[error("payload is not valid JSON: {0}")]
    Payload(#[from] serde_json::Error),

    /// A stored value could not be mapped back onto a domain type.
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },

    #[error(transparent)]
    Escrow(#[from] EscrowError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Handle to the relational store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    max_attempts: u32,
}

impl Store {
    /// Opens (or creates) the database at `path` and applies the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::bootstrap(conn)
    }

    /// Opens a private in-memory database.
    pub fn in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Sets the retry budget given to newly created jobs.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Retry budget given to newly created jobs.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Round-trips a trivial query; used by the health check.
    pub fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Maps a stored status column back onto its enum, or reports a corrupt row.
pub(crate) fn parse_column<T>(
    table: &'static str,
    raw: &str,
    parse: impl FnOnce(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    parse(raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("unknown value {raw:?} in {table}").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_applies_schema() {
        let store = Store::in_memory().unwrap();
        let conn = store.lock().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(tables >= 10);
    }

    #[test]
    fn schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.db");
        drop(Store::open(&path).unwrap());
        Store::open(&path).unwrap();
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        let store = Store::in_memory().unwrap().with_max_attempts(0);
        assert_eq!(store.max_attempts(), 1);
    }

    #[test]
    fn millis_roundtrip() {
        let now = Utc::now();
        let expected = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap();
        assert_eq!(from_millis(to_millis(now)), expected);
    }
}
