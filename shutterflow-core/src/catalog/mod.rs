//! Durable pipeline catalog backed by SQLite.
//!
//! Every stage reads and writes file/batch state through here; status
//! transitions are guarded UPDATEs so concurrent runners race safely on
//! rows instead of on locks.

pub mod batches;
pub mod events;
pub mod files;

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::error::{PipelineError, Result};

pub use batches::{BatchMember, BatchRecord, BatchStore};
pub use events::{EventLevel, EventLog, EventRecord};
pub use files::{FileRecord, FileStore};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    size INTEGER NOT NULL,
    sha256 TEXT,
    capture_time TEXT,
    ctime REAL,
    mtime REAL,
    status TEXT NOT NULL,
    batch_id INTEGER,
    target_path TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_files_sha256 ON files(sha256);
CREATE INDEX IF NOT EXISTS idx_files_status ON files(status);

CREATE TABLE IF NOT EXISTS batches (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    file_count INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    synced_at TEXT,
    sorted_at TEXT,
    manifest_path TEXT,
    sync_progress REAL NOT NULL DEFAULT 0,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    module TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    context TEXT
);
"#;

/// Lifecycle of a single file moving through the pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    /// Discovered but not yet hashed.
    New,
    /// First occurrence of its digest; eligible for batching.
    Unique,
    /// Later occurrence of a known digest; excluded from batching.
    Duplicate,
    /// Claimed by a batch and staged into its directory.
    Batched,
    /// The owning batch finished replication.
    Synced,
    /// Moved to its final archive location.
    Sorted,
    /// Terminal bookkeeping state stamped by external archival tooling;
    /// no stage writes it.
    Archived,
    /// A stage failed on this file; `error` holds the reason.
    Error,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::New => "NEW",
            FileStatus::Unique => "UNIQUE",
            FileStatus::Duplicate => "DUPLICATE",
            FileStatus::Batched => "BATCHED",
            FileStatus::Synced => "SYNCED",
            FileStatus::Sorted => "SORTED",
            FileStatus::Archived => "ARCHIVED",
            FileStatus::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(FileStatus::New),
            "UNIQUE" => Ok(FileStatus::Unique),
            "DUPLICATE" => Ok(FileStatus::Duplicate),
            "BATCHED" => Ok(FileStatus::Batched),
            "SYNCED" => Ok(FileStatus::Synced),
            "SORTED" => Ok(FileStatus::Sorted),
            "ARCHIVED" => Ok(FileStatus::Archived),
            "ERROR" => Ok(FileStatus::Error),
            other => Err(PipelineError::InvalidState(format!(
                "unknown file status {other:?}"
            ))),
        }
    }
}

/// Lifecycle of a batch from creation to a fully sorted archive.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    /// Transient marker while members are being claimed and staged.
    InProgress,
    /// Staged on disk, waiting for replication to start.
    Pending,
    /// Replication requested; completion is being polled.
    Syncing,
    /// Replication reached 100%; members fanned out to SYNCED.
    Synced,
    /// Archive moves are underway.
    Sorting,
    /// Every member reached its archive location.
    Sorted,
    /// A stage failed; retryable via the retry operation.
    Error,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::InProgress => "IN_PROGRESS",
            BatchStatus::Pending => "PENDING",
            BatchStatus::Syncing => "SYNCING",
            BatchStatus::Synced => "SYNCED",
            BatchStatus::Sorting => "SORTING",
            BatchStatus::Sorted => "SORTED",
            BatchStatus::Error => "ERROR",
        }
    }

    /// Terminal for the sequential guard: only fully sorted batches stop
    /// blocking the next batch.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Sorted)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "IN_PROGRESS" => Ok(BatchStatus::InProgress),
            "PENDING" => Ok(BatchStatus::Pending),
            "SYNCING" => Ok(BatchStatus::Syncing),
            "SYNCED" => Ok(BatchStatus::Synced),
            "SORTING" => Ok(BatchStatus::Sorting),
            "SORTED" => Ok(BatchStatus::Sorted),
            "ERROR" => Ok(BatchStatus::Error),
            other => Err(PipelineError::InvalidState(format!(
                "unknown batch status {other:?}"
            ))),
        }
    }
}

/// Handle to the catalog database plus its per-table stores.
#[derive(Debug, Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

impl Catalog {
    /// Open (creating if missing) the catalog at `path` and apply the
    /// schema. The DDL is idempotent, so reopening an existing catalog is
    /// a no-op.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(std::time::Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// In-memory catalog for tests. Restricted to a single connection so
    /// every query sees the same database.
    pub async fn in_memory() -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn files(&self) -> FileStore {
        FileStore::new(self.pool.clone())
    }

    pub fn batches(&self) -> BatchStore {
        BatchStore::new(self.pool.clone())
    }

    pub fn events(&self) -> EventLog {
        EventLog::new(self.pool.clone())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Cheap liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
