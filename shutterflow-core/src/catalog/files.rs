use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::catalog::FileStatus;
use crate::error::Result;

/// One row of the `files` table. `path` tracks the file's current on-disk
/// location; `target_path` is filled once the sorter archives it.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub size: i64,
    pub sha256: Option<String>,
    pub capture_time: Option<DateTime<Utc>>,
    pub ctime: Option<f64>,
    pub mtime: Option<f64>,
    pub status: FileStatus,
    pub batch_id: Option<i64>,
    pub target_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FileStore {
    pool: SqlitePool,
}

impl FileStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Register a discovered file as NEW. Re-discovering an existing row
    /// refreshes its size and timestamps only while it is still NEW or
    /// ERROR; rows that made progress are left untouched, which is what
    /// makes a repeated dedup pass a no-op.
    pub async fn upsert_discovered(
        &self,
        path: &str,
        size: i64,
        ctime: Option<f64>,
        mtime: Option<f64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (path, size, ctime, mtime, status)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(path) DO UPDATE SET
                size = excluded.size,
                ctime = excluded.ctime,
                mtime = excluded.mtime,
                status = ?5,
                error = NULL
            WHERE files.status IN (?5, ?6)
            "#,
        )
        .bind(path)
        .bind(size)
        .bind(ctime)
        .bind(mtime)
        .bind(FileStatus::New)
        .bind(FileStatus::Error)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM files WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(record)
    }

    pub async fn get_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM files WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(self.pool())
        .await?;
        Ok(record)
    }

    /// Files still waiting to be hashed, in deterministic path order.
    pub async fn list_new(&self) -> Result<Vec<FileRecord>> {
        let records = sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM files WHERE status = ?1 ORDER BY path",
        )
        .bind(FileStatus::New)
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    /// UNIQUE files not yet claimed by any batch, in path order. This is
    /// the candidate set for batch selection.
    pub async fn list_selectable(&self) -> Result<Vec<FileRecord>> {
        let records = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT * FROM files
            WHERE status = ?1 AND batch_id IS NULL
            ORDER BY path
            "#,
        )
        .bind(FileStatus::Unique)
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    pub async fn list_for_batch(&self, batch_id: i64) -> Result<Vec<FileRecord>> {
        let records = sqlx::query_as::<_, FileRecord>(
            "SELECT * FROM files WHERE batch_id = ?1 ORDER BY path",
        )
        .bind(batch_id)
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    pub async fn list_for_batch_with_status(
        &self,
        batch_id: i64,
        status: FileStatus,
    ) -> Result<Vec<FileRecord>> {
        let records = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT * FROM files
            WHERE batch_id = ?1 AND status = ?2
            ORDER BY path
            "#,
        )
        .bind(batch_id)
        .bind(status)
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    /// True when this digest already belongs to a kept file (UNIQUE or
    /// further along). NEW and ERROR rows do not count, and neither do
    /// other DUPLICATEs.
    pub async fn digest_known(&self, sha256: &str) -> Result<bool> {
        let known: i64 = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM files
                WHERE sha256 = ?1 AND status IN (?2, ?3, ?4, ?5, ?6)
            )
            "#,
        )
        .bind(sha256)
        .bind(FileStatus::Unique)
        .bind(FileStatus::Batched)
        .bind(FileStatus::Synced)
        .bind(FileStatus::Sorted)
        .bind(FileStatus::Archived)
        .fetch_one(self.pool())
        .await?;
        Ok(known != 0)
    }

    /// NEW -> UNIQUE with the computed digest. Returns false when the row
    /// was no longer NEW (another runner got there first).
    pub async fn mark_unique(&self, id: i64, sha256: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files SET sha256 = ?2, status = ?3, error = NULL
            WHERE id = ?1 AND status = ?4
            "#,
        )
        .bind(id)
        .bind(sha256)
        .bind(FileStatus::Unique)
        .bind(FileStatus::New)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// NEW -> DUPLICATE. The physical quarantine move, if any, is recorded
    /// separately via [`FileStore::update_path`].
    pub async fn mark_duplicate(&self, id: i64, sha256: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files SET sha256 = ?2, status = ?3, error = NULL
            WHERE id = ?1 AND status = ?4
            "#,
        )
        .bind(id)
        .bind(sha256)
        .bind(FileStatus::Duplicate)
        .bind(FileStatus::New)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// SYNCED -> SORTED with the final archive location.
    pub async fn mark_sorted(&self, id: i64, target_path: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files SET status = ?2, target_path = ?3, error = NULL
            WHERE id = ?1 AND status = ?4
            "#,
        )
        .bind(id)
        .bind(FileStatus::Sorted)
        .bind(target_path)
        .bind(FileStatus::Synced)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Staging failed before the file ever left with its batch: record the
    /// error and disown it so the batch's lifecycle is not held hostage by
    /// a file that is not in its directory.
    pub async fn release_with_error(&self, id: i64, message: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE files SET status = ?2, error = ?3, batch_id = NULL
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(FileStatus::Error)
        .bind(message)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn mark_error(&self, id: i64, message: &str) -> Result<()> {
        sqlx::query("UPDATE files SET status = ?2, error = ?3 WHERE id = ?1")
            .bind(id)
            .bind(FileStatus::Error)
            .bind(message)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Record a physical move (quarantine or staging).
    pub async fn update_path(&self, id: i64, path: &str) -> Result<()> {
        sqlx::query("UPDATE files SET path = ?2 WHERE id = ?1")
            .bind(id)
            .bind(path)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Cache an EXIF capture timestamp so later passes skip the read.
    pub async fn set_capture_time(
        &self,
        id: i64,
        capture_time: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query("UPDATE files SET capture_time = ?2 WHERE id = ?1")
            .bind(id)
            .bind(capture_time)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// ERROR members of a batch back to SYNCED ahead of a sort retry.
    pub async fn reset_errors_for_batch(&self, batch_id: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE files SET status = ?2, error = NULL
            WHERE batch_id = ?1 AND status = ?3
            "#,
        )
        .bind(batch_id)
        .bind(FileStatus::Synced)
        .bind(FileStatus::Error)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn status_counts(&self) -> Result<Vec<(FileStatus, i64)>> {
        let counts = sqlx::query_as::<_, (FileStatus, i64)>(
            "SELECT status, COUNT(*) FROM files GROUP BY status ORDER BY status",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(counts)
    }
}
