use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

use crate::catalog::{BatchStatus, FileStatus};
use crate::error::Result;

/// One row of the `batches` table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BatchRecord {
    pub id: i64,
    pub name: String,
    pub size_bytes: i64,
    pub file_count: i64,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub sorted_at: Option<DateTime<Utc>>,
    pub manifest_path: Option<String>,
    pub sync_progress: f64,
    pub last_error: Option<String>,
}

/// Candidate file offered to [`BatchStore::create_with_members`].
#[derive(Debug, Clone, Copy)]
pub struct BatchMember {
    pub file_id: i64,
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct BatchStore {
    pool: SqlitePool,
}

impl BatchStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert an IN_PROGRESS batch row and claim its members in one
    /// transaction. Each claim is a guarded UPDATE from UNIQUE with no
    /// owner, so a file grabbed by a parallel runner is silently dropped
    /// rather than double-batched. Returns `None` (nothing inserted) when
    /// every claim loses.
    pub async fn create_with_members(
        &self,
        name: &str,
        members: &[BatchMember],
    ) -> Result<Option<(BatchRecord, Vec<i64>)>> {
        let mut tx = self.pool.begin().await?;

        let batch = sqlx::query_as::<_, BatchRecord>(
            r#"
            INSERT INTO batches (name, status, created_at)
            VALUES (?1, ?2, ?3)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(BatchStatus::InProgress)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        let mut winners = Vec::with_capacity(members.len());
        let mut claimed_bytes: i64 = 0;
        for member in members {
            let result = sqlx::query(
                r#"
                UPDATE files SET status = ?3, batch_id = ?2
                WHERE id = ?1 AND status = ?4 AND batch_id IS NULL
                "#,
            )
            .bind(member.file_id)
            .bind(batch.id)
            .bind(FileStatus::Batched)
            .bind(FileStatus::Unique)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 1 {
                winners.push(member.file_id);
                claimed_bytes += member.size;
            }
        }

        if winners.is_empty() {
            tx.rollback().await?;
            return Ok(None);
        }

        let batch = sqlx::query_as::<_, BatchRecord>(
            r#"
            UPDATE batches SET size_bytes = ?2, file_count = ?3
            WHERE id = ?1
            RETURNING *
            "#,
        )
        .bind(batch.id)
        .bind(claimed_bytes)
        .bind(winners.len() as i64)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some((batch, winners)))
    }

    /// IN_PROGRESS -> PENDING once staging and the manifest are on disk.
    /// Totals are re-stamped because staging may have shed members.
    pub async fn finalize_pending(
        &self,
        id: i64,
        size_bytes: i64,
        file_count: i64,
        manifest_path: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batches SET
                status = ?2,
                size_bytes = ?3,
                file_count = ?4,
                manifest_path = ?5
            WHERE id = ?1 AND status = ?6
            "#,
        )
        .bind(id)
        .bind(BatchStatus::Pending)
        .bind(size_bytes)
        .bind(file_count)
        .bind(manifest_path)
        .bind(BatchStatus::InProgress)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn get(&self, id: i64) -> Result<Option<BatchRecord>> {
        let record = sqlx::query_as::<_, BatchRecord>(
            "SELECT * FROM batches WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(record)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<BatchRecord>> {
        let record = sqlx::query_as::<_, BatchRecord>(
            "SELECT * FROM batches WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(self.pool())
        .await?;
        Ok(record)
    }

    pub async fn name_exists(&self, name: &str) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM batches WHERE name = ?1)",
        )
        .bind(name)
        .fetch_one(self.pool())
        .await?;
        Ok(exists != 0)
    }

    pub async fn list(&self) -> Result<Vec<BatchRecord>> {
        let records = sqlx::query_as::<_, BatchRecord>(
            "SELECT * FROM batches ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    pub async fn list_with_status(
        &self,
        status: BatchStatus,
    ) -> Result<Vec<BatchRecord>> {
        let records = sqlx::query_as::<_, BatchRecord>(
            "SELECT * FROM batches WHERE status = ?1 ORDER BY id",
        )
        .bind(status)
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    /// Newest batches first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<BatchRecord>> {
        let records = sqlx::query_as::<_, BatchRecord>(
            "SELECT * FROM batches ORDER BY id DESC LIMIT ?1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(records)
    }

    /// Oldest batch that has not reached SORTED, i.e. the sequential
    /// guard's blocker.
    pub async fn first_unfinished(&self) -> Result<Option<BatchRecord>> {
        let record = sqlx::query_as::<_, BatchRecord>(
            "SELECT * FROM batches WHERE status != ?1 ORDER BY id LIMIT 1",
        )
        .bind(BatchStatus::Sorted)
        .fetch_optional(self.pool())
        .await?;
        Ok(record)
    }

    /// PENDING -> SYNCING.
    pub async fn begin_sync(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batches SET status = ?2, last_error = NULL
            WHERE id = ?1 AND status = ?3
            "#,
        )
        .bind(id)
        .bind(BatchStatus::Syncing)
        .bind(BatchStatus::Pending)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Cache the last observed completion percentage while SYNCING. A
    /// successful observation also clears any error a previous poll left.
    pub async fn record_progress(&self, id: i64, percent: f64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE batches SET sync_progress = ?2, last_error = NULL
            WHERE id = ?1 AND status = ?3
            "#,
        )
        .bind(id)
        .bind(percent)
        .bind(BatchStatus::Syncing)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Surface a poll failure without leaving SYNCING; the next poll or a
    /// manual refresh can still succeed.
    pub async fn record_sync_error(&self, id: i64, message: &str) -> Result<()> {
        sqlx::query("UPDATE batches SET last_error = ?2 WHERE id = ?1")
            .bind(id)
            .bind(message)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// SYNCING -> SYNCED plus the member fan-out (BATCHED -> SYNCED), as
    /// one transaction. SYNCED is terminal for polling: once this commits
    /// no later observation can regress the batch.
    pub async fn mark_synced(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE batches SET
                status = ?2,
                synced_at = ?3,
                sync_progress = 100.0,
                last_error = NULL
            WHERE id = ?1 AND status = ?4
            "#,
        )
        .bind(id)
        .bind(BatchStatus::Synced)
        .bind(Utc::now())
        .bind(BatchStatus::Syncing)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE files SET status = ?2
            WHERE batch_id = ?1 AND status = ?3
            "#,
        )
        .bind(id)
        .bind(FileStatus::Synced)
        .bind(FileStatus::Batched)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// SYNCED -> SORTING.
    pub async fn begin_sort(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE batches SET status = ?2 WHERE id = ?1 AND status = ?3",
        )
        .bind(id)
        .bind(BatchStatus::Sorting)
        .bind(BatchStatus::Synced)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// SORTING -> SORTED once every member is archived.
    pub async fn mark_sorted(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batches SET status = ?2, sorted_at = ?3, last_error = NULL
            WHERE id = ?1 AND status = ?4
            "#,
        )
        .bind(id)
        .bind(BatchStatus::Sorted)
        .bind(Utc::now())
        .bind(BatchStatus::Sorting)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_error(&self, id: i64, message: &str) -> Result<()> {
        sqlx::query("UPDATE batches SET status = ?2, last_error = ?3 WHERE id = ?1")
            .bind(id)
            .bind(BatchStatus::Error)
            .bind(message)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// ERROR -> PENDING for a sync-phase retry.
    pub async fn reset_to_pending(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batches SET
                status = ?2,
                last_error = NULL,
                sync_progress = 0,
                synced_at = NULL
            WHERE id = ?1 AND status = ?3
            "#,
        )
        .bind(id)
        .bind(BatchStatus::Pending)
        .bind(BatchStatus::Error)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// ERROR -> SYNCED for a sort-phase retry.
    pub async fn reset_to_synced(&self, id: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batches SET status = ?2, last_error = NULL
            WHERE id = ?1 AND status = ?3
            "#,
        )
        .bind(id)
        .bind(BatchStatus::Synced)
        .bind(BatchStatus::Error)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn status_counts(&self) -> Result<Vec<(BatchStatus, i64)>> {
        let counts = sqlx::query_as::<_, (BatchStatus, i64)>(
            "SELECT status, COUNT(*) FROM batches GROUP BY status ORDER BY status",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(counts)
    }
}
