//! Relational record of which files are indexed and at which version.
//!
//! One row per file, keyed by the file store's id. The access consumer's
//! reconciliation sweep enumerates this table, so it is the source of truth
//! for "what the index should contain".

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db;
use crate::error::{SyncError, SyncResult};
use crate::migrate::migrate_metadata;
use crate::models::FileRecord;

#[derive(Clone)]
pub struct MetadataStore {
    pool: SqlitePool,
}

type FileRow = (String, String, Option<String>, Option<String>, i64);

impl MetadataStore {
    /// Connects and ensures the `files` table exists.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = db::connect(url).await?;
        migrate_metadata(&pool).await?;
        Ok(Self { pool })
    }

    /// Creates or replaces the record for `file_id`, stamping the current time.
    ///
    /// A `None` owner keeps the owner already on record. Each call is its
    /// own transaction, so a concurrent reader sees either the old row or
    /// the new one.
    pub async fn upsert(
        &self,
        file_id: &str,
        path: &str,
        fingerprint: Option<&str>,
        owner: Option<&str>,
    ) -> SyncResult<FileRecord> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(SyncError::store)?;

        sqlx::query(
            r#"
            INSERT INTO files (file_id, path, etag, owner, last_indexed)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(file_id) DO UPDATE SET
                path = excluded.path,
                etag = excluded.etag,
                owner = COALESCE(excluded.owner, files.owner),
                last_indexed = excluded.last_indexed
            "#,
        )
        .bind(file_id)
        .bind(path)
        .bind(fingerprint)
        .bind(owner)
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await
        .map_err(SyncError::store)?;

        let row: FileRow = sqlx::query_as(
            "SELECT file_id, path, etag, owner, last_indexed FROM files WHERE file_id = ?",
        )
        .bind(file_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(SyncError::store)?;

        tx.commit().await.map_err(SyncError::store)?;
        Ok(into_record(row))
    }

    pub async fn get(&self, file_id: &str) -> SyncResult<Option<FileRecord>> {
        let row: Option<FileRow> =
            sqlx::query_as("SELECT file_id, path, etag, owner, last_indexed FROM files WHERE file_id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(SyncError::store)?;
        Ok(row.map(into_record))
    }

    /// Every record, ordered by `file_id` so sweeps are deterministic.
    pub async fn list_all(&self) -> SyncResult<Vec<FileRecord>> {
        let rows: Vec<FileRow> =
            sqlx::query_as("SELECT file_id, path, etag, owner, last_indexed FROM files ORDER BY file_id")
                .fetch_all(&self.pool)
                .await
                .map_err(SyncError::store)?;
        Ok(rows.into_iter().map(into_record).collect())
    }

    /// Removes the record. Returns whether one existed.
    pub async fn mark_deleted(&self, file_id: &str) -> SyncResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE file_id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await
            .map_err(SyncError::store)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> SyncResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await
            .map_err(SyncError::store)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn into_record((file_id, path, etag, owner, last_indexed): FileRow) -> FileRecord {
    FileRecord {
        file_id,
        path,
        content_fingerprint: etag,
        owner,
        last_indexed_at: from_millis(last_indexed),
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
