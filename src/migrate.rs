//! Idempotent schema setup for the metadata store and the work queue.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Creates every table used by the pipeline. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let metadata = db::connect(&config.metadata.url).await?;
    migrate_metadata(&metadata).await?;
    metadata.close().await;

    let queue = db::connect(&config.queue.url).await?;
    migrate_queue(&queue).await?;
    queue.close().await;

    Ok(())
}

pub async fn migrate_metadata(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            file_id TEXT PRIMARY KEY,
            path TEXT NOT NULL,
            etag TEXT,
            owner TEXT,
            last_indexed INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_path ON files(path)")
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn migrate_queue(pool: &SqlitePool) -> Result<()> {
    // Timestamps are Unix milliseconds.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_entries (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            source TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            available_at INTEGER NOT NULL,
            leased_until INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_queue_ready ON queue_entries(queue, status, available_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
