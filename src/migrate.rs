//! Idempotent schema creation for a knowledge base database.
//!
//! Two groups of tables share the file: `file_records` belongs to the
//! [`MetadataStore`](crate::metadata::MetadataStore); `loaders`, `chunks` and
//! `chunks_fts` belong to the local index backend.

use anyhow::Result;
use sqlx::SqlitePool;

/// Current time in ms since the epoch, as SQLite computes it.
const NOW_MS_SQL: &str = "CAST((julianday('now') - 2440587.5) * 86400000 AS INTEGER)";

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    create_metadata_schema(pool).await?;
    create_index_schema(pool).await?;
    Ok(())
}

pub async fn create_metadata_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS file_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT NOT NULL UNIQUE,
            content_hash TEXT NOT NULL,
            size INTEGER NOT NULL,
            last_modified INTEGER NOT NULL,
            external_unique_id TEXT NOT NULL UNIQUE,
            loader_type TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Recursive triggers are off by default, so the inner UPDATE does not re-fire.
    sqlx::query(&format!(
        r#"
        CREATE TRIGGER IF NOT EXISTS file_records_touch_updated_at
        AFTER UPDATE ON file_records
        FOR EACH ROW
        BEGIN
            UPDATE file_records SET updated_at = {} WHERE id = NEW.id;
        END
        "#,
        NOW_MS_SQL
    ))
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_index_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS loaders (
            unique_id TEXT PRIMARY KEY,
            loader_type TEXT NOT NULL,
            source TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            unique_id TEXT NOT NULL,
            source TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL,
            FOREIGN KEY (unique_id) REFERENCES loaders(unique_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                unique_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_unique_id ON chunks(unique_id)")
        .execute(pool)
        .await?;

    Ok(())
}
