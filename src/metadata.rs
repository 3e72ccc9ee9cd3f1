//! Persistent per-knowledge-base table of file fingerprints.
//!
//! Each knowledge base owns its own database, so every query here is scoped
//! to one base by construction. The store assumes a single writer per file
//! path; the scheduler's one-item-per-file granularity provides that.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::FileRecord;

/// Fields written by an upsert. Timestamps are managed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileRecord {
    pub file_path: String,
    pub content_hash: String,
    pub size: i64,
    pub last_modified: i64,
    pub external_unique_id: String,
    pub loader_type: String,
}

pub struct MetadataStore {
    base_id: String,
    pool: SqlitePool,
}

const COLUMNS: &str = "file_path, content_hash, size, last_modified, external_unique_id, \
                       loader_type, created_at, updated_at";

fn record_from_row(row: &SqliteRow) -> FileRecord {
    FileRecord {
        file_path: row.get("file_path"),
        content_hash: row.get("content_hash"),
        size: row.get("size"),
        last_modified: row.get("last_modified"),
        external_unique_id: row.get("external_unique_id"),
        loader_type: row.get("loader_type"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

impl MetadataStore {
    pub fn new(base_id: &str, pool: SqlitePool) -> Self {
        Self {
            base_id: base_id.to_string(),
            pool,
        }
    }

    pub fn base_id(&self) -> &str {
        &self.base_id
    }

    /// Insert, or replace every data field of the record at the same path.
    pub async fn upsert(&self, record: &NewFileRecord) -> Result<(), sqlx::Error> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO file_records (file_path, content_hash, size, last_modified,
                                      external_unique_id, loader_type, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(file_path) DO UPDATE SET
                content_hash = excluded.content_hash,
                size = excluded.size,
                last_modified = excluded.last_modified,
                external_unique_id = excluded.external_unique_id,
                loader_type = excluded.loader_type
            "#,
        )
        .bind(&record.file_path)
        .bind(&record.content_hash)
        .bind(record.size)
        .bind(record.last_modified)
        .bind(&record.external_unique_id)
        .bind(&record.loader_type)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            base = %self.base_id,
            path = %record.file_path,
            unique_id = %record.external_unique_id,
            "file record upserted"
        );
        Ok(())
    }

    pub async fn get_by_path(&self, file_path: &str) -> Result<Option<FileRecord>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM file_records WHERE file_path = ?",
            COLUMNS
        ))
        .bind(file_path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(record_from_row))
    }

    pub async fn get_by_unique_id(
        &self,
        unique_id: &str,
    ) -> Result<Option<FileRecord>, sqlx::Error> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM file_records WHERE external_unique_id = ?",
            COLUMNS
        ))
        .bind(unique_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(record_from_row))
    }

    pub async fn delete_by_path(&self, file_path: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM file_records WHERE file_path = ?")
            .bind(file_path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_by_unique_id(&self, unique_id: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM file_records WHERE external_unique_id = ?")
            .bind(unique_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// All records whose path starts with `prefix` (a separator-terminated
    /// directory key, see [`crate::fingerprint::dir_prefix`]), by path.
    pub async fn list_under(&self, prefix: &str) -> Result<Vec<FileRecord>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM file_records WHERE substr(file_path, 1, ?) = ? ORDER BY file_path",
            COLUMNS
        ))
        .bind(prefix.chars().count() as i64)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    pub async fn delete_under(&self, prefix: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM file_records WHERE substr(file_path, 1, ?) = ?")
            .bind(prefix.chars().count() as i64)
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_all(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM file_records")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn list_all(&self) -> Result<Vec<FileRecord>, sqlx::Error> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM file_records ORDER BY file_path",
            COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(record_from_row).collect())
    }
}
