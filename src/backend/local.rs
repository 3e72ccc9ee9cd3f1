//! SQLite-backed [`IndexBackend`] with FTS5 keyword search.
//!
//! Each loaded source becomes a row in `loaders` plus its chunks in `chunks`
//! and `chunks_fts`. The artifact id is derived from the loader type, the
//! source and the loaded content, so re-adding identical content is a no-op
//! while edited content gets a fresh id.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

use super::{AddedLoader, BackendProvider, IndexBackend, LoaderSource, SearchHit};
use crate::chunk::chunk_text;
use crate::config::FetchConfig;
use crate::loaders::{LoadedDocument, SourceLoader};
use crate::models::KnowledgeBaseParams;

pub struct LocalBackend {
    pool: SqlitePool,
    loader: SourceLoader,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl LocalBackend {
    pub fn new(pool: SqlitePool, loader: SourceLoader, chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            pool,
            loader,
            chunk_size,
            chunk_overlap,
        }
    }

    async fn exists(&self, unique_id: &str) -> Result<bool> {
        let found: Option<String> =
            sqlx::query_scalar("SELECT unique_id FROM loaders WHERE unique_id = ?")
                .bind(unique_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }
}

/// `<loader_type>_<24 hex chars>` over type, source and every document.
pub fn artifact_id(source: &LoaderSource, docs: &[LoadedDocument]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.loader_type().as_bytes());
    hasher.update([0]);
    hasher.update(source.describe().as_bytes());
    for doc in docs {
        hasher.update([0]);
        hasher.update(doc.source.as_bytes());
        hasher.update([0]);
        hasher.update(doc.text.as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}_{}", source.loader_type(), &digest[..24])
}

/// Quote every term so user punctuation never reaches FTS5 syntax.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[async_trait]
impl IndexBackend for LocalBackend {
    async fn add_loader(&self, source: &LoaderSource, force_reload: bool) -> Result<AddedLoader> {
        let docs = self.loader.load(source).await?;
        let unique_id = artifact_id(source, &docs);
        let loader_type = source.loader_type().to_string();

        if self.exists(&unique_id).await? {
            if !force_reload {
                tracing::debug!(unique_id = %unique_id, "loader already indexed");
                return Ok(AddedLoader {
                    entries_added: 0,
                    unique_id,
                    loader_type,
                });
            }
            self.delete_loader(&unique_id).await?;
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO loaders (unique_id, loader_type, source, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&unique_id)
        .bind(&loader_type)
        .bind(source.describe())
        .bind(chrono::Utc::now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        let mut entries_added = 0usize;
        for (doc_index, doc) in docs.iter().enumerate() {
            let doc_key = format!("{}#{}", unique_id, doc_index);
            for chunk in chunk_text(&doc_key, &doc.text, self.chunk_size, self.chunk_overlap) {
                sqlx::query(
                    "INSERT INTO chunks (id, unique_id, source, chunk_index, text) VALUES (?, ?, ?, ?, ?)",
                )
                .bind(&chunk.id)
                .bind(&unique_id)
                .bind(&doc.source)
                .bind(chunk.index)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;

                sqlx::query("INSERT INTO chunks_fts (chunk_id, unique_id, text) VALUES (?, ?, ?)")
                    .bind(&chunk.id)
                    .bind(&unique_id)
                    .bind(&chunk.text)
                    .execute(&mut *tx)
                    .await?;
                entries_added += 1;
            }
        }
        tx.commit().await?;

        tracing::debug!(unique_id = %unique_id, entries = entries_added, "loader indexed");
        Ok(AddedLoader {
            entries_added,
            unique_id,
            loader_type,
        })
    }

    async fn delete_loader(&self, unique_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts WHERE unique_id = ?")
            .bind(unique_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE unique_id = ?")
            .bind(unique_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM loaders WHERE unique_id = ?")
            .bind(unique_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM loaders").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn search(&self, query: &str, limit: i64) -> Result<Vec<SearchHit>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query(
            r#"
            SELECT c.unique_id, c.source, c.chunk_index, c.text, chunks_fts.rank AS rank
            FROM chunks_fts
            JOIN chunks c ON c.id = chunks_fts.chunk_id
            WHERE chunks_fts MATCH ?
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&fts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                SearchHit {
                    unique_id: row.get("unique_id"),
                    source: row.get("source"),
                    chunk_index: row.get("chunk_index"),
                    text: row.get("text"),
                    score: -rank, // bm25 rank is lower-is-better
                }
            })
            .collect())
    }
}

/// Opens a [`LocalBackend`] on each knowledge base's own database.
pub struct LocalBackendProvider {
    fetch: FetchConfig,
}

impl LocalBackendProvider {
    pub fn new(fetch: FetchConfig) -> Self {
        Self { fetch }
    }
}

impl BackendProvider for LocalBackendProvider {
    fn open(&self, base: &KnowledgeBaseParams, pool: &SqlitePool) -> Result<Arc<dyn IndexBackend>> {
        let loader = SourceLoader::new(&self.fetch)?;
        Ok(Arc::new(LocalBackend::new(
            pool.clone(),
            loader,
            base.chunk_size,
            base.chunk_overlap,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn backend(tmp: &TempDir) -> LocalBackend {
        let pool = crate::db::connect(tmp.path()).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let loader = SourceLoader::new(&FetchConfig::default()).unwrap();
        LocalBackend::new(pool, loader, 200, 20)
    }

    fn note(text: &str) -> LoaderSource {
        LoaderSource::Note {
            text: text.to_string(),
            source: Some("notes".to_string()),
        }
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(fts_query("  "), None);
        assert_eq!(
            fts_query("deploy \"k8s\" NEAR(x)").as_deref(),
            Some("\"deploy\" OR \"k8s\" OR \"NEAR(x)\"")
        );
    }

    #[tokio::test]
    async fn add_is_idempotent_unless_forced() {
        let tmp = TempDir::new().unwrap();
        let backend = backend(&tmp).await;

        let first = backend.add_loader(&note("kubernetes rollout notes"), false).await.unwrap();
        assert_eq!(first.entries_added, 1);
        assert!(first.unique_id.starts_with("note_"));

        let again = backend.add_loader(&note("kubernetes rollout notes"), false).await.unwrap();
        assert_eq!(again.entries_added, 0);
        assert_eq!(again.unique_id, first.unique_id);

        let forced = backend.add_loader(&note("kubernetes rollout notes"), true).await.unwrap();
        assert_eq!(forced.entries_added, 1);

        let hits = backend.search("kubernetes", 10).await.unwrap();
        assert_eq!(hits.len(), 1, "forced reload replaces, never duplicates");
    }

    #[tokio::test]
    async fn changed_content_gets_new_id() {
        let tmp = TempDir::new().unwrap();
        let backend = backend(&tmp).await;
        let a = backend.add_loader(&note("version one"), false).await.unwrap();
        let b = backend.add_loader(&note("version two"), false).await.unwrap();
        assert_ne!(a.unique_id, b.unique_id);
    }

    #[tokio::test]
    async fn delete_and_reset_remove_content() {
        let tmp = TempDir::new().unwrap();
        let backend = backend(&tmp).await;

        let a = backend.add_loader(&note("alpha topic"), false).await.unwrap();
        backend.add_loader(&note("beta topic"), false).await.unwrap();
        assert_eq!(backend.search("topic", 10).await.unwrap().len(), 2);

        backend.delete_loader(&a.unique_id).await.unwrap();
        let hits = backend.search("topic", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("beta"));

        backend.delete_loader("missing_id").await.unwrap();

        backend.reset().await.unwrap();
        assert!(backend.search("topic", 10).await.unwrap().is_empty());
    }
}
