//! The command surface over knowledge bases.
//!
//! [`KnowledgeService`] owns one shared [`ProcessingScheduler`] and lazily
//! opens a handle per knowledge base: its SQLite pool, metadata store,
//! index backend, pipeline and task factory. All add calls from every base
//! compete for the same scheduler capacity.
//!
//! Storage layout under `[storage].root`:
//!
//! ```text
//! <root>/<base_id>/base.json       KnowledgeBaseParams
//! <root>/<base_id>/index.sqlite    file_records + backend tables
//! ```

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::backend::local::LocalBackendProvider;
use crate::backend::{BackendProvider, SearchHit};
use crate::config::Config;
use crate::db;
use crate::fingerprint::dir_prefix;
use crate::metadata::MetadataStore;
use crate::migrate::run_migrations;
use crate::models::{FileRecord, KnowledgeBaseParams, KnowledgeItem, LoaderReturn};
use crate::pipeline::IngestionPipeline;
use crate::progress::{IngestProgressReporter, NoProgress};
use crate::scheduler::{ProcessingScheduler, SchedulerLimits};
use crate::search::rerank;
use crate::sync::IncrementalSyncEngine;
use crate::tasks::{SourceTaskFactory, WorkloadEstimates};

const PARAMS_FILE: &str = "base.json";

/// Flags of one `add` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddOptions {
    /// Re-index even when the stored fingerprint matches.
    pub force_reload: bool,
    /// Consult and maintain file fingerprints.
    pub incremental_update: bool,
}

impl Default for AddOptions {
    fn default() -> Self {
        Self {
            force_reload: false,
            incremental_update: true,
        }
    }
}

struct BaseHandle {
    params: KnowledgeBaseParams,
    pool: SqlitePool,
    pipeline: Arc<IngestionPipeline>,
    factory: SourceTaskFactory,
}

pub struct KnowledgeService {
    config: Config,
    provider: Arc<dyn BackendProvider>,
    scheduler: ProcessingScheduler,
    progress: Arc<dyn IngestProgressReporter>,
    bases: RwLock<HashMap<String, Arc<BaseHandle>>>,
}

/// Base ids name a directory, so only `[A-Za-z0-9_-]` is allowed.
pub fn validate_base_id(id: &str) -> Result<()> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        bail!(
            "Invalid knowledge base id '{}': use letters, digits, '-' and '_' only",
            id
        );
    }
    Ok(())
}

impl KnowledgeService {
    /// Service backed by the local SQLite/FTS5 index. Must be called inside
    /// a tokio runtime.
    pub fn new(config: Config) -> Self {
        let provider = Arc::new(LocalBackendProvider::new(config.fetch.clone()));
        Self::with_provider(config, provider)
    }

    pub fn with_provider(config: Config, provider: Arc<dyn BackendProvider>) -> Self {
        let scheduler = ProcessingScheduler::start(SchedulerLimits::from(&config.scheduler));
        Self {
            config,
            provider,
            scheduler,
            progress: Arc::new(NoProgress),
            bases: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn IngestProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scheduler(&self) -> &ProcessingScheduler {
        &self.scheduler
    }

    fn base_dir(&self, base_id: &str) -> PathBuf {
        self.config.storage.root.join(base_id)
    }

    /// Provision storage for a base. Creating an existing base keeps its
    /// stored parameters and returns them.
    pub async fn create(&self, params: KnowledgeBaseParams) -> Result<KnowledgeBaseParams> {
        validate_base_id(&params.id)?;
        if params.chunk_size == 0 || params.chunk_overlap >= params.chunk_size {
            bail!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                params.chunk_overlap,
                params.chunk_size
            );
        }

        let dir = self.base_dir(&params.id);
        let params_path = dir.join(PARAMS_FILE);
        if params_path.exists() {
            tracing::info!(base = %params.id, "knowledge base already exists");
            let existing = read_params(&params_path)?;
            self.open(&existing.id).await?;
            return Ok(existing);
        }

        let pool = db::connect(&dir).await?;
        run_migrations(&pool).await?;
        pool.close().await;
        std::fs::write(&params_path, serde_json::to_string_pretty(&params)?)
            .with_context(|| format!("Failed to write {}", params_path.display()))?;

        tracing::info!(base = %params.id, path = %dir.display(), "knowledge base created");
        Ok(params)
    }

    /// Parameters of a base, opening it if needed.
    pub async fn params(&self, base_id: &str) -> Result<KnowledgeBaseParams> {
        Ok(self.open(base_id).await?.params.clone())
    }

    async fn open(&self, base_id: &str) -> Result<Arc<BaseHandle>> {
        validate_base_id(base_id)?;
        if let Some(handle) = self.bases.read().await.get(base_id) {
            return Ok(handle.clone());
        }

        let mut bases = self.bases.write().await;
        if let Some(handle) = bases.get(base_id) {
            return Ok(handle.clone());
        }

        let dir = self.base_dir(base_id);
        let params_path = dir.join(PARAMS_FILE);
        if !params_path.exists() {
            bail!(
                "Unknown knowledge base '{}'. Create it with `kb create {}`",
                base_id,
                base_id
            );
        }
        let params = read_params(&params_path)?;

        let pool = db::connect(&dir).await?;
        run_migrations(&pool).await?;

        let metadata = Arc::new(MetadataStore::new(base_id, pool.clone()));
        let backend = self.provider.open(&params, &pool)?;
        let pipeline = Arc::new(IngestionPipeline::new(
            metadata.clone(),
            backend,
            self.config.sync.change_detection,
        ));
        let sync = Arc::new(IncrementalSyncEngine::new(
            metadata,
            self.config.sync.clone(),
        ));
        let factory = SourceTaskFactory::new(
            pipeline.clone(),
            sync,
            WorkloadEstimates::from(&self.config.scheduler),
            self.progress.clone(),
        );

        let handle = Arc::new(BaseHandle {
            params,
            pool,
            pipeline,
            factory,
        });
        bases.insert(base_id.to_string(), handle.clone());
        tracing::debug!(base = %base_id, "knowledge base opened");
        Ok(handle)
    }

    /// Ingest one item and wait for its aggregate result.
    ///
    /// Failures inside the work become the error sentinel in the returned
    /// value; only an unknown base or a stopped scheduler is an `Err`.
    pub async fn add(&self, item: &KnowledgeItem, options: AddOptions) -> Result<LoaderReturn> {
        let handle = self.open(&item.base_id).await?;
        let task = match handle
            .factory
            .build(item, options.force_reload, options.incremental_update)
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => return Ok(LoaderReturn::noop()),
            Err(e) => {
                tracing::error!(
                    base = %item.base_id,
                    item = %item.id,
                    kind = e.kind(),
                    error = %e,
                    "task could not be planned"
                );
                return Ok(LoaderReturn::error(e.to_string()));
            }
        };

        let result = self.scheduler.submit(task).await?;
        tracing::info!(
            base = %item.base_id,
            item = %item.id,
            entries = result.entries_added,
            loader_type = %result.loader_type,
            "item added"
        );
        Ok(result)
    }

    /// Delete artifacts and their file records. `unique_id` and every id in
    /// `unique_ids` are removed; duplicates and empty ids are ignored.
    ///
    /// A `directory:` id resolves through the directory's file records, so
    /// for a directory added with `incremental_update = false` it removes
    /// nothing; remove that directory's per-file ids instead.
    pub async fn remove(&self, base_id: &str, unique_id: &str, unique_ids: &[String]) -> Result<()> {
        let handle = self.open(base_id).await?;

        let mut ids: Vec<&str> = Vec::with_capacity(unique_ids.len() + 1);
        for id in std::iter::once(unique_id).chain(unique_ids.iter().map(String::as_str)) {
            if !id.is_empty() && !ids.contains(&id) {
                ids.push(id);
            }
        }

        for id in ids {
            let removed = handle
                .pipeline
                .remove_artifact(id)
                .await
                .with_context(|| format!("Failed to remove '{}'", id))?;
            tracing::debug!(base = %base_id, unique_id = %id, removed, "artifact removed");
        }
        Ok(())
    }

    /// Clear all indexed content of a base. File records go too, so the
    /// next incremental add re-indexes everything.
    pub async fn reset(&self, base_id: &str) -> Result<()> {
        let handle = self.open(base_id).await?;
        handle.pipeline.backend().reset().await?;
        let cleared = handle.pipeline.metadata().delete_all().await?;
        tracing::info!(base = %base_id, cleared, "knowledge base reset");
        Ok(())
    }

    /// Remove a base's whole storage directory. Deleting a base that does
    /// not exist is not an error.
    pub async fn delete(&self, base_id: &str) -> Result<()> {
        validate_base_id(base_id)?;
        if let Some(handle) = self.bases.write().await.remove(base_id) {
            handle.pool.close().await;
        }

        let dir = self.base_dir(base_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(base = %base_id, "knowledge base deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", dir.display())),
        }
    }

    pub async fn search(&self, base_id: &str, query: &str, limit: Option<i64>) -> Result<Vec<SearchHit>> {
        let handle = self.open(base_id).await?;
        let limit = limit.unwrap_or(self.config.search.limit).max(1);
        handle.pipeline.backend().search(query, limit).await
    }

    pub async fn rerank(
        &self,
        base_id: &str,
        query: &str,
        results: Vec<SearchHit>,
    ) -> Result<Vec<SearchHit>> {
        self.open(base_id).await?;
        Ok(rerank(query, results))
    }

    /// File records of a base, optionally only those under `under`.
    pub async fn files(&self, base_id: &str, under: Option<&Path>) -> Result<Vec<FileRecord>> {
        let handle = self.open(base_id).await?;
        let metadata = handle.pipeline.metadata();
        match under {
            Some(dir) => {
                let dir = tokio::fs::canonicalize(dir)
                    .await
                    .unwrap_or_else(|_| dir.to_path_buf());
                Ok(metadata.list_under(&dir_prefix(&dir)).await?)
            }
            None => Ok(metadata.list_all().await?),
        }
    }
}

fn read_params(path: &Path) -> Result<KnowledgeBaseParams> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmbeddingSettings, ItemKind};
    use tempfile::TempDir;

    fn params(id: &str) -> KnowledgeBaseParams {
        KnowledgeBaseParams {
            id: id.to_string(),
            embedding: EmbeddingSettings::default(),
            chunk_size: 500,
            chunk_overlap: 50,
        }
    }

    #[test]
    fn base_ids_are_restricted() {
        assert!(validate_base_id("team-notes_2").is_ok());
        assert!(validate_base_id("").is_err());
        assert!(validate_base_id("../etc").is_err());
        assert!(validate_base_id("a b").is_err());
    }

    #[tokio::test]
    async fn create_is_idempotent_and_persists_params() {
        let tmp = TempDir::new().unwrap();
        let service = KnowledgeService::new(Config::with_root(tmp.path()));

        let created = service.create(params("kb1")).await.unwrap();
        assert_eq!(created.chunk_size, 500);
        assert!(tmp.path().join("kb1").join(PARAMS_FILE).exists());
        assert!(tmp.path().join("kb1").join(db::DB_FILE).exists());

        let mut other = params("kb1");
        other.chunk_size = 900;
        let again = service.create(other).await.unwrap();
        assert_eq!(again.chunk_size, 500);
    }

    #[tokio::test]
    async fn unknown_base_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let service = KnowledgeService::new(Config::with_root(tmp.path()));
        let item = KnowledgeItem::new("missing", ItemKind::Note, "hello");
        let err = service.add(&item, AddOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("Unknown knowledge base"));
    }

    #[tokio::test]
    async fn note_search_reset_and_delete() {
        let tmp = TempDir::new().unwrap();
        let service = KnowledgeService::new(Config::with_root(tmp.path()));
        service.create(params("kb")).await.unwrap();

        let item = KnowledgeItem::new("kb", ItemKind::Note, "The quarterly deploy checklist");
        let added = service.add(&item, AddOptions::default()).await.unwrap();
        assert_eq!(added.entries_added, 1);
        assert_eq!(added.loader_type, "note");

        let hits = service.search("kb", "deploy", None).await.unwrap();
        assert_eq!(hits.len(), 1);
        let reranked = service.rerank("kb", "deploy", hits).await.unwrap();
        assert_eq!(reranked.len(), 1);

        service.reset("kb").await.unwrap();
        assert!(service.search("kb", "deploy", None).await.unwrap().is_empty());

        service.delete("kb").await.unwrap();
        assert!(!tmp.path().join("kb").exists());
        service.delete("kb").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_kind_is_noop() {
        let tmp = TempDir::new().unwrap();
        let service = KnowledgeService::new(Config::with_root(tmp.path()));
        service.create(params("kb")).await.unwrap();
        let item = KnowledgeItem::new("kb", ItemKind::Unknown, "whatever");
        let result = service.add(&item, AddOptions::default()).await.unwrap();
        assert_eq!(result.loader_type, LoaderReturn::NOOP);
    }
}
