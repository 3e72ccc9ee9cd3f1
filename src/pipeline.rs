//! Per-item units of work.
//!
//! Every task item runs one of these operations inside [`guarded`], which
//! is the failure boundary between an item and the scheduler: errors are
//! logged and become the error sentinel, never a propagated `Err`.
//!
//! Ordering inside a re-index is fixed: the old artifact is deleted from the
//! backend, then its record, and only then is the replacement added. A crash
//! between steps can leave a file un-indexed but never leaves an orphaned
//! artifact that no record points at.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use crate::backend::{IndexBackend, LoaderSource};
use crate::config::ChangeDetection;
use crate::error::IngestError;
use crate::fingerprint::{dir_prefix, fingerprint_file, path_key, FileFingerprint};
use crate::metadata::{MetadataStore, NewFileRecord};
use crate::models::{FileRecord, LoaderReturn};
use crate::sync::{classify, FileChange};

/// Prefix of the aggregate id a directory task resolves to.
pub const DIRECTORY_ID_PREFIX: &str = "directory:";

pub fn directory_unique_id(dir_key: &str) -> String {
    format!("{}{}", DIRECTORY_ID_PREFIX, dir_key)
}

pub struct IngestionPipeline {
    metadata: Arc<MetadataStore>,
    backend: Arc<dyn IndexBackend>,
    policy: ChangeDetection,
}

impl IngestionPipeline {
    pub fn new(
        metadata: Arc<MetadataStore>,
        backend: Arc<dyn IndexBackend>,
        policy: ChangeDetection,
    ) -> Self {
        Self {
            metadata,
            backend,
            policy,
        }
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn backend(&self) -> &Arc<dyn IndexBackend> {
        &self.backend
    }

    /// Hand a source straight to the backend. No metadata is read or written.
    pub async fn index_source(
        &self,
        source: &LoaderSource,
        force_reload: bool,
    ) -> Result<LoaderReturn, IngestError> {
        let added = self
            .backend
            .add_loader(source, force_reload)
            .await
            .map_err(IngestError::Backend)?;
        Ok(LoaderReturn::indexed(
            added.entries_added,
            added.unique_id,
            added.loader_type,
        ))
    }

    /// Index a file with no prior record and record its fingerprint.
    pub async fn index_new(
        &self,
        fp: &FileFingerprint,
        force_reload: bool,
    ) -> Result<LoaderReturn, IngestError> {
        let result = self
            .index_source(&LoaderSource::File(fp.path.clone()), force_reload)
            .await?;

        self.metadata
            .upsert(&NewFileRecord {
                file_path: fp.key.clone(),
                content_hash: fp.content_hash.clone(),
                size: fp.size as i64,
                last_modified: fp.modified_ms,
                external_unique_id: result.unique_id.clone(),
                loader_type: result.loader_type.clone(),
            })
            .await?;
        Ok(result)
    }

    /// Replace the artifact of a changed file.
    pub async fn reindex(
        &self,
        fp: &FileFingerprint,
        previous: &FileRecord,
        force_reload: bool,
    ) -> Result<LoaderReturn, IngestError> {
        self.backend
            .delete_loader(&previous.external_unique_id)
            .await
            .map_err(IngestError::Backend)?;
        self.metadata.delete_by_path(&previous.file_path).await?;
        self.index_new(fp, force_reload).await
    }

    /// Single-file item. With `incremental` the stored record decides
    /// whether the backend is called at all.
    pub async fn index_file(
        &self,
        path: &Path,
        force_reload: bool,
        incremental: bool,
    ) -> Result<LoaderReturn, IngestError> {
        let path = tokio::fs::canonicalize(path)
            .await
            .map_err(|e| IngestError::io(path, e))?;
        if !incremental {
            return self
                .index_source(&LoaderSource::File(path), force_reload)
                .await;
        }

        let fp = fingerprint_file(&path).await?;
        let previous = self.metadata.get_by_path(&fp.key).await?;
        match classify(&fp, previous, force_reload, self.policy) {
            FileChange::New => self.index_new(&fp, force_reload).await,
            FileChange::Changed(record) => self.reindex(&fp, &record, force_reload).await,
            FileChange::Unchanged(record) => {
                tracing::debug!(path = %fp.key, "unchanged, skipped");
                Ok(LoaderReturn::indexed(
                    0,
                    record.external_unique_id,
                    record.loader_type,
                ))
            }
        }
    }

    /// Deletion scan: drop artifacts and records of files that disappeared.
    /// A failure on one record is logged and the rest still run.
    pub async fn remove_stale(&self, records: &[FileRecord]) -> LoaderReturn {
        let mut removed = 0usize;
        for record in records {
            match self.forget_file(record).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(
                    path = %record.file_path,
                    unique_id = %record.external_unique_id,
                    kind = e.kind(),
                    error = %e,
                    "stale file could not be removed"
                ),
            }
        }
        if removed > 0 {
            tracing::debug!(base = %self.metadata.base_id(), removed, "deletion scan finished");
        }
        LoaderReturn {
            loader_type: LoaderReturn::DELETION_SCAN.to_string(),
            ..Default::default()
        }
    }

    async fn forget_file(&self, record: &FileRecord) -> Result<(), IngestError> {
        self.backend
            .delete_loader(&record.external_unique_id)
            .await
            .map_err(IngestError::Backend)?;
        self.metadata.delete_by_path(&record.file_path).await?;
        Ok(())
    }

    /// Remove one artifact by the id an `add` returned, returning how many
    /// backend artifacts were deleted. A directory aggregate id clears every
    /// record below that directory instead; a directory ingested without
    /// fingerprint tracking has no records, so its id removes nothing.
    pub async fn remove_artifact(&self, unique_id: &str) -> Result<usize, IngestError> {
        if let Some(dir_key) = unique_id.strip_prefix(DIRECTORY_ID_PREFIX) {
            let prefix = dir_prefix(Path::new(dir_key));
            let records = self.metadata.list_under(&prefix).await?;
            if records.is_empty() {
                tracing::warn!(
                    path = %dir_key,
                    "no file records under directory, nothing removed"
                );
                return Ok(0);
            }
            for record in &records {
                self.backend
                    .delete_loader(&record.external_unique_id)
                    .await
                    .map_err(IngestError::Backend)?;
            }
            let cleared = self.metadata.delete_under(&prefix).await?;
            tracing::debug!(path = %dir_key, cleared, "directory records cleared");
            return Ok(records.len());
        }

        self.backend
            .delete_loader(unique_id)
            .await
            .map_err(IngestError::Backend)?;
        self.metadata.delete_by_unique_id(unique_id).await?;
        Ok(1)
    }

    /// Directory key used in a directory's aggregate id.
    pub fn dir_key(root: &Path) -> String {
        path_key(root)
    }
}

/// Run `work`, turning any error into the error sentinel.
pub async fn guarded<F>(label: &str, work: F) -> LoaderReturn
where
    F: Future<Output = Result<LoaderReturn, IngestError>>,
{
    match work.await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(item = %label, kind = e.kind(), error = %e, "item failed");
            LoaderReturn::error(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AddedLoader, SearchHit};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Backend double: ids derive from the file path and its current text.
    #[derive(Default)]
    struct FakeBackend {
        calls: Mutex<Vec<String>>,
        fail_adds: bool,
    }

    #[async_trait]
    impl IndexBackend for FakeBackend {
        async fn add_loader(
            &self,
            source: &LoaderSource,
            _force: bool,
        ) -> anyhow::Result<AddedLoader> {
            self.calls.lock().unwrap().push(format!("add {}", source.describe()));
            if self.fail_adds {
                anyhow::bail!("backend offline");
            }
            let text = match source {
                LoaderSource::File(p) => std::fs::read_to_string(p)?,
                _ => String::new(),
            };
            Ok(AddedLoader {
                entries_added: 1,
                unique_id: format!("{}#{}", source.describe(), text),
                loader_type: source.loader_type().to_string(),
            })
        }

        async fn delete_loader(&self, unique_id: &str) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(format!("delete {}", unique_id));
            Ok(())
        }

        async fn reset(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn search(&self, _q: &str, _l: i64) -> anyhow::Result<Vec<SearchHit>> {
            Ok(Vec::new())
        }
    }

    async fn pipeline(tmp: &TempDir, backend: Arc<FakeBackend>) -> IngestionPipeline {
        let pool = crate::db::connect(&tmp.path().join("db")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let metadata = Arc::new(MetadataStore::new("test", pool));
        IngestionPipeline::new(metadata, backend, ChangeDetection::Hash)
    }

    #[tokio::test]
    async fn single_file_incremental_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, "one").unwrap();
        let backend = Arc::new(FakeBackend::default());
        let pipeline = pipeline(&tmp, backend.clone()).await;

        let first = pipeline.index_file(&file, false, true).await.unwrap();
        assert_eq!(first.entries_added, 1);

        let second = pipeline.index_file(&file, false, true).await.unwrap();
        assert_eq!(second.entries_added, 0);
        assert_eq!(second.unique_id, first.unique_id);
        assert_eq!(backend.calls.lock().unwrap().len(), 1, "unchanged file skips backend");

        std::fs::write(&file, "two").unwrap();
        let third = pipeline.index_file(&file, false, true).await.unwrap();
        assert_ne!(third.unique_id, first.unique_id);
        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(calls[1], format!("delete {}", first.unique_id));
        assert!(calls[2].starts_with("add "));

        let records = pipeline.metadata().list_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_unique_id, third.unique_id);
    }

    #[tokio::test]
    async fn non_incremental_never_touches_metadata() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, "one").unwrap();
        let backend = Arc::new(FakeBackend::default());
        let pipeline = pipeline(&tmp, backend.clone()).await;

        pipeline.index_file(&file, false, false).await.unwrap();
        pipeline.index_file(&file, false, false).await.unwrap();
        assert_eq!(backend.calls.lock().unwrap().len(), 2);
        assert!(pipeline.metadata().list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn guarded_turns_errors_into_sentinel() {
        let tmp = TempDir::new().unwrap();
        let backend = Arc::new(FakeBackend {
            fail_adds: true,
            ..Default::default()
        });
        let pipeline = pipeline(&tmp, backend).await;
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, "one").unwrap();

        let result = guarded("a.txt", pipeline.index_file(&file, false, true)).await;
        assert!(result.is_error());
        assert!(result.message.unwrap().contains("backend offline"));
        assert!(pipeline.metadata().list_all().await.unwrap().is_empty());

        let missing = guarded("gone", pipeline.index_file(&tmp.path().join("gone"), false, true)).await;
        assert!(missing.is_error());
    }

    #[tokio::test]
    async fn remove_artifact_handles_files_and_directories() {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("a.txt"), "a").unwrap();
        std::fs::write(docs.join("b.txt"), "b").unwrap();
        let backend = Arc::new(FakeBackend::default());
        let pipeline = pipeline(&tmp, backend.clone()).await;

        let a = pipeline.index_file(&docs.join("a.txt"), false, true).await.unwrap();
        pipeline.index_file(&docs.join("b.txt"), false, true).await.unwrap();

        assert_eq!(pipeline.remove_artifact(&a.unique_id).await.unwrap(), 1);
        assert_eq!(pipeline.metadata().list_all().await.unwrap().len(), 1);

        let root = std::fs::canonicalize(&docs).unwrap();
        let dir_id = directory_unique_id(&IngestionPipeline::dir_key(&root));
        assert_eq!(pipeline.remove_artifact(&dir_id).await.unwrap(), 1);
        assert!(pipeline.metadata().list_all().await.unwrap().is_empty());
        let calls = backend.calls.lock().unwrap().clone();
        assert!(calls.last().unwrap().starts_with("delete "));
        assert!(!calls.iter().any(|c| c.contains(DIRECTORY_ID_PREFIX)));
    }

    #[tokio::test]
    async fn untracked_directory_id_removes_nothing() {
        let tmp = TempDir::new().unwrap();
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("a.txt"), "a").unwrap();
        let backend = Arc::new(FakeBackend::default());
        let pipeline = pipeline(&tmp, backend.clone()).await;

        pipeline.index_file(&docs.join("a.txt"), false, false).await.unwrap();
        assert!(pipeline.metadata().list_all().await.unwrap().is_empty());

        let root = std::fs::canonicalize(&docs).unwrap();
        let dir_id = directory_unique_id(&IngestionPipeline::dir_key(&root));
        assert_eq!(pipeline.remove_artifact(&dir_id).await.unwrap(), 0);
        let calls = backend.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("add "));
    }
}
