//! Turning knowledge items into schedulable work.
//!
//! [`SourceTaskFactory::build`] produces one [`LoaderTask`] per submitted
//! [`KnowledgeItem`]: a group of [`LoaderTaskItem`]s, each with a byte
//! workload estimate the scheduler admits against, plus the rule for folding
//! the items' results into the caller's single [`LoaderReturn`].
//!
//! Workload estimates:
//!
//! | Kind | Items | Workload |
//! |------|-------|----------|
//! | file | 1 | file size |
//! | url | 1 | `scheduler.url_workload_mb` |
//! | sitemap | 1 | `scheduler.sitemap_workload_mb` |
//! | note | 1 | text length in bytes |
//! | directory | 1 per new/changed file + deletion scan | file size / 0 |

use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::backend::LoaderSource;
use crate::config::SchedulerConfig;
use crate::error::IngestError;
use crate::pipeline::{directory_unique_id, guarded, IngestionPipeline};
use crate::progress::{DirectoryProgress, IngestProgressReporter};
use crate::sync::IncrementalSyncEngine;
use crate::models::{ItemKind, KnowledgeItem, LoaderReturn};

/// The unit of work of one task item. Never fails: errors are already
/// folded into the error sentinel.
pub type ItemWork = BoxFuture<'static, LoaderReturn>;

pub struct LoaderTaskItem {
    /// Estimated bytes of work, admitted against the workload cap.
    pub workload: u64,
    /// Short description for logs.
    pub label: String,
    pub work: ItemWork,
}

impl LoaderTaskItem {
    pub fn new(workload: u64, label: impl Into<String>, work: ItemWork) -> Self {
        Self {
            workload,
            label: label.into(),
            work,
        }
    }
}

impl std::fmt::Debug for LoaderTaskItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderTaskItem")
            .field("workload", &self.workload)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// How a group's item results become the caller's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Aggregate {
    /// The group has one item; its result is the answer.
    Single,
    /// Sum of every item, tagged with the directory's aggregate id.
    /// `carried` holds ids of unchanged files that produced no item.
    Directory { unique_id: String, carried: Vec<String> },
}

impl Aggregate {
    pub fn finish(self, results: Vec<LoaderReturn>) -> LoaderReturn {
        match self {
            Aggregate::Single => results.into_iter().next().unwrap_or_else(LoaderReturn::noop),
            Aggregate::Directory { unique_id, carried } => {
                let mut seen: HashSet<String> = carried.iter().cloned().collect();
                let mut unique_ids = carried;
                let mut entries_added = 0;
                for result in results {
                    if result.is_error() || result.loader_type == LoaderReturn::DELETION_SCAN {
                        continue;
                    }
                    entries_added += result.entries_added;
                    for id in result.unique_ids {
                        if seen.insert(id.clone()) {
                            unique_ids.push(id);
                        }
                    }
                }
                LoaderReturn {
                    entries_added,
                    unique_id,
                    unique_ids,
                    loader_type: LoaderReturn::DIRECTORY.to_string(),
                    message: None,
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct LoaderTask {
    pub items: Vec<LoaderTaskItem>,
    pub aggregate: Aggregate,
}

impl LoaderTask {
    pub fn single(item: LoaderTaskItem) -> Self {
        Self {
            items: vec![item],
            aggregate: Aggregate::Single,
        }
    }

    pub fn total_workload(&self) -> u64 {
        self.items.iter().map(|i| i.workload).sum()
    }
}

/// Fixed estimates for sources whose size is unknown up front.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadEstimates {
    pub url: u64,
    pub sitemap: u64,
}

impl From<&SchedulerConfig> for WorkloadEstimates {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            url: config.url_workload_bytes(),
            sitemap: config.sitemap_workload_bytes(),
        }
    }
}

/// Builds tasks for one knowledge base.
pub struct SourceTaskFactory {
    pipeline: Arc<IngestionPipeline>,
    sync: Arc<IncrementalSyncEngine>,
    estimates: WorkloadEstimates,
    progress: Arc<dyn IngestProgressReporter>,
}

impl SourceTaskFactory {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        sync: Arc<IncrementalSyncEngine>,
        estimates: WorkloadEstimates,
        progress: Arc<dyn IngestProgressReporter>,
    ) -> Self {
        Self {
            pipeline,
            sync,
            estimates,
            progress,
        }
    }

    /// `Ok(None)` for an item kind no task exists for. `Err` only when a
    /// directory cannot be planned at all.
    pub async fn build(
        &self,
        item: &KnowledgeItem,
        force_reload: bool,
        incremental: bool,
    ) -> Result<Option<LoaderTask>, IngestError> {
        let task = match item.kind {
            ItemKind::File => self.file_task(&item.content, force_reload, incremental).await,
            ItemKind::Url => self.source_task(
                LoaderSource::Url(item.content.clone()),
                self.estimates.url,
                force_reload,
            ),
            ItemKind::Sitemap => self.source_task(
                LoaderSource::Sitemap(item.content.clone()),
                self.estimates.sitemap,
                force_reload,
            ),
            ItemKind::Note => {
                let workload = item.content.len() as u64;
                let source = LoaderSource::Note {
                    text: item.content.clone(),
                    source: Some(item.id.clone()),
                };
                self.source_task(source, workload, force_reload)
            }
            ItemKind::Directory => {
                let dir = PathBuf::from(&item.content);
                if incremental {
                    self.directory_task(&dir, force_reload).await?
                } else {
                    self.full_directory_task(&dir, force_reload).await?
                }
            }
            ItemKind::Unknown => {
                tracing::warn!(item = %item.id, "unsupported item kind, nothing to do");
                return Ok(None);
            }
        };
        tracing::debug!(
            item = %item.id,
            kind = %item.kind,
            items = task.items.len(),
            workload = task.total_workload(),
            "task built"
        );
        Ok(Some(task))
    }

    async fn file_task(&self, content: &str, force_reload: bool, incremental: bool) -> LoaderTask {
        let path = PathBuf::from(content);
        let workload = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
        let pipeline = self.pipeline.clone();
        let label = content.to_string();
        let work = {
            let label = label.clone();
            async move {
                guarded(&label, pipeline.index_file(&path, force_reload, incremental)).await
            }
            .boxed()
        };
        LoaderTask::single(LoaderTaskItem::new(workload, label, work))
    }

    fn source_task(&self, source: LoaderSource, workload: u64, force_reload: bool) -> LoaderTask {
        let pipeline = self.pipeline.clone();
        let label = source.describe();
        let work = {
            let label = label.clone();
            async move { guarded(&label, pipeline.index_source(&source, force_reload)).await }
                .boxed()
        };
        LoaderTask::single(LoaderTaskItem::new(workload, label, work))
    }

    /// One item per new or changed file plus a trailing deletion scan.
    async fn directory_task(&self, dir: &Path, force_reload: bool) -> Result<LoaderTask, IngestError> {
        let plan = self.sync.plan(dir, force_reload).await?;
        let dir_key = IngestionPipeline::dir_key(&plan.root);
        let unique_id = directory_unique_id(&dir_key);

        let already_done = (plan.unchanged.len() + plan.unreadable.len()) as u64;
        let progress = Arc::new(DirectoryProgress::new(
            unique_id.clone(),
            plan.listed() as u64,
            already_done,
            self.progress.clone(),
        ));

        let carried: Vec<String> = plan
            .unchanged
            .iter()
            .map(|r| r.external_unique_id.clone())
            .collect();

        let mut items = Vec::with_capacity(plan.added.len() + plan.changed.len() + 1);
        for fp in plan.added {
            let pipeline = self.pipeline.clone();
            let progress = progress.clone();
            let workload = fp.size;
            let label = fp.key.clone();
            let work = async move {
                let result = guarded(&fp.key, pipeline.index_new(&fp, force_reload)).await;
                progress.file_done();
                result
            }
            .boxed();
            items.push(LoaderTaskItem::new(workload, label, work));
        }
        for (fp, previous) in plan.changed {
            let pipeline = self.pipeline.clone();
            let progress = progress.clone();
            let workload = fp.size;
            let label = fp.key.clone();
            let work = async move {
                let result =
                    guarded(&fp.key, pipeline.reindex(&fp, &previous, force_reload)).await;
                progress.file_done();
                result
            }
            .boxed();
            items.push(LoaderTaskItem::new(workload, label, work));
        }

        let pipeline = self.pipeline.clone();
        let deleted = plan.deleted;
        items.push(LoaderTaskItem::new(
            0,
            format!("{} deletion scan", dir_key),
            async move { pipeline.remove_stale(&deleted).await }.boxed(),
        ));

        Ok(LoaderTask {
            items,
            aggregate: Aggregate::Directory { unique_id, carried },
        })
    }

    /// Non-incremental directory: every file goes straight to the backend,
    /// metadata is neither read nor written and nothing is deleted.
    async fn full_directory_task(
        &self,
        dir: &Path,
        force_reload: bool,
    ) -> Result<LoaderTask, IngestError> {
        let root = tokio::fs::canonicalize(dir)
            .await
            .map_err(|e| IngestError::io(dir, e))?;
        let listing = self.sync.list(&root).await?;
        let unique_id = directory_unique_id(&IngestionPipeline::dir_key(&root));
        let progress = Arc::new(DirectoryProgress::new(
            unique_id.clone(),
            listing.files.len() as u64,
            0,
            self.progress.clone(),
        ));

        let mut items = Vec::with_capacity(listing.files.len());
        for path in listing.files {
            let workload = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            let pipeline = self.pipeline.clone();
            let progress = progress.clone();
            let label = path.display().to_string();
            let work = {
                let label = label.clone();
                async move {
                    let source = LoaderSource::File(path);
                    let result = guarded(&label, pipeline.index_source(&source, force_reload)).await;
                    progress.file_done();
                    result
                }
                .boxed()
            };
            items.push(LoaderTaskItem::new(workload, label, work));
        }

        Ok(LoaderTask {
            items,
            aggregate: Aggregate::Directory {
                unique_id,
                carried: Vec::new(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AddedLoader, IndexBackend, SearchHit};
    use crate::config::{ChangeDetection, SyncConfig};
    use crate::metadata::MetadataStore;
    use crate::models::MB;
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct EchoBackend;

    #[async_trait]
    impl IndexBackend for EchoBackend {
        async fn add_loader(&self, source: &LoaderSource, _f: bool) -> anyhow::Result<AddedLoader> {
            Ok(AddedLoader {
                entries_added: 1,
                unique_id: format!("{}_{}", source.loader_type(), source.describe()),
                loader_type: source.loader_type().to_string(),
            })
        }
        async fn delete_loader(&self, _id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn reset(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn search(&self, _q: &str, _l: i64) -> anyhow::Result<Vec<SearchHit>> {
            Ok(Vec::new())
        }
    }

    async fn factory(tmp: &TempDir) -> SourceTaskFactory {
        let pool = crate::db::connect(&tmp.path().join("db")).await.unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let metadata = Arc::new(MetadataStore::new("test", pool));
        let pipeline = Arc::new(IngestionPipeline::new(
            metadata.clone(),
            Arc::new(EchoBackend),
            ChangeDetection::HashOrMtime,
        ));
        let sync = Arc::new(IncrementalSyncEngine::new(metadata, SyncConfig::default()));
        SourceTaskFactory::new(
            pipeline,
            sync,
            WorkloadEstimates::from(&SchedulerConfig::default()),
            Arc::new(NoProgress),
        )
    }

    #[tokio::test]
    async fn workload_estimates_per_kind() {
        let tmp = TempDir::new().unwrap();
        let factory = factory(&tmp).await;
        let file = tmp.path().join("a.txt");
        std::fs::write(&file, vec![b'x'; 50]).unwrap();

        let cases = [
            (ItemKind::File, file.display().to_string(), 50),
            (ItemKind::Url, "https://example.com".to_string(), 2 * MB),
            (ItemKind::Sitemap, "https://example.com/sitemap.xml".to_string(), 20 * MB),
            (ItemKind::Note, "héllo".to_string(), 6),
        ];
        for (kind, content, expected) in cases {
            let item = KnowledgeItem::new("kb", kind, content);
            let task = factory.build(&item, false, true).await.unwrap().unwrap();
            assert_eq!(task.items.len(), 1, "{:?}", kind);
            assert_eq!(task.items[0].workload, expected, "{:?}", kind);
            assert_eq!(task.aggregate, Aggregate::Single);
        }
    }

    #[tokio::test]
    async fn unknown_kind_builds_nothing() {
        let tmp = TempDir::new().unwrap();
        let factory = factory(&tmp).await;
        let item = KnowledgeItem::new("kb", ItemKind::Unknown, "x");
        assert!(factory.build(&item, false, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn directory_task_has_trailing_deletion_scan() {
        let tmp = TempDir::new().unwrap();
        let factory = factory(&tmp).await;
        let docs = tmp.path().join("docs");
        std::fs::create_dir_all(&docs).unwrap();
        std::fs::write(docs.join("a.txt"), vec![b'a'; 50]).unwrap();
        std::fs::write(docs.join("b.txt"), vec![b'b'; 60]).unwrap();

        let item = KnowledgeItem::new("kb", ItemKind::Directory, docs.display().to_string());
        let task = factory.build(&item, false, true).await.unwrap().unwrap();
        let workloads: Vec<u64> = task.items.iter().map(|i| i.workload).collect();
        assert_eq!(workloads, vec![50, 60, 0]);
        assert!(task.items[2].label.ends_with("deletion scan"));

        let full = factory.build(&item, false, false).await.unwrap().unwrap();
        assert_eq!(full.items.len(), 2, "no deletion scan without incremental");
    }

    #[tokio::test]
    async fn missing_directory_fails_to_plan() {
        let tmp = TempDir::new().unwrap();
        let factory = factory(&tmp).await;
        let item = KnowledgeItem::new("kb", ItemKind::Directory, "/no/such/dir/anywhere");
        assert!(factory.build(&item, false, true).await.is_err());
    }

    #[test]
    fn directory_aggregate_skips_failures() {
        let aggregate = Aggregate::Directory {
            unique_id: "directory:/d".into(),
            carried: vec!["file_keep".into()],
        };
        let result = aggregate.finish(vec![
            LoaderReturn::indexed(3, "file_a".into(), "file".into()),
            LoaderReturn::error("unreadable"),
            LoaderReturn::indexed(2, "file_b".into(), "file".into()),
            LoaderReturn {
                loader_type: LoaderReturn::DELETION_SCAN.into(),
                ..Default::default()
            },
        ]);
        assert_eq!(result.entries_added, 5);
        assert_eq!(result.unique_id, "directory:/d");
        assert_eq!(result.loader_type, "directory");
        assert_eq!(
            result.unique_ids,
            vec!["file_keep".to_string(), "file_a".to_string(), "file_b".to_string()]
        );
    }
}
