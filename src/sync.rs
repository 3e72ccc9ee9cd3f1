//! Incremental directory sync.
//!
//! Compares the files currently under a directory with the [`FileRecord`]s
//! stored for that directory and classifies each one:
//!
//! | Current file | Stored record | Result |
//! |--------------|---------------|--------|
//! | present | none | new |
//! | present | hash (or mtime) differs, or force reload | changed |
//! | present | matches | unchanged |
//! | absent | present | deleted |
//!
//! Under [`ChangeDetection::HashOrMtime`] either signal marks a file as
//! changed; under [`ChangeDetection::Hash`] only the content hash counts.
//!
//! Files that exist but cannot be read are reported separately and are
//! never treated as deleted, so a transient permission error does not drop
//! their indexed content.

use anyhow::Result;
use futures::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use crate::config::{ChangeDetection, SyncConfig};
use crate::error::IngestError;
use crate::fingerprint::{dir_prefix, fingerprint_file, path_key, FileFingerprint};
use crate::metadata::MetadataStore;
use crate::models::FileRecord;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/node_modules/**"];

/// Files found under a directory walk.
#[derive(Debug, Default)]
pub struct Listing {
    pub files: Vec<PathBuf>,
    /// Entries the walk could not read (permission errors, broken links).
    pub unreadable: Vec<PathBuf>,
}

/// Recursively list regular files under `root`, sorted by path.
pub fn enumerate_files(root: &Path, config: &SyncConfig) -> Result<Listing> {
    let mut patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    patterns.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&patterns)?;

    let mut listing = Listing::default();
    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "directory entry skipped");
                if let Some(path) = e.path() {
                    listing.unreadable.push(path.to_path_buf());
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        if exclude_set.is_match(relative) {
            continue;
        }
        listing.files.push(path.to_path_buf());
    }

    listing.files.sort();
    Ok(listing)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Decision for one file that is currently present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    New,
    Changed(FileRecord),
    Unchanged(FileRecord),
}

pub fn classify(
    current: &FileFingerprint,
    previous: Option<FileRecord>,
    force_reload: bool,
    policy: ChangeDetection,
) -> FileChange {
    let Some(record) = previous else {
        return FileChange::New;
    };
    if force_reload {
        return FileChange::Changed(record);
    }

    let hash_differs = record.content_hash != current.content_hash;
    let mtime_differs = record.last_modified != current.modified_ms;
    let changed = match policy {
        ChangeDetection::HashOrMtime => hash_differs || mtime_differs,
        ChangeDetection::Hash => hash_differs,
    };

    if changed {
        FileChange::Changed(record)
    } else {
        FileChange::Unchanged(record)
    }
}

/// Outcome of diffing one directory against its stored records.
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// Canonical directory that was scanned.
    pub root: PathBuf,
    /// Metadata key prefix of `root`.
    pub prefix: String,
    pub added: Vec<FileFingerprint>,
    pub changed: Vec<(FileFingerprint, FileRecord)>,
    pub unchanged: Vec<FileRecord>,
    pub deleted: Vec<FileRecord>,
    pub unreadable: Vec<PathBuf>,
}

impl SyncPlan {
    /// Number of files seen in the current listing.
    pub fn listed(&self) -> usize {
        self.added.len() + self.changed.len() + self.unchanged.len() + self.unreadable.len()
    }
}

pub struct IncrementalSyncEngine {
    metadata: Arc<MetadataStore>,
    config: SyncConfig,
}

impl IncrementalSyncEngine {
    pub fn new(metadata: Arc<MetadataStore>, config: SyncConfig) -> Self {
        Self { metadata, config }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Walk `dir` off the async runtime.
    pub async fn list(&self, dir: &Path) -> Result<Listing, IngestError> {
        let root = dir.to_path_buf();
        let config = self.config.clone();
        let listing = tokio::task::spawn_blocking(move || enumerate_files(&root, &config))
            .await
            .map_err(|e| IngestError::io(dir, std::io::Error::other(e)))?;
        listing.map_err(|e| IngestError::io(dir, std::io::Error::other(e)))
    }

    /// Classify every file under `dir`. Hashing runs `hash_concurrency`
    /// files at a time; nothing is written.
    pub async fn plan(&self, dir: &Path, force_reload: bool) -> Result<SyncPlan, IngestError> {
        let root = tokio::fs::canonicalize(dir)
            .await
            .map_err(|e| IngestError::io(dir, e))?;
        let prefix = dir_prefix(&root);
        let listing = self.list(&root).await?;

        let mut previous: HashMap<String, FileRecord> = self
            .metadata
            .list_under(&prefix)
            .await?
            .into_iter()
            .map(|r| (r.file_path.clone(), r))
            .collect();

        let fingerprints: Vec<(PathBuf, Result<FileFingerprint, IngestError>)> =
            stream::iter(listing.files)
                .map(|path| async move {
                    let fp = fingerprint_file(&path).await;
                    (path, fp)
                })
                .buffered(self.config.hash_concurrency.max(1))
                .collect()
                .await;

        let mut plan = SyncPlan {
            root,
            prefix,
            unreadable: listing.unreadable,
            ..Default::default()
        };

        for (path, fp) in fingerprints {
            let fp = match fp {
                Ok(fp) => fp,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "file could not be hashed");
                    previous.remove(&path_key(&path));
                    plan.unreadable.push(path);
                    continue;
                }
            };
            let record = previous.remove(&fp.key);
            match classify(&fp, record, force_reload, self.config.change_detection) {
                FileChange::New => {
                    tracing::debug!(path = %fp.key, "new file");
                    plan.added.push(fp);
                }
                FileChange::Changed(record) => {
                    tracing::debug!(path = %fp.key, unique_id = %record.external_unique_id, "changed file");
                    plan.changed.push((fp, record));
                }
                FileChange::Unchanged(record) => plan.unchanged.push(record),
            }
        }

        let protected: Vec<(String, String)> = plan
            .unreadable
            .iter()
            .map(|p| (path_key(p), dir_prefix(p)))
            .collect();
        let mut deleted: Vec<FileRecord> = previous
            .into_values()
            .filter(|r| {
                !protected.iter().any(|(exact, under)| {
                    r.file_path == *exact || r.file_path.starts_with(under.as_str())
                })
            })
            .collect();
        deleted.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        plan.deleted = deleted;

        tracing::debug!(
            base = %self.metadata.base_id(),
            path = %plan.root.display(),
            added = plan.added.len(),
            changed = plan.changed.len(),
            unchanged = plan.unchanged.len(),
            deleted = plan.deleted.len(),
            "directory planned"
        );
        Ok(plan)
    }
}
