//! Index backend abstraction.
//!
//! The embedding / vector-store service that actually stores and searches
//! indexed content sits behind [`IndexBackend`]. This crate only decides
//! what to submit and when; it never looks inside an artifact beyond the
//! `unique_id` handle the backend returns.
//!
//! A [`BackendProvider`] opens one backend per knowledge base. The bundled
//! [`local::LocalBackendProvider`] keeps chunks in the base's SQLite file
//! with an FTS5 keyword index so the `kb` binary works without any external
//! service.

pub mod local;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::sync::Arc;

use crate::models::KnowledgeBaseParams;

/// What a loader should ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoaderSource {
    File(PathBuf),
    Url(String),
    Sitemap(String),
    Note {
        text: String,
        source: Option<String>,
    },
}

impl LoaderSource {
    pub fn loader_type(&self) -> &'static str {
        match self {
            LoaderSource::File(_) => "file",
            LoaderSource::Url(_) => "url",
            LoaderSource::Sitemap(_) => "sitemap",
            LoaderSource::Note { .. } => "note",
        }
    }

    /// Human-readable origin, stored alongside indexed chunks.
    pub fn describe(&self) -> String {
        match self {
            LoaderSource::File(path) => path.display().to_string(),
            LoaderSource::Url(url) | LoaderSource::Sitemap(url) => url.clone(),
            LoaderSource::Note { source, .. } => {
                source.clone().unwrap_or_else(|| "note".to_string())
            }
        }
    }
}

/// Result of a successful `add_loader` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedLoader {
    pub entries_added: usize,
    pub unique_id: String,
    pub loader_type: String,
}

/// One ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub unique_id: String,
    pub source: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f64,
}

#[async_trait]
pub trait IndexBackend: Send + Sync {
    /// Index a source. With `force_reload = false` a source the backend
    /// already holds is left as is and reports zero new entries.
    async fn add_loader(&self, source: &LoaderSource, force_reload: bool) -> Result<AddedLoader>;

    /// Remove every indexed entry of one artifact. Unknown ids are not an error.
    async fn delete_loader(&self, unique_id: &str) -> Result<()>;

    /// Drop all indexed content.
    async fn reset(&self) -> Result<()>;

    async fn search(&self, query: &str, limit: i64) -> Result<Vec<SearchHit>>;
}

/// Opens the backend serving one knowledge base.
pub trait BackendProvider: Send + Sync {
    fn open(&self, base: &KnowledgeBaseParams, pool: &SqlitePool) -> Result<Arc<dyn IndexBackend>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_types_and_descriptions() {
        let file = LoaderSource::File(PathBuf::from("/d/a.txt"));
        assert_eq!(file.loader_type(), "file");
        assert_eq!(file.describe(), "/d/a.txt");

        let note = LoaderSource::Note {
            text: "hello".into(),
            source: None,
        };
        assert_eq!(note.loader_type(), "note");
        assert_eq!(note.describe(), "note");

        let sitemap = LoaderSource::Sitemap("https://example.com/sitemap.xml".into());
        assert_eq!(sitemap.loader_type(), "sitemap");
    }
}
