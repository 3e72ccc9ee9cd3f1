//! Core data models shared by the task factory, scheduler and pipeline.
//!
//! These types describe what a caller submits ([`KnowledgeItem`]), what is
//! persisted per indexed file ([`FileRecord`]) and what every unit of work
//! resolves to ([`LoaderReturn`]).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One mebibyte, the unit workload estimates are configured in.
pub const MB: u64 = 1024 * 1024;

/// Settings handed through to the embedding backend. Opaque to this crate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,
}

/// Parameters a knowledge base is created with, persisted as `base.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeBaseParams {
    pub id: String,
    #[serde(default)]
    pub embedding: EmbeddingSettings,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

/// Kind of source a [`KnowledgeItem`] points at.
///
/// Unrecognized kinds deserialize (and parse) to [`ItemKind::Unknown`] so a
/// caller can still submit them and receive the no-op result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    File,
    Directory,
    Url,
    Sitemap,
    Note,
    #[serde(other)]
    Unknown,
}

impl FromStr for ItemKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "file" => ItemKind::File,
            "directory" | "dir" => ItemKind::Directory,
            "url" => ItemKind::Url,
            "sitemap" => ItemKind::Sitemap,
            "note" => ItemKind::Note,
            _ => ItemKind::Unknown,
        })
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemKind::File => "file",
            ItemKind::Directory => "directory",
            ItemKind::Url => "url",
            ItemKind::Sitemap => "sitemap",
            ItemKind::Note => "note",
            ItemKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A source submitted for ingestion. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeItem {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// A path, directory path, URL, or note text depending on `kind`.
    pub content: String,
    pub base_id: String,
}

impl KnowledgeItem {
    pub fn new(base_id: &str, kind: ItemKind, content: impl Into<String>) -> Self {
        let content = content.into();
        let id = format!("{}:{}", kind, short_digest(&content));
        Self {
            id,
            kind,
            content,
            base_id: base_id.to_string(),
        }
    }
}

fn short_digest(content: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(&digest[..6])
}

/// Fingerprint of one indexed file, persisted per knowledge base.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub file_path: String,
    pub content_hash: String,
    pub size: i64,
    /// Milliseconds since the Unix epoch.
    pub last_modified: i64,
    pub external_unique_id: String,
    pub loader_type: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// What every task item, and every task group in aggregate, resolves to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderReturn {
    pub entries_added: usize,
    pub unique_id: String,
    pub unique_ids: Vec<String>,
    pub loader_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LoaderReturn {
    pub const ERROR: &'static str = "error";
    pub const NOOP: &'static str = "noop";
    pub const DIRECTORY: &'static str = "directory";
    pub const DELETION_SCAN: &'static str = "deletion-scan";

    /// Result for one artifact the backend holds.
    pub fn indexed(entries_added: usize, unique_id: String, loader_type: String) -> Self {
        Self {
            entries_added,
            unique_ids: vec![unique_id.clone()],
            unique_id,
            loader_type,
            message: None,
        }
    }

    /// Sentinel for an item whose unit of work failed.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            loader_type: Self::ERROR.to_string(),
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Sentinel for an item kind that produces no task.
    pub fn noop() -> Self {
        Self {
            loader_type: Self::NOOP.to_string(),
            ..Default::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.loader_type == Self::ERROR && self.unique_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_kind_parses_known_and_unknown() {
        assert_eq!("Directory".parse::<ItemKind>().unwrap(), ItemKind::Directory);
        assert_eq!("sitemap".parse::<ItemKind>().unwrap(), ItemKind::Sitemap);
        assert_eq!("video".parse::<ItemKind>().unwrap(), ItemKind::Unknown);
    }

    #[test]
    fn unknown_kind_deserializes() {
        let item: KnowledgeItem = serde_json::from_str(
            r#"{"id":"x","type":"video","content":"a.mp4","base_id":"b"}"#,
        )
        .unwrap();
        assert_eq!(item.kind, ItemKind::Unknown);
    }

    #[test]
    fn error_sentinel_is_distinguishable() {
        let err = LoaderReturn::error("boom");
        assert!(err.is_error());
        assert!(err.unique_ids.is_empty());
        assert_eq!(err.entries_added, 0);

        let ok = LoaderReturn::indexed(3, "file_abc".into(), "file".into());
        assert!(!ok.is_error());
        assert_eq!(ok.unique_ids, vec!["file_abc".to_string()]);
    }

    #[test]
    fn loader_return_serializes_camel_case() {
        let json = serde_json::to_value(LoaderReturn::noop()).unwrap();
        assert_eq!(json["entriesAdded"], 0);
        assert_eq!(json["loaderType"], "noop");
        assert!(json.get("message").is_none());
    }
}
