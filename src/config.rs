//! TOML configuration parsing.
//!
//! Only `[storage]` is required; every other section falls back to the
//! defaults below. [`load_config`] validates the values that would otherwise
//! stall the scheduler or produce degenerate chunks.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::MB;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per knowledge base.
    pub root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_processing_items")]
    pub max_processing_items: usize,
    #[serde(default = "default_max_workload_mb")]
    pub max_workload_mb: u64,
    #[serde(default = "default_url_workload_mb")]
    pub url_workload_mb: u64,
    #[serde(default = "default_sitemap_workload_mb")]
    pub sitemap_workload_mb: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_processing_items: default_max_processing_items(),
            max_workload_mb: default_max_workload_mb(),
            url_workload_mb: default_url_workload_mb(),
            sitemap_workload_mb: default_sitemap_workload_mb(),
        }
    }
}

impl SchedulerConfig {
    pub fn max_workload_bytes(&self) -> u64 {
        self.max_workload_mb.saturating_mul(MB)
    }

    pub fn url_workload_bytes(&self) -> u64 {
        self.url_workload_mb.saturating_mul(MB)
    }

    pub fn sitemap_workload_bytes(&self) -> u64 {
        self.sitemap_workload_mb.saturating_mul(MB)
    }
}

fn default_max_processing_items() -> usize {
    30
}
fn default_max_workload_mb() -> u64 {
    80
}
fn default_url_workload_mb() -> u64 {
    2
}
fn default_sitemap_workload_mb() -> u64 {
    20
}

/// Which signals mark a previously indexed file as changed.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeDetection {
    /// Content hash or modification time differs.
    #[default]
    HashOrMtime,
    /// Only a content hash difference counts; mtime is still recorded.
    Hash,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default)]
    pub change_detection: ChangeDetection,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_hash_concurrency")]
    pub hash_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            change_detection: ChangeDetection::default(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            hash_concurrency: default_hash_concurrency(),
        }
    }
}

fn default_hash_concurrency() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_chunk_overlap() -> usize {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_sitemap_pages")]
    pub max_sitemap_pages: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_sitemap_pages: default_max_sitemap_pages(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}
fn default_max_sitemap_pages() -> usize {
    100
}
fn default_user_agent() -> String {
    concat!("knowledge-ingest/", env!("CARGO_PKG_VERSION")).to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_search_limit")]
    pub limit: i64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            limit: default_search_limit(),
        }
    }
}

fn default_search_limit() -> i64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Config {
    /// A config with every section at its default, rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig { root: root.into() },
            scheduler: SchedulerConfig::default(),
            sync: SyncConfig::default(),
            chunking: ChunkingConfig::default(),
            fetch: FetchConfig::default(),
            search: SearchConfig::default(),
            log: LogConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_processing_items == 0 {
            anyhow::bail!("scheduler.max_processing_items must be >= 1");
        }
        if self.scheduler.max_workload_mb == 0 {
            anyhow::bail!("scheduler.max_workload_mb must be >= 1");
        }
        if self.chunking.chunk_size == 0 {
            anyhow::bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            anyhow::bail!(
                "chunking.chunk_overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.chunk_overlap,
                self.chunking.chunk_size
            );
        }
        if self.sync.hash_concurrency == 0 {
            anyhow::bail!("sync.hash_concurrency must be >= 1");
        }
        if self.fetch.max_sitemap_pages == 0 {
            anyhow::bail!("fetch.max_sitemap_pages must be >= 1");
        }
        for pattern in &self.sync.exclude_globs {
            globset::Glob::new(pattern)
                .with_context(|| format!("Invalid sync.exclude_globs pattern: '{}'", pattern))?;
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
