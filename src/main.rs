//! # Knowledge ingest CLI (`kb`)
//!
//! Thin command surface over [`knowledge_ingest::service::KnowledgeService`].
//!
//! ## Usage
//!
//! ```bash
//! kb --config ./config/kb.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kb create <base>` | Provision storage for a knowledge base |
//! | `kb add <base> <kind> <content>` | Ingest a file, directory, url, sitemap or note |
//! | `kb remove <base> <id>...` | Delete indexed artifacts and their records |
//! | `kb reset <base>` | Clear all indexed content of a base |
//! | `kb delete <base>` | Remove a base's storage directory |
//! | `kb search <base> "<query>"` | Keyword search, optionally reranked |
//! | `kb files <base>` | List recorded file fingerprints |
//!
//! ## Examples
//!
//! ```bash
//! kb create docs --chunk-size 800
//! kb add docs directory ./handbook        # incremental: unchanged files are skipped
//! kb add docs directory ./handbook --force
//! kb add docs url https://example.com/guide
//! kb search docs "deploy rollback" --rerank
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use knowledge_ingest::config::{self, Config};
use knowledge_ingest::models::{EmbeddingSettings, ItemKind, KnowledgeBaseParams, KnowledgeItem};
use knowledge_ingest::progress::ProgressMode;
use knowledge_ingest::search::print_hits;
use knowledge_ingest::service::{AddOptions, KnowledgeService};

/// Knowledge ingest: admission-controlled, incremental ingestion into a
/// local retrieval index.
#[derive(Parser)]
#[command(
    name = "kb",
    about = "Admission-controlled, incremental knowledge base ingestion",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kb.toml")]
    config: PathBuf,

    /// Progress output on stderr. Defaults to `human` on a terminal, `off` otherwise.
    #[arg(long, global = true, value_enum)]
    progress: Option<ProgressArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ProgressArg {
    Off,
    Human,
    Json,
}

impl From<ProgressArg> for ProgressMode {
    fn from(arg: ProgressArg) -> Self {
        match arg {
            ProgressArg::Off => ProgressMode::Off,
            ProgressArg::Human => ProgressMode::Human,
            ProgressArg::Json => ProgressMode::Json,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a knowledge base. Idempotent: an existing base keeps its parameters.
    Create {
        base: String,

        /// Chunk size in characters. Defaults to `[chunking].chunk_size`.
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Chunk overlap in characters. Defaults to `[chunking].chunk_overlap`.
        #[arg(long)]
        chunk_overlap: Option<usize>,

        /// Embedding model recorded with the base.
        #[arg(long)]
        model: Option<String>,

        /// Embedding dimensions recorded with the base.
        #[arg(long)]
        dimensions: Option<usize>,
    },

    /// Ingest a source.
    ///
    /// Kind is one of `file`, `directory`, `url`, `sitemap` or `note`; for a
    /// note the content is the note text itself.
    Add {
        base: String,
        kind: String,
        content: String,

        /// Re-index even when the stored fingerprint matches.
        #[arg(long)]
        force: bool,

        /// Skip fingerprint tracking: every file goes to the index and
        /// nothing is deleted.
        #[arg(long)]
        full: bool,
    },

    /// Remove indexed artifacts by the ids `add` reported.
    Remove {
        base: String,
        #[arg(required = true)]
        unique_ids: Vec<String>,
    },

    /// Clear all indexed content of a base.
    Reset { base: String },

    /// Delete a base's storage directory.
    Delete { base: String },

    /// Search a base.
    Search {
        base: String,
        query: String,

        /// Maximum number of results. Defaults to `[search].limit`.
        #[arg(long)]
        limit: Option<i64>,

        /// Rerank hits by query-term coverage.
        #[arg(long)]
        rerank: bool,
    },

    /// List recorded file fingerprints.
    Files {
        base: String,

        /// Only files under this directory.
        #[arg(long)]
        under: Option<PathBuf>,
    },
}

fn init_tracing(cfg: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg);

    let progress = cli
        .progress
        .map(ProgressMode::from)
        .unwrap_or_else(ProgressMode::default_for_tty);
    let service = KnowledgeService::new(cfg.clone()).with_progress(progress.reporter());

    match cli.command {
        Commands::Create {
            base,
            chunk_size,
            chunk_overlap,
            model,
            dimensions,
        } => {
            let params = KnowledgeBaseParams {
                id: base,
                embedding: EmbeddingSettings { model, dimensions },
                chunk_size: chunk_size.unwrap_or(cfg.chunking.chunk_size),
                chunk_overlap: chunk_overlap.unwrap_or(cfg.chunking.chunk_overlap),
            };
            let params = service.create(params).await?;
            println!(
                "create {} (chunk_size {}, overlap {}) ok",
                params.id, params.chunk_size, params.chunk_overlap
            );
        }
        Commands::Add {
            base,
            kind,
            content,
            force,
            full,
        } => {
            let kind: ItemKind = kind.parse()?;
            let item = KnowledgeItem::new(&base, kind, content);
            let options = AddOptions {
                force_reload: force,
                incremental_update: !full,
            };
            let result = service.add(&item, options).await?;
            if result.is_error() {
                anyhow::bail!(
                    "add {} failed: {}",
                    item.content,
                    result.message.unwrap_or_default()
                );
            }
            println!(
                "add {} {}: {} entries, id {} ok",
                result.loader_type,
                item.content,
                result.entries_added,
                if result.unique_id.is_empty() {
                    "-"
                } else {
                    result.unique_id.as_str()
                }
            );
            for id in result.unique_ids.iter().filter(|id| **id != result.unique_id) {
                println!("    {}", id);
            }
        }
        Commands::Remove { base, unique_ids } => {
            let (first, rest) = unique_ids.split_at(1);
            service.remove(&base, &first[0], rest).await?;
            println!("remove {} ({} ids) ok", base, unique_ids.len());
        }
        Commands::Reset { base } => {
            service.reset(&base).await?;
            println!("reset {} ok", base);
        }
        Commands::Delete { base } => {
            service.delete(&base).await?;
            println!("delete {} ok", base);
        }
        Commands::Search {
            base,
            query,
            limit,
            rerank,
        } => {
            let mut hits = service.search(&base, &query, limit).await?;
            if rerank {
                hits = service.rerank(&base, &query, hits).await?;
            }
            print_hits(&hits);
        }
        Commands::Files { base, under } => {
            let records = service.files(&base, under.as_deref()).await?;
            for record in &records {
                let modified = chrono::DateTime::from_timestamp_millis(record.last_modified)
                    .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!(
                    "{}  {}  {} bytes  {}  {}",
                    record.file_path,
                    &record.content_hash[..record.content_hash.len().min(12)],
                    record.size,
                    modified,
                    record.external_unique_id
                );
            }
            println!("files {} ({} records) ok", base, records.len());
        }
    }

    Ok(())
}
