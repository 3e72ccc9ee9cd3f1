//! # Knowledge Ingest
//!
//! Admission-controlled, incremental ingestion of heterogeneous sources
//! (files, directories, web pages, sitemaps, notes) into a retrieval index.
//!
//! Every submitted item becomes a task of one or more work items with a byte
//! workload estimate. A single scheduler admits those items under an item
//! count cap and a workload cap. Directory items are diffed against stored
//! per-file fingerprints so unchanged files cost nothing on a re-sync and
//! removed files have their indexed content deleted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ KnowledgeItem│──▶│ TaskFactory │──▶│  Scheduler   │──▶│   Pipeline    │
//! └──────────────┘   └──────┬──────┘   │ caps + FIFO │   └──────┬───────┘
//!                           │          └─────────────┘          │
//!                           ▼                                   ▼
//!                    ┌─────────────┐                 ┌────────────────────┐
//!                    │ SyncEngine  │◀───────────────▶│ MetadataStore      │
//!                    │ (diff dirs) │                 │ IndexBackend       │
//!                    └─────────────┘                 └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Per-item error taxonomy |
//! | [`db`] | Per-base database connection |
//! | [`migrate`] | Schema creation |
//! | [`metadata`] | File fingerprint records |
//! | [`fingerprint`] | Content hashing and path keys |
//! | [`sync`] | Directory diffing |
//! | [`pipeline`] | Per-item units of work and the failure boundary |
//! | [`tasks`] | Items to schedulable tasks |
//! | [`scheduler`] | Admission-controlled run loop |
//! | [`progress`] | Progress reporting |
//! | [`backend`] | Index backend abstraction and the local FTS5 backend |
//! | [`loaders`] | Fetching and reading source content |
//! | [`extract`] | PDF / DOCX / PPTX text extraction |
//! | [`chunk`] | Text chunking |
//! | [`search`] | Reranking and result display |
//! | [`service`] | Knowledge base command surface |

pub mod backend;
pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod loaders;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod search;
pub mod service;
pub mod sync;
pub mod tasks;
