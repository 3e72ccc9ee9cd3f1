//! Errors raised inside a single task item's unit of work.
//!
//! These never reach the scheduler: [`crate::pipeline::guarded`] logs them
//! and converts them into the error sentinel [`crate::models::LoaderReturn`].

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Unreadable file or failed stream.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The index backend rejected an add or delete call.
    #[error("index backend error: {0:#}")]
    Backend(anyhow::Error),

    /// The metadata store failed a read or write.
    #[error("metadata store error: {0}")]
    Metadata(#[from] sqlx::Error),
}

impl IngestError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IngestError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short label used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::Io { .. } => "io",
            IngestError::Backend(_) => "backend",
            IngestError::Metadata(_) => "metadata",
        }
    }
}
