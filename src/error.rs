//! Error type for indexing and retrieval.

use std::path::PathBuf;

use codeslice_core::error::{EmbeddingError, StoreError};
use codeslice_core::models::ContentHash;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("symlink cycle at {}", path.display())]
    SymlinkCycle { path: PathBuf },

    /// File content read for chunking differs from what the walk hashed.
    #[error("content of {path} changed during sync (expected {expected}, found {actual})")]
    HashMismatch {
        path: String,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("manifest {} is unusable: {reason}", path.display())]
    ManifestCorrupt { path: PathBuf, reason: String },

    #[error("failed to persist manifest {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("walk failed: {0}")]
    Walk(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl IndexError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
