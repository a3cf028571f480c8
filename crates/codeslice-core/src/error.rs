//! Error types reported by the external capabilities.

/// Failure reported by an [`EmbeddingGateway`](crate::embedding::EmbeddingGateway).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmbeddingError {
    /// Network error, timeout, rate limit or server error. Worth retrying.
    #[error("transient embedding failure: {0}")]
    Transient(String),

    /// The provider rejected the input. Retrying the same input will not help.
    #[error("embedding rejected: {0}")]
    Permanent(String),

    /// The provider returned vectors of the wrong shape.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failure reported by a [`VectorStore`](crate::store::VectorStore).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    #[error("vector store rejected request: {0}")]
    Rejected(String),
}
