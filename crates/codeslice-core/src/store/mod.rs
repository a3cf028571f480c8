//! Vector store abstraction.
//!
//! The [`VectorStore`] trait is the only view the indexer and retriever have
//! of vector persistence, so any backend that can upsert, delete and rank by
//! distance with a metadata filter can be plugged in.
//!
//! Every entry carries a `scope` tag naming the codebase it belongs to.
//! Filters always include a scope, which lets several indexed codebases
//! share one store without seeing each other's chunks.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::ContentHash;

/// Payload stored next to each vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub scope: String,
    pub chunk_id: String,
    pub path: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub content_hash: ContentHash,
    pub text: String,
}

/// Restricts a query to one scope and, optionally, one file or directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub scope: String,
    /// Matched by whole path components: `src/db` matches `src/db` and
    /// `src/db/pool.rs` but not `src/db.rs`.
    pub path_prefix: Option<String>,
}

impl MetadataFilter {
    pub fn scope(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            path_prefix: None,
        }
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn matches(&self, meta: &ChunkMetadata) -> bool {
        meta.scope == self.scope
            && self
                .path_prefix
                .as_deref()
                .map_or(true, |p| path_has_prefix(&meta.path, p))
    }
}

/// Component-wise prefix test on `/`-separated relative paths.
pub fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// One ranked query result. Lower `distance` is closer.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatch {
    pub key: String,
    pub distance: f32,
    pub metadata: ChunkMetadata,
}

/// A vector read back by key.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub key: String,
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// Abstract vector index.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert`](VectorStore::upsert) | Insert or replace the vector under `key` (idempotent per key) |
/// | [`delete`](VectorStore::delete) | Remove `key`; deleting a missing key succeeds |
/// | [`get`](VectorStore::get) | The vector and payload stored under `key`, if any |
/// | [`query`](VectorStore::query) | Up to `top_n` matches ordered by ascending cosine distance |
/// | [`purge_scope`](VectorStore::purge_scope) | Remove every entry of a scope |
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        key: &str,
        vector: &[f32],
        metadata: &ChunkMetadata,
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<StoredVector>, StoreError>;

    async fn query(
        &self,
        vector: &[f32],
        top_n: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorMatch>, StoreError>;

    /// Returns the number of entries removed.
    async fn purge_scope(&self, scope: &str) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(scope: &str, path: &str) -> ChunkMetadata {
        ChunkMetadata {
            scope: scope.to_string(),
            chunk_id: "c".to_string(),
            path: path.to_string(),
            chunk_index: 0,
            start_line: 1,
            end_line: 1,
            content_hash: ContentHash::of(b""),
            text: String::new(),
        }
    }

    #[test]
    fn test_path_prefix_is_component_wise() {
        assert!(path_has_prefix("src/db/pool.rs", "src/db"));
        assert!(path_has_prefix("src/db/pool.rs", "src/db/"));
        assert!(path_has_prefix("src/db.rs", "src/db.rs"));
        assert!(!path_has_prefix("src/db.rs", "src/db"));
        assert!(!path_has_prefix("srcx/a.rs", "src"));
        assert!(path_has_prefix("anything", ""));
    }

    #[test]
    fn test_filter_requires_scope() {
        let filter = MetadataFilter::scope("a").with_path_prefix("src");
        assert!(filter.matches(&meta("a", "src/x.rs")));
        assert!(!filter.matches(&meta("b", "src/x.rs")));
        assert!(!filter.matches(&meta("a", "tests/x.rs")));
    }
}
