//! In-memory [`VectorStore`] for tests and ephemeral indexes.
//!
//! Entries live in a `BTreeMap` behind a `parking_lot::RwLock`; queries are
//! brute-force cosine distance over every entry in the filtered scope.
//! A write counter and an offline switch make sync behaviour observable
//! from tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::embedding::cosine_distance;
use crate::error::StoreError;

use super::{ChunkMetadata, MetadataFilter, StoredVector, VectorMatch, VectorStore};

struct Entry {
    vector: Vec<f32>,
    metadata: ChunkMetadata,
}

/// In-memory vector store.
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: RwLock<BTreeMap<String, Entry>>,
    writes: AtomicUsize,
    offline: AtomicBool,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful upserts, deletes and purges so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// While offline, every operation fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Keys currently held for `scope`, in key order.
    pub fn keys(&self, scope: &str) -> Vec<String> {
        self.entries
            .read()
            .iter()
            .filter(|(_, e)| e.metadata.scope == scope)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn metadata(&self, key: &str) -> Option<ChunkMetadata> {
        self.entries.read().get(key).map(|e| e.metadata.clone())
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        key: &str,
        vector: &[f32],
        metadata: &ChunkMetadata,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        if vector.is_empty() {
            return Err(StoreError::Rejected("empty vector".to_string()));
        }
        self.entries.write().insert(
            key.to_string(),
            Entry {
                vector: vector.to_vec(),
                metadata: metadata.clone(),
            },
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.entries.write().remove(key);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<StoredVector>, StoreError> {
        self.check_online()?;
        Ok(self.entries.read().get(key).map(|e| StoredVector {
            key: key.to_string(),
            vector: e.vector.clone(),
            metadata: e.metadata.clone(),
        }))
    }

    async fn query(
        &self,
        vector: &[f32],
        top_n: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<VectorMatch>, StoreError> {
        self.check_online()?;
        if top_n == 0 {
            return Ok(Vec::new());
        }
        let entries = self.entries.read();
        let mut matches: Vec<VectorMatch> = entries
            .iter()
            .filter(|(_, e)| filter.matches(&e.metadata))
            .map(|(key, e)| VectorMatch {
                key: key.clone(),
                distance: cosine_distance(vector, &e.vector),
                metadata: e.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        matches.truncate(top_n);
        Ok(matches)
    }

    async fn purge_scope(&self, scope: &str) -> Result<usize, StoreError> {
        self.check_online()?;
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.metadata.scope != scope);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(before - entries.len())
    }
}
