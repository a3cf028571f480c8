//! Hybrid semantic search over a committed index.
//!
//! [`RetrievalEngine::search`] embeds the query, asks the vector store for
//! an over-fetched candidate set within the codebase's scope, drops anything
//! the committed manifest does not know about, and re-ranks the rest with
//! the keyword boost from [`codeslice_core::search`].
//!
//! [`RetrievalEngine::search_related`] does the same starting from the
//! stored vector of an indexed chunk instead of a query embedding.
//!
//! Search only ever reads the last committed manifest, so it runs
//! concurrently with a sync and never observes a partial changeset.
//! Failures degrade to an empty result with a logged warning.

use std::sync::Arc;

use codeslice_core::embedding::EmbeddingGateway;
use codeslice_core::error::StoreError;
use codeslice_core::search::{rerank, BoostConfig, Candidate, SearchHit};
use codeslice_core::store::{MetadataFilter, VectorStore};
use tracing::{debug, warn};

use crate::context::CodebaseContext;
use crate::manifest::IndexManifest;

/// Per-query knobs.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Restrict results to files under this relative path.
    pub path_prefix: Option<String>,
    /// Overrides the context's `[retrieval]` configuration.
    pub boost: Option<BoostConfig>,
}

impl SearchOptions {
    fn filter(&self, scope: &str) -> MetadataFilter {
        let filter = MetadataFilter::scope(scope);
        match &self.path_prefix {
            Some(prefix) => filter.with_path_prefix(prefix.clone()),
            None => filter,
        }
    }
}

pub struct RetrievalEngine {
    gateway: Arc<dyn EmbeddingGateway>,
    store: Arc<dyn VectorStore>,
}

impl RetrievalEngine {
    pub fn new(gateway: Arc<dyn EmbeddingGateway>, store: Arc<dyn VectorStore>) -> Self {
        Self { gateway, store }
    }

    /// Up to `k` chunks of the codebase most relevant to `query`, best first.
    pub async fn search(
        &self,
        ctx: &CodebaseContext,
        query: &str,
        k: usize,
        options: &SearchOptions,
    ) -> Vec<SearchHit> {
        if k == 0 || query.trim().is_empty() {
            return Vec::new();
        }
        let Some(manifest) = self.searchable_manifest(ctx) else {
            return Vec::new();
        };
        let boost = options
            .boost
            .as_ref()
            .unwrap_or(&ctx.config().retrieval);

        let query_vec = match self.gateway.embed(query).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Query embedding failed");
                return Vec::new();
            }
        };

        let filter = options.filter(ctx.scope());
        let wanted = boost.candidate_count(k);
        match self
            .committed_candidates(&manifest, &query_vec, &filter, wanted, None)
            .await
        {
            Ok(candidates) => rerank(query, candidates, boost, k),
            Err(e) => {
                warn!(error = %e, "Vector store query failed");
                Vec::new()
            }
        }
    }

    /// Up to `k` chunks most similar to the indexed chunk `chunk_id`,
    /// excluding the chunk itself.
    ///
    /// Returns nothing when `chunk_id` is not in the committed index.
    pub async fn search_related(
        &self,
        ctx: &CodebaseContext,
        chunk_id: &str,
        k: usize,
        options: &SearchOptions,
    ) -> Vec<SearchHit> {
        if k == 0 {
            return Vec::new();
        }
        let Some(manifest) = self.searchable_manifest(ctx) else {
            return Vec::new();
        };
        let Some(entry) = manifest.chunk(chunk_id) else {
            debug!(chunk = %chunk_id, "Chunk not in committed index");
            return Vec::new();
        };
        let boost = options
            .boost
            .as_ref()
            .unwrap_or(&ctx.config().retrieval);

        let stored = match self.store.get(&entry.key).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                warn!(
                    chunk = %chunk_id,
                    key = %entry.key,
                    "Indexed chunk missing from vector store"
                );
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "Vector store lookup failed");
                return Vec::new();
            }
        };

        let filter = options.filter(ctx.scope());
        let wanted = boost.candidate_count(k);
        match self
            .committed_candidates(&manifest, &stored.vector, &filter, wanted, Some(chunk_id))
            .await
        {
            Ok(candidates) => rerank(&stored.metadata.text, candidates, boost, k),
            Err(e) => {
                warn!(error = %e, "Vector store query failed");
                Vec::new()
            }
        }
    }

    /// The committed manifest, if it has chunks embedded with this engine's
    /// model.
    fn searchable_manifest(&self, ctx: &CodebaseContext) -> Option<Arc<IndexManifest>> {
        let manifest = ctx.committed();
        if manifest.chunk_count() == 0 {
            return None;
        }
        if manifest.embedding_model != self.gateway.model_name() {
            warn!(
                indexed_with = %manifest.embedding_model,
                gateway = %self.gateway.model_name(),
                "Index was built with a different embedding model; sync to rebuild"
            );
            return None;
        }
        Some(manifest)
    }

    /// Nearest committed chunks to `vector`.
    ///
    /// The store may hold vectors the manifest does not list (a sync in
    /// flight, orphans awaiting deletion), so the fetch widens until
    /// `wanted` committed candidates are found or the store runs out.
    async fn committed_candidates(
        &self,
        manifest: &IndexManifest,
        vector: &[f32],
        filter: &MetadataFilter,
        wanted: usize,
        exclude: Option<&str>,
    ) -> Result<Vec<Candidate>, StoreError> {
        let mut top_n = wanted;
        loop {
            let matches = self.store.query(vector, top_n, filter).await?;
            let fetched = matches.len();
            let candidates: Vec<Candidate> = matches
                .into_iter()
                .filter(|m| exclude != Some(m.metadata.chunk_id.as_str()))
                .filter(|m| {
                    manifest
                        .chunk(&m.metadata.chunk_id)
                        .is_some_and(|entry| entry.key == m.key)
                })
                .map(|m| Candidate {
                    chunk_id: m.metadata.chunk_id,
                    path: m.metadata.path,
                    start_line: m.metadata.start_line,
                    end_line: m.metadata.end_line,
                    text: m.metadata.text,
                    distance: m.distance,
                })
                .collect();

            if candidates.len() >= wanted || fetched < top_n {
                debug!(
                    fetched,
                    committed = candidates.len(),
                    requested = top_n,
                    "Collected search candidates"
                );
                return Ok(candidates);
            }
            top_n = top_n.saturating_mul(2);
        }
    }
}
