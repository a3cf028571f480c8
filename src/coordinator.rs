//! Incremental index synchronization.
//!
//! [`IndexCoordinator::sync`] brings the vector store and the manifest of one
//! [`CodebaseContext`] in line with the files on disk, doing only the work the
//! changes require.
//!
//! # Phases
//!
//! ```text
//! Idle → Scanning → Diffing → Embedding → Upserting → Persisting → Idle
//! ```
//!
//! | Phase | Work |
//! |-------|------|
//! | Scanning | walk and hash the codebase on worker threads, build a [`Snapshot`] |
//! | Diffing | check the index signature, retry orphaned deletes, diff against the committed snapshot, read and chunk changed files |
//! | Embedding | embed chunk ids not already in the index, in bounded-concurrency batches with retry |
//! | Upserting | delete chunks of removed files, upsert new chunks, delete chunks that no longer exist |
//! | Persisting | atomically write the new manifest, then publish it to readers |
//!
//! # Consistency
//!
//! The committed manifest is only replaced after every store mutation of the
//! sync has finished, so search never observes a half-applied changeset.
//! A file's snapshot record advances only when all of its chunks made it
//! into the store; otherwise the previous record is kept and the next sync
//! picks the file up again, re-embedding only the chunks still missing.
//! Store keys whose deletion failed, or whose upsert ended in an error, are
//! parked in the manifest's `orphans` map and deleted at the start of the
//! next sync.
//!
//! Cancellation is checked between files and between embedding batches.
//! A cancelled sync still persists every file it completed; a file whose
//! new chunks were not all embedded keeps its previous index entries, and
//! any of its vectors already upserted are deleted again.
//!
//! A file whose content changed between the walk and the read is indexed
//! from what was read, but its snapshot record is withheld so the next
//! sync looks at it again.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use codeslice_core::chunk::Chunker;
use codeslice_core::embedding::{validate_batch, EmbeddingGateway};
use codeslice_core::error::EmbeddingError;
use codeslice_core::merkle::{diff_with_stats, Snapshot};
use codeslice_core::models::{vector_key, Chunk, ChunkId, FileRecord};
use codeslice_core::store::{ChunkMetadata, VectorStore};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, RetryConfig};
use crate::context::{CodebaseContext, SyncPhase};
use crate::error::{IndexError, Result};
use crate::manifest::{ChunkEntry, IndexManifest};
use crate::walker::{ExcludedFile, FileWalker, WalkWarning};

/// A chunk left out of the index because it could not be embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedChunk {
    pub chunk_id: ChunkId,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOperation {
    Upsert,
    Delete,
}

/// A vector-store write that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreFailure {
    pub operation: StoreOperation,
    pub key: String,
    pub path: String,
    pub message: String,
}

/// Wall-clock time spent per phase, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncDurations {
    pub scan_ms: u64,
    pub diff_ms: u64,
    pub embed_ms: u64,
    pub upsert_ms: u64,
    pub persist_ms: u64,
    pub total_ms: u64,
}

/// Outcome of one [`IndexCoordinator::sync`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Generation of the manifest committed by this sync, or of the one
    /// left in place when nothing needed committing.
    pub generation: u64,
    pub committed: bool,
    /// The scope was purged and the index rebuilt from scratch.
    pub rebuilt: bool,
    pub cancelled: bool,

    pub files_added: Vec<String>,
    pub files_modified: Vec<String>,
    pub files_removed: Vec<String>,

    /// Chunks embedded and upserted by this sync.
    pub added_chunks: Vec<ChunkId>,
    /// Chunks of changed files that were already indexed and kept as is.
    pub modified_chunks: Vec<ChunkId>,
    /// Chunks dropped from the index.
    pub removed_chunks: Vec<ChunkId>,
    pub excluded_chunks: Vec<ExcludedChunk>,

    pub excluded_files: Vec<ExcludedFile>,
    /// Files that changed between the walk and the read; revisited on the
    /// next sync.
    pub hash_mismatches: Vec<String>,
    pub warnings: Vec<WalkWarning>,
    pub store_failures: Vec<StoreFailure>,

    pub embedding_calls: usize,
    pub store_writes: usize,
    /// Merkle node pairs compared by the diff.
    pub diff_comparisons: usize,
    pub duration: SyncDurations,
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Resets the published phase to `Idle` on every exit path.
struct PhaseGuard<'a>(&'a CodebaseContext);

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.0.set_phase(SyncPhase::Idle);
    }
}

/// What to do with one added or modified file.
struct FilePlan {
    record: FileRecord,
    chunks: Vec<Chunk>,
    /// Previously indexed ids that the new chunking no longer produces.
    stale: Vec<ChunkId>,
    /// The content read differs from what the walk hashed.
    rehashed: bool,
}

enum EmbedOutcome {
    Vector(Vec<f32>),
    Failed(EmbeddingError),
    /// Cancelled before a result was obtained.
    Abandoned,
}

enum AttemptError {
    Failed(EmbeddingError),
    Cancelled,
}

#[derive(Default)]
struct Embedded {
    vectors: HashMap<ChunkId, Vec<f32>>,
    failures: HashMap<ChunkId, String>,
}

/// Drives syncs of codebases against one embedding gateway and one store.
pub struct IndexCoordinator {
    gateway: Arc<dyn EmbeddingGateway>,
    store: Arc<dyn VectorStore>,
}

impl IndexCoordinator {
    pub fn new(gateway: Arc<dyn EmbeddingGateway>, store: Arc<dyn VectorStore>) -> Self {
        Self { gateway, store }
    }

    /// Sync `ctx` to the current state of its codebase.
    ///
    /// Concurrent calls on the same context run one after another.
    ///
    /// # Errors
    ///
    /// Fails when the codebase cannot be walked, when a required scope purge
    /// fails, or when the manifest cannot be persisted. Per-file read
    /// errors, embedding failures and store write failures do not fail the
    /// sync; they are listed in the [`SyncReport`].
    pub async fn sync(&self, ctx: &CodebaseContext) -> Result<SyncReport> {
        self.sync_with_cancel(ctx, &CancellationToken::new()).await
    }

    /// [`sync`](Self::sync) with cooperative cancellation.
    pub async fn sync_with_cancel(
        &self,
        ctx: &CodebaseContext,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let _lock = ctx.lock_sync().await;
        let _phase = PhaseGuard(ctx);
        let started = Instant::now();
        let mut report = SyncReport::default();

        let outcome = self.run(ctx, cancel, &mut report).await;
        report.duration.total_ms = elapsed_ms(started);

        match outcome {
            Ok(()) => {
                info!(
                    scope = %ctx.scope(),
                    generation = report.generation,
                    committed = report.committed,
                    added = report.added_chunks.len(),
                    removed = report.removed_chunks.len(),
                    excluded = report.excluded_chunks.len(),
                    cancelled = report.cancelled,
                    total_ms = report.duration.total_ms,
                    "Sync finished"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(scope = %ctx.scope(), error = %e, "Sync failed");
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        ctx: &CodebaseContext,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            report.cancelled = true;
            report.generation = ctx.committed().generation;
            return Ok(());
        }

        let config = ctx.config();
        let chunker = Chunker::new(config.chunking.clone());
        let fingerprint = chunker.config().fingerprint();
        let model = self.gateway.model_name().to_string();

        // Scanning
        ctx.set_phase(SyncPhase::Scanning);
        let t = Instant::now();
        let walker =
            Arc::new(FileWalker::new(ctx.root(), &config.walk)?.exclude_dir(ctx.state_dir()));
        let scan_walker = Arc::clone(&walker);
        let outcome = tokio::task::spawn_blocking(move || scan_walker.scan())
            .await
            .map_err(|e| IndexError::Walk(e.to_string()))?;
        report.warnings = outcome.warnings;
        report.excluded_files = outcome.excluded;
        let walked: BTreeMap<String, FileRecord> = outcome
            .records
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();
        let current = Snapshot::build(walked.values().cloned());
        report.duration.scan_ms = elapsed_ms(t);
        debug!(files = current.len(), scan_ms = report.duration.scan_ms, "Scanned codebase");

        // Diffing
        ctx.set_phase(SyncPhase::Diffing);
        let t = Instant::now();
        let mut base = self.prepare_base(ctx, &model, &fingerprint, report).await?;
        let orphans_before = base.orphans.len();
        self.retry_orphans(&mut base, report).await;

        let (changes, stats) = diff_with_stats(&base.snapshot, &current);
        report.diff_comparisons = stats.comparisons;
        let mut removed: BTreeSet<String> = changes.removed.clone();
        removed.extend(
            base.files
                .keys()
                .filter(|p| !current.contains(p))
                .cloned(),
        );
        report.files_added = changes.added.iter().cloned().collect();
        report.files_modified = changes.modified.iter().cloned().collect();
        report.files_removed = removed.iter().cloned().collect();
        debug!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            removed = removed.len(),
            comparisons = stats.comparisons,
            skipped = stats.subtrees_skipped,
            "Diffed snapshots"
        );

        if changes.is_empty() && removed.is_empty() && base.orphans.len() == orphans_before {
            report.generation = base.generation;
            report.duration.diff_ms = elapsed_ms(t);
            info!(scope = %ctx.scope(), generation = base.generation, "Index up to date");
            return Ok(());
        }

        let changed: BTreeSet<&String> = changes.added.iter().chain(&changes.modified).collect();
        let mut plans = Vec::with_capacity(changed.len());
        for path in changed {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let Some(walked_record) = walked.get(path) else {
                continue;
            };
            if let Some(plan) = plan_file(&walker, &chunker, &base, walked_record, report) {
                plans.push(plan);
            }
        }
        report.duration.diff_ms = elapsed_ms(t);

        // Embedding
        ctx.set_phase(SyncPhase::Embedding);
        let t = Instant::now();
        let to_embed: Vec<Chunk> = plans
            .iter()
            .flat_map(|plan| {
                let known: HashSet<&ChunkId> = base.chunk_ids(&plan.record.path).iter().collect();
                plan.chunks
                    .iter()
                    .filter(move |c| !known.contains(&c.id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        let embedded = self.embed_chunks(&to_embed, config, cancel, report).await;
        report.duration.embed_ms = elapsed_ms(t);

        // Upserting
        ctx.set_phase(SyncPhase::Upserting);
        let t = Instant::now();
        let mut records: BTreeMap<String, FileRecord> = base.snapshot.files().clone();
        self.delete_removed(&removed, &mut base, &mut records, cancel, report)
            .await;
        let (upserted, upsert_failed) = self
            .upsert_chunks(ctx.scope(), &to_embed, embedded.vectors, config, &mut base, report)
            .await;
        for plan in plans {
            self.apply_plan(
                plan,
                ctx.scope(),
                &upserted,
                &upsert_failed,
                &embedded.failures,
                &mut base,
                &mut records,
                report,
            )
            .await;
        }
        report.duration.upsert_ms = elapsed_ms(t);

        // Persisting
        ctx.set_phase(SyncPhase::Persisting);
        let t = Instant::now();
        base.snapshot = Snapshot::build(records.into_values());
        base.generation += 1;
        base.updated_at = Some(Utc::now());
        base.save_atomic(&ctx.manifest_path())?;
        report.generation = base.generation;
        report.committed = true;
        ctx.commit(base);
        report.duration.persist_ms = elapsed_ms(t);

        Ok(())
    }

    /// The manifest to diff against, rebuilding the index first when the
    /// committed one cannot be trusted or was built differently.
    async fn prepare_base(
        &self,
        ctx: &CodebaseContext,
        model: &str,
        fingerprint: &str,
        report: &mut SyncReport,
    ) -> Result<IndexManifest> {
        let committed = ctx.committed();

        let mismatch = if committed.generation == 0 {
            None
        } else if committed.root != ctx.root() {
            Some("codebase root changed")
        } else if committed.scope != ctx.scope() {
            Some("scope changed")
        } else if committed.embedding_model != model {
            Some("embedding model changed")
        } else if committed.chunker != fingerprint {
            Some("chunker configuration changed")
        } else {
            None
        };
        let reason = if ctx.needs_rebuild() {
            Some("manifest failed verification")
        } else {
            mismatch
        };

        let Some(reason) = reason else {
            let mut base = (*committed).clone();
            if base.generation == 0 {
                base.root = ctx.root().to_path_buf();
                base.scope = ctx.scope().to_string();
                base.embedding_model = model.to_string();
                base.chunker = fingerprint.to_string();
            }
            return Ok(base);
        };

        info!(scope = %ctx.scope(), reason, "Rebuilding index");
        let mut scopes = BTreeSet::from([ctx.scope().to_string()]);
        if !committed.scope.is_empty() {
            scopes.insert(committed.scope.clone());
        }
        for scope in &scopes {
            let purged = self.store.purge_scope(scope).await?;
            report.store_writes += 1;
            debug!(scope = %scope, purged, "Purged scope");
        }

        let mut fresh = IndexManifest::empty(
            ctx.root().to_path_buf(),
            ctx.scope().to_string(),
            model.to_string(),
            fingerprint.to_string(),
        );
        fresh.generation = committed.generation + 1;
        fresh.updated_at = Some(Utc::now());
        fresh.save_atomic(&ctx.manifest_path())?;
        ctx.commit(fresh.clone());
        ctx.clear_rebuild();
        report.rebuilt = true;
        Ok(fresh)
    }

    async fn retry_orphans(&self, base: &mut IndexManifest, report: &mut SyncReport) {
        if base.orphans.is_empty() {
            return;
        }
        let orphans = std::mem::take(&mut base.orphans);
        for (key, path) in orphans {
            match self.store.delete(&key).await {
                Ok(()) => {
                    report.store_writes += 1;
                    debug!(key = %key, file = %path, "Deleted orphaned vector");
                }
                Err(e) => {
                    report.store_failures.push(StoreFailure {
                        operation: StoreOperation::Delete,
                        key: key.clone(),
                        path: path.clone(),
                        message: e.to_string(),
                    });
                    base.orphans.insert(key, path);
                }
            }
        }
    }

    /// Remove an indexed chunk from the manifest and its vector from the store.
    async fn drop_chunk(
        &self,
        id: ChunkId,
        base: &mut IndexManifest,
        report: &mut SyncReport,
    ) {
        let Some(entry) = base.chunks.remove(&id) else {
            return;
        };
        self.discard_vector(entry.key, entry.path, base, report).await;
        report.removed_chunks.push(id);
    }

    /// Delete a vector; on failure the key is kept as an orphan.
    async fn discard_vector(
        &self,
        key: String,
        path: String,
        base: &mut IndexManifest,
        report: &mut SyncReport,
    ) {
        match self.store.delete(&key).await {
            Ok(()) => report.store_writes += 1,
            Err(e) => {
                warn!(
                    file = %path,
                    key = %key,
                    error = %e,
                    "Vector delete failed; keeping as orphan"
                );
                report.store_failures.push(StoreFailure {
                    operation: StoreOperation::Delete,
                    key: key.clone(),
                    path: path.clone(),
                    message: e.to_string(),
                });
                base.orphans.insert(key, path);
            }
        }
    }

    async fn delete_removed(
        &self,
        removed: &BTreeSet<String>,
        base: &mut IndexManifest,
        records: &mut BTreeMap<String, FileRecord>,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) {
        for path in removed {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let ids = base.files.remove(path).unwrap_or_default();
            debug!(file = %path, chunks = ids.len(), "Removing file from index");
            for id in ids {
                self.drop_chunk(id, base, report).await;
            }
            records.remove(path);
        }
    }

    async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        config: &Config,
        cancel: &CancellationToken,
        report: &mut SyncReport,
    ) -> Embedded {
        let mut embedded = Embedded::default();
        if chunks.is_empty() {
            return embedded;
        }

        let semaphore = Arc::new(Semaphore::new(config.embedding.max_concurrency.max(1)));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut tasks = JoinSet::new();

        for batch in chunks.chunks(config.embedding.batch_size.max(1)) {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let gateway = Arc::clone(&self.gateway);
            let retry = config.retry.clone();
            let cancel = cancel.clone();
            let calls = Arc::clone(&calls);
            let batch: Vec<(ChunkId, String)> =
                batch.iter().map(|c| (c.id.clone(), c.text.clone())).collect();
            tasks.spawn(async move {
                let _permit = permit;
                embed_batch(gateway.as_ref(), &retry, batch, &cancel, &calls).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcomes) => {
                    for (id, outcome) in outcomes {
                        match outcome {
                            EmbedOutcome::Vector(v) => {
                                embedded.vectors.insert(id, v);
                            }
                            EmbedOutcome::Failed(e) => {
                                embedded.failures.insert(id, e.to_string());
                            }
                            EmbedOutcome::Abandoned => report.cancelled = true,
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Embedding task failed"),
            }
        }

        report.embedding_calls += calls.load(Ordering::SeqCst);
        debug!(
            requested = chunks.len(),
            embedded = embedded.vectors.len(),
            failed = embedded.failures.len(),
            "Embedding finished"
        );
        embedded
    }

    /// Upsert every embedded chunk. Returns the ids that were stored and the
    /// ids whose upsert failed.
    async fn upsert_chunks(
        &self,
        scope: &str,
        chunks: &[Chunk],
        mut vectors: HashMap<ChunkId, Vec<f32>>,
        config: &Config,
        base: &mut IndexManifest,
        report: &mut SyncReport,
    ) -> (HashSet<ChunkId>, HashSet<ChunkId>) {
        let semaphore = Arc::new(Semaphore::new(config.index.upsert_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        for chunk in chunks {
            let Some(vector) = vectors.remove(&chunk.id) else {
                continue;
            };
            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                break;
            };
            let key = vector_key(scope, &chunk.id);
            let metadata = ChunkMetadata {
                scope: scope.to_string(),
                chunk_id: chunk.id.clone(),
                path: chunk.path.clone(),
                chunk_index: chunk.chunk_index,
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                content_hash: chunk.hash,
                text: chunk.text.clone(),
            };
            let store = Arc::clone(&self.store);
            tasks.spawn(async move {
                let _permit = permit;
                let result = store.upsert(&key, &vector, &metadata).await;
                (metadata, key, result)
            });
        }

        let mut stored = HashSet::new();
        let mut failed = HashSet::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((metadata, _key, Ok(()))) => {
                    report.store_writes += 1;
                    stored.insert(metadata.chunk_id);
                }
                Ok((metadata, key, Err(e))) => {
                    warn!(file = %metadata.path, key = %key, error = %e, "Vector upsert failed");
                    report.store_failures.push(StoreFailure {
                        operation: StoreOperation::Upsert,
                        key: key.clone(),
                        path: metadata.path.clone(),
                        message: e.to_string(),
                    });
                    // The write may have landed anyway.
                    base.orphans.insert(key, metadata.path);
                    failed.insert(metadata.chunk_id);
                }
                Err(e) => warn!(error = %e, "Upsert task failed"),
            }
        }
        (stored, failed)
    }

    /// Fold one file's results into the working manifest.
    #[allow(clippy::too_many_arguments)]
    async fn apply_plan(
        &self,
        plan: FilePlan,
        scope: &str,
        upserted: &HashSet<ChunkId>,
        upsert_failed: &HashSet<ChunkId>,
        embed_failures: &HashMap<ChunkId, String>,
        base: &mut IndexManifest,
        records: &mut BTreeMap<String, FileRecord>,
        report: &mut SyncReport,
    ) {
        let path = plan.record.path.clone();
        let known: HashSet<ChunkId> = base.chunk_ids(&path).iter().cloned().collect();

        let unfinished = report.cancelled
            && plan.chunks.iter().any(|c| {
                !known.contains(&c.id)
                    && !upserted.contains(&c.id)
                    && !upsert_failed.contains(&c.id)
                    && !embed_failures.contains_key(&c.id)
            });
        if unfinished {
            debug!(
                file = %path,
                "Cancelled before the file was embedded; keeping previous entries"
            );
            for chunk in plan.chunks.iter().filter(|c| upserted.contains(&c.id)) {
                self.discard_vector(vector_key(scope, &chunk.id), path.clone(), base, report)
                    .await;
            }
            return;
        }

        let mut present = Vec::with_capacity(plan.chunks.len());

        for chunk in &plan.chunks {
            if known.contains(&chunk.id) {
                present.push(chunk.id.clone());
                report.modified_chunks.push(chunk.id.clone());
            } else if upserted.contains(&chunk.id) {
                let key = vector_key(scope, &chunk.id);
                base.orphans.remove(&key);
                base.chunks.insert(
                    chunk.id.clone(),
                    ChunkEntry {
                        key,
                        path: path.clone(),
                        chunk_index: chunk.chunk_index,
                        start_line: chunk.start_line,
                        end_line: chunk.end_line,
                        content_hash: chunk.hash,
                    },
                );
                present.push(chunk.id.clone());
                report.added_chunks.push(chunk.id.clone());
            } else if upsert_failed.contains(&chunk.id) {
                // already listed in store_failures
            } else if let Some(reason) = embed_failures.get(&chunk.id) {
                warn!(file = %path, chunk = chunk.chunk_index, reason = %reason, "Excluding chunk");
                report.excluded_chunks.push(ExcludedChunk {
                    chunk_id: chunk.id.clone(),
                    path: path.clone(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    reason: reason.clone(),
                });
            } else {
                report.excluded_chunks.push(ExcludedChunk {
                    chunk_id: chunk.id.clone(),
                    path: path.clone(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    reason: "embedding did not complete".to_string(),
                });
            }
        }

        for id in plan.stale {
            self.drop_chunk(id, base, report).await;
        }

        let complete = present.len() == plan.chunks.len();
        if present.is_empty() {
            base.files.remove(&path);
        } else {
            base.files.insert(path.clone(), present);
        }
        // Without a snapshot record the next diff reports the file as added,
        // whatever its content is by then.
        if complete && !plan.rehashed {
            records.insert(path, plan.record);
        } else {
            if !complete {
                debug!(file = %path, "File partially indexed; will retry on next sync");
            }
            records.remove(&path);
        }
    }
}

/// Read and chunk one changed file.
fn plan_file(
    walker: &FileWalker,
    chunker: &Chunker,
    base: &IndexManifest,
    walked: &FileRecord,
    report: &mut SyncReport,
) -> Option<FilePlan> {
    let (text, actual) = match walker.read_text(&walked.path) {
        Ok(read) => read,
        Err(e) => {
            warn!(file = %walked.path, error = %e, "Skipping unreadable file");
            report.warnings.push(WalkWarning::from_error(walked.path.clone(), &e));
            return None;
        }
    };

    let rehashed = actual != walked.hash;
    let record = if rehashed {
        let err = IndexError::HashMismatch {
            path: walked.path.clone(),
            expected: walked.hash,
            actual,
        };
        warn!(file = %walked.path, error = %err, "Re-hashing file that changed during sync");
        report.warnings.push(WalkWarning::from_error(walked.path.clone(), &err));
        report.hash_mismatches.push(walked.path.clone());
        FileRecord {
            hash: actual,
            size: text.len() as u64,
            ..walked.clone()
        }
    } else {
        walked.clone()
    };

    let chunks = chunker.chunk(&record, &text);
    let new_ids: HashSet<&ChunkId> = chunks.iter().map(|c| &c.id).collect();
    let stale = base
        .chunk_ids(&record.path)
        .iter()
        .filter(|id| !new_ids.contains(id))
        .cloned()
        .collect();

    debug!(file = %record.path, chunks = chunks.len(), "Chunked file");
    Some(FilePlan {
        record,
        chunks,
        stale,
        rehashed,
    })
}

/// Embed one batch. A batch the provider rejects outright is retried one
/// chunk at a time so a single bad input only excludes itself.
async fn embed_batch(
    gateway: &dyn EmbeddingGateway,
    retry: &RetryConfig,
    batch: Vec<(ChunkId, String)>,
    cancel: &CancellationToken,
    calls: &AtomicUsize,
) -> Vec<(ChunkId, EmbedOutcome)> {
    let texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
    match embed_with_retry(gateway, retry, &texts, cancel, calls).await {
        Ok(vectors) => batch
            .into_iter()
            .zip(vectors)
            .map(|((id, _), v)| (id, EmbedOutcome::Vector(v)))
            .collect(),
        Err(AttemptError::Cancelled) => batch
            .into_iter()
            .map(|(id, _)| (id, EmbedOutcome::Abandoned))
            .collect(),
        Err(AttemptError::Failed(e)) if !e.is_transient() && batch.len() > 1 => {
            debug!(size = batch.len(), error = %e, "Batch rejected; embedding chunks individually");
            let mut out = Vec::with_capacity(batch.len());
            for (id, text) in batch {
                let single = std::slice::from_ref(&text);
                let outcome = match embed_with_retry(gateway, retry, single, cancel, calls).await {
                    Ok(mut v) => match v.pop() {
                        Some(vector) => EmbedOutcome::Vector(vector),
                        None => EmbedOutcome::Failed(EmbeddingError::Permanent(
                            "empty embedding response".to_string(),
                        )),
                    },
                    Err(AttemptError::Cancelled) => EmbedOutcome::Abandoned,
                    Err(AttemptError::Failed(e)) => EmbedOutcome::Failed(e),
                };
                out.push((id, outcome));
            }
            out
        }
        Err(AttemptError::Failed(e)) => {
            warn!(size = batch.len(), error = %e, "Embedding batch failed after retries");
            batch
                .into_iter()
                .map(|(id, _)| (id, EmbedOutcome::Failed(e.clone())))
                .collect()
        }
    }
}

async fn embed_with_retry(
    gateway: &dyn EmbeddingGateway,
    retry: &RetryConfig,
    texts: &[String],
    cancel: &CancellationToken,
    calls: &AtomicUsize,
) -> std::result::Result<Vec<Vec<f32>>, AttemptError> {
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        calls.fetch_add(1, Ordering::SeqCst);
        let result = gateway.embed_batch(texts).await.and_then(|vectors| {
            if gateway.dims() > 0 {
                validate_batch(&vectors, texts.len(), gateway.dims())?;
            } else if vectors.len() != texts.len() {
                return Err(EmbeddingError::Permanent(format!(
                    "expected {} vectors, got {}",
                    texts.len(),
                    vectors.len()
                )));
            }
            Ok(vectors)
        });

        match result {
            Ok(vectors) => return Ok(vectors),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                let delay = retry.backoff(attempt);
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient embedding failure; backing off"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                }
                attempt += 1;
            }
            Err(e) => return Err(AttemptError::Failed(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use codeslice_core::models::ContentHash;
    use codeslice_core::store::memory::InMemoryVectorStore;
    use std::sync::atomic::AtomicU32;

    struct Flaky {
        failures_left: AtomicU32,
        error: EmbeddingError,
    }

    #[async_trait]
    impl EmbeddingGateway for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }

        fn dims(&self) -> usize {
            2
        }

        async fn embed_batch(
            &self,
            texts: &[String],
        ) -> std::result::Result<Vec<Vec<f32>>, EmbeddingError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            if texts.iter().any(|t| t.contains("poison")) {
                return Err(EmbeddingError::Permanent("bad input".to_string()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        }
    }

    fn batch(texts: &[&str]) -> Vec<(ChunkId, String)> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| (format!("c{i}"), t.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let gateway = Flaky {
            failures_left: AtomicU32::new(2),
            error: EmbeddingError::Transient("503".to_string()),
        };
        let calls = AtomicUsize::new(0);
        let out = embed_batch(
            &gateway,
            &fast_retry(5),
            batch(&["a", "b"]),
            &CancellationToken::new(),
            &calls,
        )
        .await;
        assert!(out.iter().all(|(_, o)| matches!(o, EmbedOutcome::Vector(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_whole_batch() {
        let gateway = Flaky {
            failures_left: AtomicU32::new(100),
            error: EmbeddingError::Transient("timeout".to_string()),
        };
        let calls = AtomicUsize::new(0);
        let out = embed_batch(
            &gateway,
            &fast_retry(3),
            batch(&["a", "b"]),
            &CancellationToken::new(),
            &calls,
        )
        .await;
        assert!(out.iter().all(|(_, o)| matches!(o, EmbedOutcome::Failed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_isolates_bad_chunk() {
        let gateway = Flaky {
            failures_left: AtomicU32::new(0),
            error: EmbeddingError::Transient(String::new()),
        };
        let calls = AtomicUsize::new(0);
        let out = embed_batch(
            &gateway,
            &fast_retry(3),
            batch(&["fine", "poison", "also fine"]),
            &CancellationToken::new(),
            &calls,
        )
        .await;
        let failed: Vec<&str> = out
            .iter()
            .filter(|(_, o)| matches!(o, EmbedOutcome::Failed(_)))
            .map(|(id, _)| id.as_str())
            .collect();
        assert_eq!(failed, vec!["c1"]);
        // one batch call + three single-chunk calls
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_file_changed_after_walk_is_revisited() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.txt"), "first version\n").unwrap();
        let config = Config::default();
        let walker = FileWalker::new(tmp.path(), &config.walk).unwrap();
        let walked = walker.scan().records.remove(0);

        // edited after the walk hashed it
        std::fs::write(tmp.path().join("a.txt"), "second version\n").unwrap();

        let chunker = Chunker::new(config.chunking.clone());
        let mut base = IndexManifest::empty(
            tmp.path().to_path_buf(),
            "scope".to_string(),
            "flaky".to_string(),
            chunker.config().fingerprint(),
        );
        let mut report = SyncReport::default();
        let plan = plan_file(&walker, &chunker, &base, &walked, &mut report).unwrap();
        assert!(plan.rehashed);
        assert_eq!(plan.record.hash, ContentHash::of(b"second version\n"));
        assert!(plan.chunks[0].text.contains("second version"));
        assert_eq!(report.hash_mismatches, vec!["a.txt"]);
        assert_eq!(report.warnings.len(), 1);

        let coordinator = IndexCoordinator::new(
            Arc::new(Flaky {
                failures_left: AtomicU32::new(0),
                error: EmbeddingError::Transient(String::new()),
            }),
            Arc::new(InMemoryVectorStore::new()),
        );
        let upserted: HashSet<ChunkId> = plan.chunks.iter().map(|c| c.id.clone()).collect();
        let mut records = BTreeMap::from([(walked.path.clone(), walked.clone())]);
        coordinator
            .apply_plan(
                plan,
                "scope",
                &upserted,
                &HashSet::new(),
                &HashMap::new(),
                &mut base,
                &mut records,
                &mut report,
            )
            .await;

        // indexed from what was read, but not recorded as up to date
        assert_eq!(base.chunk_ids("a.txt").len(), 1);
        assert!(!records.contains_key("a.txt"));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_abandons_batch() {
        let gateway = Flaky {
            failures_left: AtomicU32::new(100),
            error: EmbeddingError::Transient("429".to_string()),
        };
        let retry = RetryConfig {
            max_attempts: 5,
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
            multiplier: 1.0,
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicUsize::new(0);
        let out = embed_batch(&gateway, &retry, batch(&["a"]), &cancel, &calls).await;
        assert!(matches!(out[0].1, EmbedOutcome::Abandoned));
    }
}
