//! Per-codebase state shared by sync and search.
//!
//! A [`CodebaseContext`] is the explicit handle for one indexed codebase.
//! Several contexts can live in one process and index different codebases
//! concurrently, even against a shared vector store, because each carries
//! its own scope tag, manifest and sync lock.
//!
//! | Field | Guard | Used by |
//! |-------|-------|---------|
//! | sync lock | `tokio::sync::Mutex` | held for the whole of one sync |
//! | committed manifest | `parking_lot::RwLock<Arc<_>>` | swapped on commit; readers clone the `Arc` |
//! | phase | `tokio::sync::watch` | progress observers |

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{IndexError, Result};
use crate::manifest::IndexManifest;

/// Where a sync currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Scanning,
    Diffing,
    Embedding,
    Upserting,
    Persisting,
}

pub struct CodebaseContext {
    root: PathBuf,
    scope: String,
    state_dir: PathBuf,
    config: Config,
    sync_lock: Mutex<()>,
    committed: RwLock<Arc<IndexManifest>>,
    phase: watch::Sender<SyncPhase>,
    /// Set when the stored manifest was unusable; the next sync purges the
    /// scope before rebuilding.
    needs_rebuild: AtomicBool,
}

/// Scope tag derived from the canonical root path.
pub fn default_scope(root: &Path) -> String {
    let digest = Sha256::digest(root.to_string_lossy().as_bytes());
    format!("cs-{}", &hex::encode(digest)[..16])
}

impl CodebaseContext {
    /// Open the context for the codebase at `root`, loading its manifest.
    ///
    /// A missing manifest starts an empty index. A corrupt one is logged and
    /// replaced by an empty index that the next sync rebuilds from scratch.
    ///
    /// # Errors
    ///
    /// [`IndexError::Io`] when the root cannot be resolved or the manifest
    /// cannot be read at all.
    pub fn open(root: &Path, config: Config) -> Result<Self> {
        let root = root.canonicalize().map_err(|e| IndexError::io(root, e))?;
        let scope = config
            .index
            .scope
            .clone()
            .unwrap_or_else(|| default_scope(&root));
        let state_dir = if config.index.state_dir.is_absolute() {
            config.index.state_dir.clone()
        } else {
            root.join(&config.index.state_dir)
        };
        let manifest_path = IndexManifest::path_in(&state_dir);

        let empty =
            || IndexManifest::empty(root.clone(), scope.clone(), String::new(), String::new());
        let (manifest, needs_rebuild) = match IndexManifest::load(&manifest_path) {
            Ok(Some(m)) => (m, false),
            Ok(None) => (empty(), false),
            Err(IndexError::ManifestCorrupt { path, reason }) => {
                warn!(
                    manifest = %path.display(),
                    reason = %reason,
                    "Manifest failed verification; the next sync rebuilds the index"
                );
                (empty(), true)
            }
            Err(e) => return Err(e),
        };

        info!(
            root = %root.display(),
            scope = %scope,
            generation = manifest.generation,
            chunks = manifest.chunk_count(),
            "Opened codebase"
        );

        let (phase, _) = watch::channel(SyncPhase::Idle);
        Ok(Self {
            root,
            scope,
            state_dir,
            config,
            sync_lock: Mutex::new(()),
            committed: RwLock::new(Arc::new(manifest)),
            phase,
            needs_rebuild: AtomicBool::new(needs_rebuild),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn manifest_path(&self) -> PathBuf {
        IndexManifest::path_in(&self.state_dir)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The last committed manifest. Never blocks on a running sync.
    pub fn committed(&self) -> Arc<IndexManifest> {
        Arc::clone(&self.committed.read())
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    /// Observe phase changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub(crate) fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }

    pub(crate) async fn lock_sync(&self) -> MutexGuard<'_, ()> {
        self.sync_lock.lock().await
    }

    pub(crate) fn commit(&self, manifest: IndexManifest) {
        *self.committed.write() = Arc::new(manifest);
    }

    pub(crate) fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_rebuild(&self) {
        self.needs_rebuild.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scope_derivation() {
        let tmp = TempDir::new().unwrap();
        let ctx = CodebaseContext::open(tmp.path(), Config::default()).unwrap();
        assert_eq!(ctx.scope(), default_scope(ctx.root()));
        assert!(ctx.scope().starts_with("cs-"));
        assert_eq!(ctx.state_dir(), ctx.root().join(".codeslice"));
        assert_eq!(ctx.committed().generation, 0);
        assert_eq!(ctx.phase(), SyncPhase::Idle);

        let mut config = Config::default();
        config.index.scope = Some("mine".to_string());
        let ctx = CodebaseContext::open(tmp.path(), config).unwrap();
        assert_eq!(ctx.scope(), "mine");
    }

    #[test]
    fn test_corrupt_manifest_requests_rebuild() {
        let tmp = TempDir::new().unwrap();
        let state = tmp.path().join(".codeslice");
        std::fs::create_dir_all(&state).unwrap();
        std::fs::write(IndexManifest::path_in(&state), b"{ not json").unwrap();

        let ctx = CodebaseContext::open(tmp.path(), Config::default()).unwrap();
        assert!(ctx.needs_rebuild());
        assert_eq!(ctx.committed().chunk_count(), 0);
    }
}
