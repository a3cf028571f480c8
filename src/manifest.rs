//! Persisted index state.
//!
//! The [`IndexManifest`] records what the vector store holds for one
//! codebase: the snapshot the index was built from, the ordered chunk ids of
//! every file, the store key of every chunk, and keys whose deletion is
//! still outstanding.
//!
//! # On-disk format
//!
//! ```json
//! { "checksum": "<sha256 of the serialized payload>", "payload": { "version": 1, ... } }
//! ```
//!
//! Writes go to `manifest.json.tmp`, are synced, then renamed over
//! `manifest.json`, so readers only ever see a complete previous or a
//! complete new manifest. On load the checksum, the format version and the
//! snapshot root hash are all verified; any failure yields
//! [`IndexError::ManifestCorrupt`].

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use codeslice_core::merkle::Snapshot;
use codeslice_core::models::{ChunkId, ContentHash, FileRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{IndexError, Result};

pub const MANIFEST_VERSION: u32 = 1;
pub const MANIFEST_FILE: &str = "manifest.json";

/// Where a chunk lives in the vector store and in its file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub key: String,
    pub path: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub content_hash: ContentHash,
}

/// Committed index state for one codebase.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexManifest {
    /// Canonical codebase root the index was built from.
    pub root: PathBuf,
    pub scope: String,
    /// Bumped on every commit.
    pub generation: u64,
    pub snapshot: Snapshot,
    /// File path → chunk ids in chunk order.
    pub files: BTreeMap<String, Vec<ChunkId>>,
    pub chunks: BTreeMap<ChunkId, ChunkEntry>,
    /// Store key → path, for keys whose deletion failed and must be retried.
    pub orphans: BTreeMap<String, String>,
    pub embedding_model: String,
    /// Fingerprint of the chunker configuration used.
    pub chunker: String,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotData {
    root_hash: ContentHash,
    files: Vec<FileRecord>,
}

#[derive(Serialize, Deserialize)]
struct Payload {
    version: u32,
    root: PathBuf,
    scope: String,
    generation: u64,
    snapshot: SnapshotData,
    files: BTreeMap<String, Vec<ChunkId>>,
    chunks: BTreeMap<ChunkId, ChunkEntry>,
    #[serde(default)]
    orphans: BTreeMap<String, String>,
    embedding_model: String,
    chunker: String,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    payload: Payload,
}

fn checksum(payload: &Payload) -> Result<String> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

impl IndexManifest {
    /// A manifest describing an empty index (generation 0).
    pub fn empty(root: PathBuf, scope: String, embedding_model: String, chunker: String) -> Self {
        Self {
            root,
            scope,
            generation: 0,
            snapshot: Snapshot::empty(),
            files: BTreeMap::new(),
            chunks: BTreeMap::new(),
            orphans: BTreeMap::new(),
            embedding_model,
            chunker,
            updated_at: None,
        }
    }

    pub fn path_in(state_dir: &Path) -> PathBuf {
        state_dir.join(MANIFEST_FILE)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn chunk(&self, id: &str) -> Option<&ChunkEntry> {
        self.chunks.get(id)
    }

    /// Chunk ids of `path`, in chunk order.
    pub fn chunk_ids(&self, path: &str) -> &[ChunkId] {
        self.files.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Load a manifest.
    ///
    /// Returns `Ok(None)` when no manifest exists yet.
    ///
    /// # Errors
    ///
    /// [`IndexError::ManifestCorrupt`] when the file cannot be parsed or
    /// fails verification; [`IndexError::Io`] when it cannot be read.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(IndexError::io(path, e)),
        };
        let corrupt = |reason: String| IndexError::ManifestCorrupt {
            path: path.to_path_buf(),
            reason,
        };

        let envelope: Envelope =
            serde_json::from_slice(&bytes).map_err(|e| corrupt(format!("unparseable: {e}")))?;
        let payload = envelope.payload;

        if checksum(&payload)? != envelope.checksum {
            return Err(corrupt("checksum mismatch".to_string()));
        }
        if payload.version != MANIFEST_VERSION {
            return Err(corrupt(format!(
                "unsupported version {} (expected {})",
                payload.version, MANIFEST_VERSION
            )));
        }

        let snapshot = Snapshot::build(payload.snapshot.files);
        if *snapshot.root_hash() != payload.snapshot.root_hash {
            return Err(corrupt("snapshot root hash mismatch".to_string()));
        }
        for (path_key, ids) in &payload.files {
            if let Some(missing) = ids.iter().find(|id| !payload.chunks.contains_key(*id)) {
                return Err(corrupt(format!(
                    "file {path_key} references unknown chunk {missing}"
                )));
            }
        }

        debug!(
            manifest = %path.display(),
            generation = payload.generation,
            files = payload.files.len(),
            chunks = payload.chunks.len(),
            "Loaded manifest"
        );

        Ok(Some(Self {
            root: payload.root,
            scope: payload.scope,
            generation: payload.generation,
            snapshot,
            files: payload.files,
            chunks: payload.chunks,
            orphans: payload.orphans,
            embedding_model: payload.embedding_model,
            chunker: payload.chunker,
            updated_at: payload.updated_at,
        }))
    }

    /// Write the manifest via temp file + rename.
    ///
    /// # Errors
    ///
    /// [`IndexError::Persist`] when any filesystem step fails. The previous
    /// manifest, if any, is left untouched in that case.
    pub fn save_atomic(&self, path: &Path) -> Result<()> {
        let payload = Payload {
            version: MANIFEST_VERSION,
            root: self.root.clone(),
            scope: self.scope.clone(),
            generation: self.generation,
            snapshot: SnapshotData {
                root_hash: *self.snapshot.root_hash(),
                files: self.snapshot.records().cloned().collect(),
            },
            files: self.files.clone(),
            chunks: self.chunks.clone(),
            orphans: self.orphans.clone(),
            embedding_model: self.embedding_model.clone(),
            chunker: self.chunker.clone(),
            updated_at: self.updated_at,
        };
        let envelope = Envelope {
            checksum: checksum(&payload)?,
            payload,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let persist = |source: std::io::Error| IndexError::Persist {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(persist)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = std::fs::File::create(&tmp).map_err(persist)?;
            file.write_all(&bytes).map_err(persist)?;
            file.sync_all().map_err(persist)?;
        }
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(persist(e));
        }
        #[cfg(unix)]
        if let Some(parent) = path.parent() {
            if let Ok(dir) = std::fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        debug!(
            manifest = %path.display(),
            generation = self.generation,
            "Persisted manifest"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use codeslice_core::models::{chunk_id, vector_key};
    use tempfile::TempDir;

    fn sample() -> IndexManifest {
        let hash = ContentHash::of(b"fn a() {}\n");
        let record = FileRecord {
            path: "src/a.rs".to_string(),
            hash,
            size: 10,
            modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        };
        let id = chunk_id("src/a.rs", &hash, 0);
        let mut m = IndexManifest::empty(
            PathBuf::from("/code"),
            "scope".to_string(),
            "model".to_string(),
            "r1:auto".to_string(),
        );
        m.generation = 3;
        m.snapshot = Snapshot::build(vec![record]);
        m.files.insert("src/a.rs".to_string(), vec![id.clone()]);
        m.chunks.insert(
            id.clone(),
            ChunkEntry {
                key: vector_key("scope", &id),
                path: "src/a.rs".to_string(),
                chunk_index: 0,
                start_line: 1,
                end_line: 1,
                content_hash: hash,
            },
        );
        m.orphans.insert("stale-key".to_string(), "gone.rs".to_string());
        m.updated_at = Some(Utc.timestamp_opt(1_700_000_100, 0).unwrap());
        m
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = IndexManifest::path_in(&tmp.path().join("state"));
        let m = sample();
        m.save_atomic(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        let loaded = IndexManifest::load(&path).unwrap().unwrap();
        assert_eq!(loaded, m);
        assert_eq!(loaded.chunk_ids("src/a.rs").len(), 1);
        assert!(loaded.chunk_ids("missing.rs").is_empty());
    }

    #[test]
    fn test_missing_manifest_is_none() {
        let tmp = TempDir::new().unwrap();
        assert!(IndexManifest::load(&tmp.path().join(MANIFEST_FILE))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_truncated_manifest_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(MANIFEST_FILE);
        sample().save_atomic(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(
            IndexManifest::load(&path),
            Err(IndexError::ManifestCorrupt { .. })
        ));
    }

    #[test]
    fn test_tampered_payload_fails_checksum() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(MANIFEST_FILE);
        sample().save_atomic(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("\"generation\": 3", "\"generation\": 4")).unwrap();
        match IndexManifest::load(&path) {
            Err(IndexError::ManifestCorrupt { reason, .. }) => {
                assert!(reason.contains("checksum"))
            }
            other => panic!("expected corrupt manifest, got {other:?}"),
        }
    }

    #[test]
    fn test_overwrite_replaces_previous() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(MANIFEST_FILE);
        let mut m = sample();
        m.save_atomic(&path).unwrap();
        m.generation = 4;
        m.orphans.clear();
        m.save_atomic(&path).unwrap();
        let loaded = IndexManifest::load(&path).unwrap().unwrap();
        assert_eq!(loaded.generation, 4);
        assert!(loaded.orphans.is_empty());
    }
}
