//! Core data models shared by the indexing and retrieval pipeline.
//!
//! These types describe files as they were observed on disk, the chunks cut
//! from them, and the identifiers that tie chunks to vector-store entries.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A SHA-256 digest, serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash raw bytes.
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Self(out))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid content hash: {s:?}")))
    }
}

/// A file observed during a walk.
///
/// `path` is relative to the codebase root and always uses `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub hash: ContentHash,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Stable chunk identifier (hex SHA-256 of path, file hash and chunk index).
pub type ChunkId = String;

/// A bounded, stably-identified span of a file.
///
/// Line numbers are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub path: String,
    pub chunk_index: usize,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    /// Hash of `text` alone.
    pub hash: ContentHash,
}

/// Derive the id of the `index`-th chunk of a file with the given content hash.
///
/// Only the three inputs participate, so re-chunking unchanged content
/// reproduces the same ids.
///
/// ```rust
/// use codeslice_core::models::{chunk_id, ContentHash};
///
/// let h = ContentHash::of(b"fn main() {}\n");
/// assert_eq!(chunk_id("src/main.rs", &h, 0), chunk_id("src/main.rs", &h, 0));
/// assert_ne!(chunk_id("src/main.rs", &h, 0), chunk_id("src/main.rs", &h, 1));
/// ```
pub fn chunk_id(path: &str, file_hash: &ContentHash, index: usize) -> ChunkId {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(file_hash.as_bytes());
    hasher.update((index as u64).to_le_bytes());
    hex::encode(hasher.finalize())
}

/// Derive the vector-store key for a chunk within a codebase scope.
///
/// Keys are UUIDv5 so they are accepted by stores that require UUID point ids,
/// and the scope participates so codebases sharing one store never collide.
pub fn vector_key(scope: &str, chunk_id: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{scope}/{chunk_id}").as_bytes()).to_string()
}
