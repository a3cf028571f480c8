//! SQLite-backed [`VectorStore`] implementation.
//!
//! Vectors are stored as little-endian `f32` BLOBs next to their chunk
//! metadata in a single `vectors` table. Queries load the scope's rows and
//! rank them by brute-force cosine distance, which is adequate for the
//! chunk counts of a single codebase.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use codeslice_core::embedding::{blob_to_vec, cosine_distance, vec_to_blob};
use codeslice_core::error::StoreError;
use codeslice_core::models::ContentHash;
use codeslice_core::store::memory::InMemoryVectorStore;
use codeslice_core::store::{ChunkMetadata, MetadataFilter, StoredVector, VectorMatch, VectorStore};
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::config::Config;
use crate::error::{IndexError, Result};
use crate::{db, migrate};

/// Default database file inside a codebase's state directory.
pub const DEFAULT_DB_FILE: &str = "vectors.db";

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        debug!(db = %path.display(), "Opened vector database");
        Ok(Self { pool })
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Number of stored vectors in `scope`.
    pub async fn count(&self, scope: &str) -> std::result::Result<usize, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vectors WHERE scope = ?")
            .bind(scope)
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(n as usize)
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn metadata_from_row(
    row: &sqlx::sqlite::SqliteRow,
) -> std::result::Result<ChunkMetadata, StoreError> {
    let hash: String = row.get("content_hash");
    let content_hash = ContentHash::from_hex(&hash)
        .ok_or_else(|| StoreError::Unavailable(format!("corrupt content hash {hash:?}")))?;
    Ok(ChunkMetadata {
        scope: row.get("scope"),
        chunk_id: row.get("chunk_id"),
        path: row.get("path"),
        chunk_index: row.get::<i64, _>("chunk_index") as usize,
        start_line: row.get::<i64, _>("start_line") as usize,
        end_line: row.get::<i64, _>("end_line") as usize,
        content_hash,
        text: row.get("text"),
    })
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(
        &self,
        key: &str,
        vector: &[f32],
        metadata: &ChunkMetadata,
    ) -> std::result::Result<(), StoreError> {
        if vector.is_empty() {
            return Err(StoreError::Rejected(format!("empty vector for {key}")));
        }
        let now = chrono::Utc::now().timestamp();
        let blob = vec_to_blob(vector);

        sqlx::query(
            r#"
            INSERT INTO vectors (key, scope, chunk_id, path, chunk_index, start_line,
                                 end_line, content_hash, text, dims, embedding, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                scope = excluded.scope,
                chunk_id = excluded.chunk_id,
                path = excluded.path,
                chunk_index = excluded.chunk_index,
                start_line = excluded.start_line,
                end_line = excluded.end_line,
                content_hash = excluded.content_hash,
                text = excluded.text,
                dims = excluded.dims,
                embedding = excluded.embedding,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(&metadata.scope)
        .bind(&metadata.chunk_id)
        .bind(&metadata.path)
        .bind(metadata.chunk_index as i64)
        .bind(metadata.start_line as i64)
        .bind(metadata.end_line as i64)
        .bind(metadata.content_hash.to_hex())
        .bind(&metadata.text)
        .bind(vector.len() as i64)
        .bind(&blob)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> std::result::Result<(), StoreError> {
        sqlx::query("DELETE FROM vectors WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> std::result::Result<Option<StoredVector>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT key, scope, chunk_id, path, chunk_index, start_line, end_line,
                   content_hash, text, embedding
            FROM vectors
            WHERE key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let blob: Vec<u8> = row.get("embedding");
        Ok(Some(StoredVector {
            key: row.get("key"),
            vector: blob_to_vec(&blob),
            metadata: metadata_from_row(&row)?,
        }))
    }

    async fn query(
        &self,
        vector: &[f32],
        top_n: usize,
        filter: &MetadataFilter,
    ) -> std::result::Result<Vec<VectorMatch>, StoreError> {
        if top_n == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            SELECT key, scope, chunk_id, path, chunk_index, start_line, end_line,
                   content_hash, text, embedding
            FROM vectors
            WHERE scope = ?
            "#,
        )
        .bind(&filter.scope)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut matches = Vec::new();
        for row in &rows {
            let metadata = metadata_from_row(row)?;
            if !filter.matches(&metadata) {
                continue;
            }
            let blob: Vec<u8> = row.get("embedding");
            let stored = blob_to_vec(&blob);
            matches.push(VectorMatch {
                key: row.get("key"),
                distance: cosine_distance(vector, &stored),
                metadata,
            });
        }

        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        matches.truncate(top_n);
        Ok(matches)
    }

    async fn purge_scope(&self, scope: &str) -> std::result::Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM vectors WHERE scope = ?")
            .bind(scope)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(result.rows_affected() as usize)
    }
}

/// Create the [`VectorStore`] named by `config.vector_store.backend`.
///
/// | Backend | Store |
/// |---------|-------|
/// | `"memory"` | [`InMemoryVectorStore`] |
/// | `"sqlite"` | [`SqliteVectorStore`] at `vector_store.path`, or `vectors.db` in `state_dir` |
pub async fn create_store(config: &Config, state_dir: &Path) -> Result<Arc<dyn VectorStore>> {
    match config.vector_store.backend.as_str() {
        "memory" => Ok(Arc::new(InMemoryVectorStore::new())),
        "sqlite" => {
            let path: PathBuf = config
                .vector_store
                .path
                .clone()
                .unwrap_or_else(|| state_dir.join(DEFAULT_DB_FILE));
            Ok(Arc::new(SqliteVectorStore::open(&path).await?))
        }
        other => Err(IndexError::Config(format!(
            "unknown vector store backend: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn meta(scope: &str, path: &str, index: usize) -> ChunkMetadata {
        ChunkMetadata {
            scope: scope.to_string(),
            chunk_id: format!("{path}#{index}"),
            path: path.to_string(),
            chunk_index: index,
            start_line: 1,
            end_line: 10,
            content_hash: ContentHash::of(path.as_bytes()),
            text: format!("text of {path}"),
        }
    }

    #[tokio::test]
    async fn test_upsert_query_delete() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(&tmp.path().join("v.db")).await.unwrap();

        store.upsert("k1", &[1.0, 0.0], &meta("s", "src/a.rs", 0)).await.unwrap();
        store.upsert("k2", &[0.0, 1.0], &meta("s", "src/b.rs", 0)).await.unwrap();
        store.upsert("k3", &[1.0, 0.0], &meta("other", "src/a.rs", 0)).await.unwrap();
        // idempotent per key
        store.upsert("k1", &[1.0, 0.0], &meta("s", "src/a.rs", 0)).await.unwrap();
        assert_eq!(store.count("s").await.unwrap(), 2);

        let hits = store
            .query(&[1.0, 0.1], 10, &MetadataFilter::scope("s"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].key, "k1");
        assert_eq!(hits[0].metadata, meta("s", "src/a.rs", 0));

        let hits = store
            .query(&[1.0, 0.0], 10, &MetadataFilter::scope("s").with_path_prefix("src/b.rs"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].key, "k2");

        let stored = store.get("k2").await.unwrap().unwrap();
        assert_eq!(stored.vector, vec![0.0, 1.0]);
        assert_eq!(stored.metadata, meta("s", "src/b.rs", 0));

        store.delete("k1").await.unwrap();
        store.delete("missing").await.unwrap();
        assert_eq!(store.count("s").await.unwrap(), 1);
        assert!(store.get("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_scope_leaves_other_scopes() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(&tmp.path().join("v.db")).await.unwrap();
        store.upsert("a", &[1.0], &meta("s1", "a.rs", 0)).await.unwrap();
        store.upsert("b", &[1.0], &meta("s1", "b.rs", 0)).await.unwrap();
        store.upsert("c", &[1.0], &meta("s2", "c.rs", 0)).await.unwrap();

        assert_eq!(store.purge_scope("s1").await.unwrap(), 2);
        assert_eq!(store.count("s1").await.unwrap(), 0);
        assert_eq!(store.count("s2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_vector_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(&tmp.path().join("v.db")).await.unwrap();
        let err = store.upsert("k", &[], &meta("s", "a.rs", 0)).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_create_store_backends() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        assert!(create_store(&config, tmp.path()).await.is_ok());

        config.vector_store.backend = "sqlite".to_string();
        create_store(&config, tmp.path()).await.unwrap();
        assert!(tmp.path().join(DEFAULT_DB_FILE).exists());

        config.vector_store.backend = "qdrant".to_string();
        assert!(matches!(
            create_store(&config, tmp.path()).await,
            Err(IndexError::Config(_))
        ));
    }
}
