use sqlx::SqlitePool;

use crate::error::Result;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per stored vector, keyed by the scope-qualified chunk key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vectors (
            key TEXT PRIMARY KEY,
            scope TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            path TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            text TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_scope ON vectors(scope)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_scope_path ON vectors(scope, path)")
        .execute(pool)
        .await?;

    Ok(())
}
