//! SQLite schemas for the search index and the queue broker.
//!
//! Both schemas are created idempotently; `fdx init` and every command that
//! opens one of the databases call these before use.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::db;

/// Create the search index tables.
pub async fn migrate_search(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_documents (
            id TEXT PRIMARY KEY,
            next TEXT NOT NULL DEFAULT '',
            mime_type TEXT NOT NULL DEFAULT '',
            paths_text TEXT NOT NULL DEFAULT '',
            content TEXT NOT NULL DEFAULT '',
            doc_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_chunks (
            id TEXT PRIMARY KEY,
            file_id TEXT NOT NULL,
            module TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            text TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    for (name, ddl) in [
        (
            "index_documents_fts",
            "CREATE VIRTUAL TABLE index_documents_fts USING fts5(id UNINDEXED, paths_text, content)",
        ),
        (
            "index_chunks_fts",
            "CREATE VIRTUAL TABLE index_chunks_fts USING fts5(id UNINDEXED, file_id UNINDEXED, text)",
        ),
    ] {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?",
        )
        .bind(name)
        .fetch_one(pool)
        .await?;
        if !exists {
            sqlx::query(ddl).execute(pool).await?;
        }
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_index_documents_next ON index_documents(next, paths_text)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_index_chunks_file_id ON index_chunks(file_id)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the broker's list, sorted-set and key/value tables.
pub async fn migrate_broker(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS broker_lists (
            key TEXT NOT NULL,
            pos INTEGER NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (key, pos)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS broker_zsets (
            key TEXT NOT NULL,
            member TEXT NOT NULL,
            score REAL NOT NULL,
            PRIMARY KEY (key, member)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS broker_kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at REAL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_broker_zsets_score ON broker_zsets(key, score)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the metadata directories and both databases. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let metadata_root = config.metadata_root();
    for dir in [metadata_root.join("by-id"), metadata_root.join("by-path")] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    let search = db::connect(&config.search_db_path()).await?;
    migrate_search(&search).await?;
    search.close().await;

    let queue = db::connect(&config.queue_db_path()).await?;
    migrate_broker(&queue).await?;
    queue.close().await;

    info!(root = %metadata_root.display(), "metadata initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = Config::minimal(tmp.path());

        run_migrations(&config).await.unwrap();
        run_migrations(&config).await.unwrap();

        assert!(config.metadata_root().join("by-id").is_dir());
        assert!(config.search_db_path().exists());

        let pool = db::connect(&config.queue_db_path()).await.unwrap();
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'broker_%' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(tables, ["broker_kv", "broker_lists", "broker_zsets"]);
    }
}
