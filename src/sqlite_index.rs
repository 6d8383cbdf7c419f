//! SQLite-backed [`SearchIndex`] implementation.
//!
//! Documents and chunk documents each live in a plain table mirrored into
//! an FTS5 table for keyword search. Writes are applied synchronously, so
//! [`SearchIndex::pending_tasks`] is always zero.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeSet;
use std::path::Path;

use filedex_core::index::{SearchFilter, SearchIndex};
use filedex_core::models::{ChunkDocument, Document, Lookup, SearchHit};

use crate::{db, migrate};

/// SQLite implementation of the [`SearchIndex`] trait.
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the index database at `path`, creating its tables.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::migrate_search(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Joined paths; `\n` sorts before any path character, so ordering by this
/// column matches ordering by `paths_list`.
fn paths_text(doc: &Document) -> String {
    doc.paths_list.join("\n")
}

/// Quote every term so user input cannot inject FTS5 syntax.
fn fts_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_doc(json: &str) -> Result<Document> {
    serde_json::from_str(json).context("Invalid document JSON in search index")
}

#[async_trait]
impl SearchIndex for SqliteIndex {
    async fn exists(&self) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='index_documents'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn ensure(&self) -> Result<()> {
        migrate::migrate_search(&self.pool).await
    }

    async fn all_ids(&self) -> Result<BTreeSet<String>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM index_documents")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn upsert_documents(
        &self,
        docs: &[Document],
        contents: &[(String, String)],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for doc in docs {
            let content = contents
                .iter()
                .find(|(id, _)| id == &doc.id)
                .map(|(_, c)| c.as_str());
            let doc_json = serde_json::to_string(doc)?;

            sqlx::query(
                r#"
                INSERT INTO index_documents (id, next, mime_type, paths_text, content, doc_json)
                VALUES (?, ?, ?, ?, COALESCE(?, ''), ?)
                ON CONFLICT(id) DO UPDATE SET
                    next = excluded.next,
                    mime_type = excluded.mime_type,
                    paths_text = excluded.paths_text,
                    content = COALESCE(?, index_documents.content),
                    doc_json = excluded.doc_json
                "#,
            )
            .bind(&doc.id)
            .bind(&doc.next)
            .bind(&doc.mime_type)
            .bind(paths_text(doc))
            .bind(content)
            .bind(&doc_json)
            .bind(content)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM index_documents_fts WHERE id = ?")
                .bind(&doc.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO index_documents_fts (id, paths_text, content) \
                 SELECT id, paths_text, content FROM index_documents WHERE id = ?",
            )
            .bind(&doc.id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete_documents(&self, ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM index_documents_fts WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM index_documents WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_chunks(&self, chunks: &[ChunkDocument]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO index_chunks (id, file_id, module, chunk_index, text)
                VALUES (?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    file_id = excluded.file_id,
                    module = excluded.module,
                    chunk_index = excluded.chunk_index,
                    text = excluded.text
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.file_id)
            .bind(&chunk.module)
            .bind(chunk.index)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM index_chunks_fts WHERE id = ?")
                .bind(&chunk.id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("INSERT INTO index_chunks_fts (id, file_id, text) VALUES (?, ?, ?)")
                .bind(&chunk.id)
                .bind(&chunk.file_id)
                .bind(&chunk.text)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_chunks(&self, ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for id in ids {
            sqlx::query("DELETE FROM index_chunks_fts WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM index_chunks WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_chunks_for_files(&self, file_ids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for file_id in file_ids {
            sqlx::query("DELETE FROM index_chunks_fts WHERE file_id = ?")
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM index_chunks WHERE file_id = ?")
                .bind(file_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Lookup<Document>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT doc_json FROM index_documents WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match json {
            Some(j) => Ok(Lookup::Found(parse_doc(&j)?)),
            None => Ok(Lookup::NotFound),
        }
    }

    async fn find_by_next(&self, module: &str, limit: usize) -> Result<Vec<Document>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT doc_json FROM index_documents WHERE next = ? ORDER BY paths_text LIMIT ?",
        )
        .bind(module)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|j| parse_doc(j)).collect()
    }

    async fn search(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let mime_like = filter.mime_prefix.as_ref().map(|p| format!("{}%", p));
        let match_expr = fts_query(query);

        if match_expr.is_empty() {
            let rows = sqlx::query(
                r#"
                SELECT id, doc_json, substr(content, 1, 240) AS snippet
                FROM index_documents
                WHERE (? IS NULL OR next = ?)
                  AND (? IS NULL OR mime_type LIKE ?)
                ORDER BY paths_text
                LIMIT ?
                "#,
            )
            .bind(&filter.next)
            .bind(&filter.next)
            .bind(&mime_like)
            .bind(&mime_like)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

            return rows
                .iter()
                .map(|row| {
                    let doc = parse_doc(row.get::<&str, _>("doc_json"))?;
                    Ok(SearchHit {
                        id: doc.id.clone(),
                        file_id: doc.id.clone(),
                        paths: doc.paths_list.clone(),
                        next: doc.next.clone(),
                        score: 0.0,
                        snippet: row.get("snippet"),
                    })
                })
                .collect();
        }

        let mut hits = Vec::new();

        let rows = sqlx::query(
            r#"
            SELECT d.doc_json AS doc_json,
                   bm25(index_documents_fts) AS rank,
                   snippet(index_documents_fts, 2, '>>>', '<<<', '...', 32) AS snippet
            FROM index_documents_fts
            JOIN index_documents d ON d.id = index_documents_fts.id
            WHERE index_documents_fts MATCH ?
              AND (? IS NULL OR d.next = ?)
              AND (? IS NULL OR d.mime_type LIKE ?)
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(&match_expr)
        .bind(&filter.next)
        .bind(&filter.next)
        .bind(&mime_like)
        .bind(&mime_like)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        for row in &rows {
            let doc = parse_doc(row.get::<&str, _>("doc_json"))?;
            let rank: f64 = row.get("rank");
            hits.push(SearchHit {
                id: doc.id.clone(),
                file_id: doc.id.clone(),
                paths: doc.paths_list.clone(),
                next: doc.next.clone(),
                score: -rank,
                snippet: row.get("snippet"),
            });
        }

        if filter.include_chunks {
            let rows = sqlx::query(
                r#"
                SELECT index_chunks_fts.id AS id,
                       d.doc_json AS doc_json,
                       bm25(index_chunks_fts) AS rank,
                       snippet(index_chunks_fts, 2, '>>>', '<<<', '...', 32) AS snippet
                FROM index_chunks_fts
                JOIN index_documents d ON d.id = index_chunks_fts.file_id
                WHERE index_chunks_fts MATCH ?
                  AND (? IS NULL OR d.next = ?)
                  AND (? IS NULL OR d.mime_type LIKE ?)
                ORDER BY rank
                LIMIT ?
                "#,
            )
            .bind(&match_expr)
            .bind(&filter.next)
            .bind(&filter.next)
            .bind(&mime_like)
            .bind(&mime_like)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

            for row in &rows {
                let doc = parse_doc(row.get::<&str, _>("doc_json"))?;
                let rank: f64 = row.get("rank");
                hits.push(SearchHit {
                    id: row.get("id"),
                    file_id: doc.id.clone(),
                    paths: doc.paths_list.clone(),
                    next: doc.next.clone(),
                    score: -rank,
                    snippet: row.get("snippet"),
                });
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.paths.cmp(&b.paths))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn pending_tasks(&self) -> Result<usize> {
        Ok(0)
    }
}
