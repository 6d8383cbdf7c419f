//! Search over the published index.
//!
//! Thin CLI layer over [`SearchIndex::search`]: builds the filter from
//! command-line flags, runs the query and prints ranked hits. An empty
//! query lists documents (optionally only those waiting on a module).

use anyhow::Result;
use filedex_core::index::{SearchFilter, SearchIndex};
use filedex_core::models::SearchHit;

use crate::config::Config;
use crate::sqlite_index::SqliteIndex;

/// Flags accepted by `fdx search`.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub next: Option<String>,
    pub mime_prefix: Option<String>,
    pub chunks: bool,
    pub limit: usize,
}

impl SearchOptions {
    fn filter(&self) -> SearchFilter {
        SearchFilter {
            next: self.next.clone(),
            mime_prefix: self.mime_prefix.clone(),
            include_chunks: self.chunks,
        }
    }
}

pub async fn search_documents(
    index: &dyn SearchIndex,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchHit>> {
    if !index.exists().await? {
        return Ok(Vec::new());
    }
    index
        .search(query.trim(), &options.filter(), options.limit.max(1))
        .await
}

/// CLI entry point.
pub async fn run_search(config: &Config, query: &str, options: &SearchOptions, json: bool) -> Result<()> {
    let index = SqliteIndex::open(&config.search_db_path()).await?;
    let hits = search_documents(&index, query, options).await?;
    index.pool().close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }
    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let first = hit.paths.first().map(String::as_str).unwrap_or("(no path)");
        let extra = hit.paths.len().saturating_sub(1);
        println!(
            "{}. [{:.2}] {}{}",
            i + 1,
            hit.score,
            first,
            if extra > 0 {
                format!(" (+{} more)", extra)
            } else {
                String::new()
            }
        );
        if hit.id != hit.file_id {
            println!("    chunk: {}", hit.id);
        } else {
            println!("    id: {}", hit.id);
        }
        if !hit.next.is_empty() {
            println!("    next: {}", hit.next);
        }
        let snippet = hit.snippet.replace('\n', " ");
        if !snippet.trim().is_empty() {
            println!("    > {}", snippet.trim());
        }
    }
    Ok(())
}
