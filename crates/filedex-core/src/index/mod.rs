//! Search index abstraction.
//!
//! The [`SearchIndex`] trait is the boundary to the search engine that
//! stores one entry per content hash plus any derived chunk documents.
//! The engine is treated as an opaque document store with filtering,
//! sorting and full-text search; background work is observable through
//! [`SearchIndex::pending_tasks`] so callers can wait for it to settle.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChunkDocument, Document, Lookup, SearchHit};

/// Filters applied by [`SearchIndex::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Only documents whose `next` equals this module name.
    pub next: Option<String>,
    /// Only documents whose MIME type starts with this prefix.
    pub mime_prefix: Option<String>,
    /// Include chunk documents in the results.
    pub include_chunks: bool,
}

/// Abstract search engine backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`exists`](SearchIndex::exists) | Whether the index has been created |
/// | [`ensure`](SearchIndex::ensure) | Create the index if missing |
/// | [`all_ids`](SearchIndex::all_ids) | Every indexed document hash |
/// | [`upsert_documents`](SearchIndex::upsert_documents) | Insert or replace documents |
/// | [`delete_documents`](SearchIndex::delete_documents) | Remove documents by hash |
/// | [`upsert_chunks`](SearchIndex::upsert_chunks) | Insert or replace chunk documents |
/// | [`delete_chunks`](SearchIndex::delete_chunks) | Remove chunk documents by id |
/// | [`delete_chunks_for_files`](SearchIndex::delete_chunks_for_files) | Remove every chunk of the given files |
/// | [`get`](SearchIndex::get) | Fetch one document |
/// | [`find_by_next`](SearchIndex::find_by_next) | Documents waiting on a module, in path order |
/// | [`search`](SearchIndex::search) | Full-text search |
/// | [`pending_tasks`](SearchIndex::pending_tasks) | Background tasks not yet applied |
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn exists(&self) -> Result<bool>;

    async fn ensure(&self) -> Result<()>;

    async fn all_ids(&self) -> Result<BTreeSet<String>>;

    /// Insert or replace documents. `contents` pairs a document id with the
    /// text that should be searchable for it, when a module produced any.
    async fn upsert_documents(&self, docs: &[Document], contents: &[(String, String)])
        -> Result<()>;

    async fn delete_documents(&self, ids: &[String]) -> Result<()>;

    async fn upsert_chunks(&self, chunks: &[ChunkDocument]) -> Result<()>;

    async fn delete_chunks(&self, ids: &[String]) -> Result<()>;

    async fn delete_chunks_for_files(&self, file_ids: &[String]) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Lookup<Document>>;

    /// Documents whose `next` is `module`, ordered by their first path.
    async fn find_by_next(&self, module: &str, limit: usize) -> Result<Vec<Document>>;

    async fn search(&self, query: &str, filter: &SearchFilter, limit: usize)
        -> Result<Vec<SearchHit>>;

    /// Number of background tasks the engine has accepted but not applied.
    async fn pending_tasks(&self) -> Result<usize>;
}
