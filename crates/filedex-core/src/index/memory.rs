//! In-memory [`SearchIndex`] implementation for tests and embedding.
//!
//! Uses `BTreeMap`s behind `std::sync::RwLock`. Keyword search is a plain
//! case-insensitive term count over paths, content and chunk text.
//! `pending_tasks` can be primed to simulate an engine that applies writes
//! in the background; each call drains one task.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{ChunkDocument, Document, Lookup, SearchHit};

use super::{SearchFilter, SearchIndex};

struct StoredDoc {
    doc: Document,
    content: String,
}

/// In-memory search index.
pub struct InMemoryIndex {
    created: RwLock<bool>,
    docs: RwLock<BTreeMap<String, StoredDoc>>,
    chunks: RwLock<BTreeMap<String, ChunkDocument>>,
    pending: AtomicUsize,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self {
            created: RwLock::new(false),
            docs: RwLock::new(BTreeMap::new()),
            chunks: RwLock::new(BTreeMap::new()),
            pending: AtomicUsize::new(0),
        }
    }

    /// Pretend the engine has `n` queued background tasks.
    pub fn simulate_pending(&self, n: usize) {
        self.pending.store(n, Ordering::SeqCst);
    }

    /// Chunk documents derived from `file_id`, ordered by index.
    pub fn chunks_for(&self, file_id: &str) -> Vec<ChunkDocument> {
        let chunks = self.chunks.read().unwrap();
        let mut out: Vec<ChunkDocument> = chunks
            .values()
            .filter(|c| c.file_id == file_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.index);
        out
    }

    pub fn len(&self) -> usize {
        self.docs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn count_matches(haystack: &str, terms: &[String]) -> usize {
    let lower = haystack.to_lowercase();
    terms.iter().filter(|t| lower.contains(t.as_str())).count()
}

fn snippet(text: &str) -> String {
    text.chars().take(240).collect()
}

fn passes(doc: &Document, filter: &SearchFilter) -> bool {
    if let Some(next) = &filter.next {
        if &doc.next != next {
            return false;
        }
    }
    if let Some(prefix) = &filter.mime_prefix {
        if !doc.mime_type.starts_with(prefix.as_str()) {
            return false;
        }
    }
    true
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn exists(&self) -> Result<bool> {
        Ok(*self.created.read().unwrap())
    }

    async fn ensure(&self) -> Result<()> {
        *self.created.write().unwrap() = true;
        Ok(())
    }

    async fn all_ids(&self) -> Result<BTreeSet<String>> {
        Ok(self.docs.read().unwrap().keys().cloned().collect())
    }

    async fn upsert_documents(
        &self,
        docs: &[Document],
        contents: &[(String, String)],
    ) -> Result<()> {
        let mut stored = self.docs.write().unwrap();
        for doc in docs {
            let content = contents
                .iter()
                .find(|(id, _)| id == &doc.id)
                .map(|(_, c)| c.clone())
                .or_else(|| stored.get(&doc.id).map(|s| s.content.clone()))
                .unwrap_or_default();
            stored.insert(
                doc.id.clone(),
                StoredDoc {
                    doc: doc.clone(),
                    content,
                },
            );
        }
        Ok(())
    }

    async fn delete_documents(&self, ids: &[String]) -> Result<()> {
        let mut stored = self.docs.write().unwrap();
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn upsert_chunks(&self, chunks: &[ChunkDocument]) -> Result<()> {
        let mut stored = self.chunks.write().unwrap();
        for c in chunks {
            stored.insert(c.id.clone(), c.clone());
        }
        Ok(())
    }

    async fn delete_chunks(&self, ids: &[String]) -> Result<()> {
        let mut stored = self.chunks.write().unwrap();
        for id in ids {
            stored.remove(id);
        }
        Ok(())
    }

    async fn delete_chunks_for_files(&self, file_ids: &[String]) -> Result<()> {
        let mut stored = self.chunks.write().unwrap();
        stored.retain(|_, c| !file_ids.contains(&c.file_id));
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Lookup<Document>> {
        let stored = self.docs.read().unwrap();
        Ok(stored.get(id).map(|s| s.doc.clone()).into())
    }

    async fn find_by_next(&self, module: &str, limit: usize) -> Result<Vec<Document>> {
        let stored = self.docs.read().unwrap();
        let mut docs: Vec<Document> = stored
            .values()
            .filter(|s| s.doc.next == module)
            .map(|s| s.doc.clone())
            .collect();
        docs.sort_by(|a, b| a.paths_list.cmp(&b.paths_list));
        docs.truncate(limit);
        Ok(docs)
    }

    async fn search(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let terms: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let stored = self.docs.read().unwrap();
        let mut hits = Vec::new();

        for s in stored.values().filter(|s| passes(&s.doc, filter)) {
            let haystack = format!("{}\n{}", s.doc.paths_list.join("\n"), s.content);
            let matches = count_matches(&haystack, &terms);
            if terms.is_empty() || matches > 0 {
                hits.push(SearchHit {
                    id: s.doc.id.clone(),
                    file_id: s.doc.id.clone(),
                    paths: s.doc.paths_list.clone(),
                    next: s.doc.next.clone(),
                    score: matches as f64,
                    snippet: snippet(&s.content),
                });
            }
        }

        if filter.include_chunks && !terms.is_empty() {
            let chunks = self.chunks.read().unwrap();
            for c in chunks.values() {
                let Some(owner) = stored.get(&c.file_id) else {
                    continue;
                };
                if !passes(&owner.doc, filter) {
                    continue;
                }
                let matches = count_matches(&c.text, &terms);
                if matches > 0 {
                    hits.push(SearchHit {
                        id: c.id.clone(),
                        file_id: c.file_id.clone(),
                        paths: owner.doc.paths_list.clone(),
                        next: owner.doc.next.clone(),
                        score: matches as f64,
                        snippet: snippet(&c.text),
                    });
                }
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
        let current = self.pending.load(Ordering::SeqCst);
        if current > 0 {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, path: &str, next: &str) -> Document {
        let mut d = Document::new(id, 1);
        d.add_path(path, 1.0);
        d.next = next.to_string();
        d
    }

    #[tokio::test]
    async fn find_by_next_filters_and_orders_by_path() {
        let index = InMemoryIndex::new();
        index
            .upsert_documents(
                &[doc("b", "z.txt", "text"), doc("a", "a.txt", "text"), doc("c", "c.txt", "")],
                &[],
            )
            .await
            .unwrap();

        let found = index.find_by_next("text", 10).await.unwrap();
        let ids: Vec<&str> = found.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn content_is_kept_across_upserts_without_content() {
        let index = InMemoryIndex::new();
        let d = doc("a", "notes.md", "");
        index
            .upsert_documents(&[d.clone()], &[("a".into(), "kubernetes notes".into())])
            .await
            .unwrap();
        index.upsert_documents(&[d], &[]).await.unwrap();

        let hits = index
            .search("kubernetes", &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }

    #[tokio::test]
    async fn chunks_are_removed_with_their_file() {
        let index = InMemoryIndex::new();
        index
            .upsert_chunks(&[ChunkDocument {
                id: "a-text-0".into(),
                file_id: "a".into(),
                module: "text".into(),
                index: 0,
                text: "hello".into(),
            }])
            .await
            .unwrap();
        index.delete_chunks_for_files(&["a".into()]).await.unwrap();
        assert!(index.chunks_for("a").is_empty());
    }

    #[tokio::test]
    async fn pending_tasks_drain() {
        let index = InMemoryIndex::new();
        index.simulate_pending(2);
        assert_eq!(index.pending_tasks().await.unwrap(), 2);
        assert_eq!(index.pending_tasks().await.unwrap(), 1);
        assert_eq!(index.pending_tasks().await.unwrap(), 0);
    }
}
