//! Publish the reconciled document set to the search index.

use anyhow::Result;
use filedex_core::index::SearchIndex;
use filedex_core::models::Document;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::store::DocumentStore;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexSyncReport {
    pub deleted: usize,
    pub upserted: usize,
}

pub struct SearchIndexSync {
    index: Arc<dyn SearchIndex>,
    store: DocumentStore,
    batch_size: usize,
    settle_poll: Duration,
}

impl SearchIndexSync {
    pub fn new(
        index: Arc<dyn SearchIndex>,
        store: DocumentStore,
        batch_size: usize,
        settle_poll: Duration,
    ) -> Self {
        Self {
            index,
            store,
            batch_size: batch_size.max(1),
            settle_poll,
        }
    }

    /// Converge the index on `live`: drop what is no longer live, publish
    /// `upserts` plus anything live the index is missing, then wait for the
    /// engine to settle.
    pub async fn reconcile(
        &self,
        upserts: &[Document],
        live: &BTreeMap<String, Document>,
    ) -> Result<IndexSyncReport> {
        if !self.index.exists().await? {
            info!("creating search index");
            self.index.ensure().await?;
        }

        let indexed = self.index.all_ids().await?;
        let live_ids: BTreeSet<&String> = live.keys().collect();

        let deleted: Vec<String> = indexed
            .iter()
            .filter(|id| !live_ids.contains(id))
            .cloned()
            .collect();

        let mut to_upsert: BTreeMap<&str, &Document> =
            upserts.iter().map(|d| (d.id.as_str(), d)).collect();
        for (id, doc) in live {
            if !indexed.contains(id) {
                to_upsert.entry(id.as_str()).or_insert(doc);
            }
        }

        for batch in deleted.chunks(self.batch_size) {
            self.index.delete_documents(batch).await?;
            self.index.delete_chunks_for_files(batch).await?;
        }

        let docs: Vec<Document> = to_upsert.into_values().cloned().collect();
        for batch in docs.chunks(self.batch_size) {
            let contents = self.contents_for(batch)?;
            self.index.upsert_documents(batch, &contents).await?;
        }

        self.wait_idle().await?;

        let report = IndexSyncReport {
            deleted: deleted.len(),
            upserted: docs.len(),
        };
        debug!(deleted = report.deleted, upserted = report.upserted, "search index synced");
        Ok(report)
    }

    /// Publish a single document after a module completed on it.
    pub async fn publish(&self, doc: &Document) -> Result<()> {
        let contents = self.contents_for(std::slice::from_ref(doc))?;
        self.index
            .upsert_documents(std::slice::from_ref(doc), &contents)
            .await
    }

    /// Poll until the engine reports no pending background tasks.
    pub async fn wait_idle(&self) -> Result<()> {
        loop {
            let pending = self.index.pending_tasks().await?;
            if pending == 0 {
                return Ok(());
            }
            debug!(pending, "waiting for search index to settle");
            tokio::time::sleep(self.settle_poll).await;
        }
    }

    /// Searchable text of each document: every module's stored content.
    fn contents_for(&self, docs: &[Document]) -> Result<Vec<(String, String)>> {
        let mut out = Vec::new();
        for doc in docs {
            let mut parts = Vec::new();
            for module in &doc.modules_done {
                if let Some(text) = self.store.read_content(&doc.id, module)? {
                    parts.push(text);
                }
            }
            if !parts.is_empty() {
                out.push((doc.id.clone(), parts.join("\n\n")));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filedex_core::index::memory::InMemoryIndex;
    use filedex_core::index::SearchFilter;
    use filedex_core::models::ChunkDocument;
    use tempfile::TempDir;

    fn doc(id: &str, path: &str) -> Document {
        let mut d = Document::new(id, 1);
        d.add_path(path, 1.0);
        d
    }

    fn setup(batch: usize) -> (TempDir, Arc<InMemoryIndex>, SearchIndexSync) {
        let tmp = TempDir::new().unwrap();
        let index = Arc::new(InMemoryIndex::new());
        let sync = SearchIndexSync::new(
            index.clone(),
            DocumentStore::new(tmp.path()),
            batch,
            Duration::from_millis(1),
        );
        (tmp, index, sync)
    }

    #[tokio::test]
    async fn converges_on_live_set() {
        let (_tmp, index, sync) = setup(1);
        index
            .upsert_documents(&[doc("gone", "old.txt"), doc("kept", "k.txt")], &[])
            .await
            .unwrap();
        index
            .upsert_chunks(&[ChunkDocument {
                id: "gone-text-0".into(),
                file_id: "gone".into(),
                module: "text".into(),
                index: 0,
                text: "stale".into(),
            }])
            .await
            .unwrap();

        let live: BTreeMap<String, Document> = [doc("kept", "k.txt"), doc("new", "n.txt")]
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        let report = sync.reconcile(&[], &live).await.unwrap();

        assert_eq!(report, IndexSyncReport { deleted: 1, upserted: 1 });
        let ids: Vec<String> = index.all_ids().await.unwrap().into_iter().collect();
        assert_eq!(ids, vec!["kept", "new"]);
        assert!(index.chunks_for("gone").is_empty());
        assert!(index.exists().await.unwrap());
    }

    #[tokio::test]
    async fn empty_sets_are_fine() {
        let (_tmp, _index, sync) = setup(10);
        let report = sync.reconcile(&[], &BTreeMap::new()).await.unwrap();
        assert_eq!(report, IndexSyncReport::default());
    }

    #[tokio::test]
    async fn waits_for_pending_tasks() {
        let (_tmp, index, sync) = setup(10);
        index.simulate_pending(3);
        sync.reconcile(&[], &BTreeMap::new()).await.unwrap();
        assert_eq!(index.pending_tasks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stored_content_is_searchable() {
        let (tmp, index, sync) = setup(10);
        let store = DocumentStore::new(tmp.path());
        store.write_content("abc", "text", "quarterly report").unwrap();
        let mut d = doc("abc", "r.txt");
        d.modules_done.insert("text".into());

        sync.publish(&d).await.unwrap();
        let hits = index
            .search("quarterly", &SearchFilter::default(), 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }
}
