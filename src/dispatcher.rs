//! Module queue dispatcher.
//!
//! The dispatcher owns the canonical side of the pipeline. It enqueues
//! documents whose `next` names a module onto that module's check queue,
//! and it drains the shared done list, merging each completion back into
//! the stored document before advancing `next` and republishing it.
//!
//! ```text
//!   index / live set ──(next == m)──► m:check ──► workers ──► done
//!         ▲                                                    │
//!         └──── publish ◄── store.write ◄── merge + advance ◄──┘
//! ```
//!
//! Enqueueing is deduplicated by document id against every list a job can
//! sit in (check, run, both processing lists and the done list), so a
//! document never has two jobs for the same module in flight.

use anyhow::Result;
use filedex_core::index::SearchIndex;
use filedex_core::models::Document;
use filedex_core::pipeline::Pipeline;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerConnector};
use crate::config::Config;
use crate::index_sync::SearchIndexSync;
use crate::queue::{DoneRecord, Job, Outcome, QueueKeys};
use crate::store::DocumentStore;

/// Pause after a broker failure before retrying.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub completed: usize,
    pub stale: usize,
    pub enqueued: usize,
}

impl DispatchReport {
    pub fn is_idle(&self) -> bool {
        self.completed == 0 && self.stale == 0 && self.enqueued == 0
    }
}

pub struct Dispatcher {
    broker: RwLock<Arc<dyn Broker>>,
    connector: Arc<dyn BrokerConnector>,
    keys: QueueKeys,
    pipeline: Pipeline,
    index: Arc<dyn SearchIndex>,
    index_sync: SearchIndexSync,
    store: DocumentStore,
    batch_size: usize,
    poll_min: Duration,
    poll_max: Duration,
    sync_lock: Arc<RwLock<()>>,
    pass_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        config: &Config,
        broker: Arc<dyn Broker>,
        connector: Arc<dyn BrokerConnector>,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        let store = DocumentStore::new(config.metadata_root());
        Self {
            broker: RwLock::new(broker),
            connector,
            keys: QueueKeys::new(config.queue.prefix.clone()),
            pipeline: config.pipeline(),
            index_sync: SearchIndexSync::new(
                index.clone(),
                store.clone(),
                config.search.batch_size,
                Duration::from_millis(config.search.settle_poll_ms),
            ),
            index,
            store,
            batch_size: config.search.batch_size,
            poll_min: Duration::from_millis(config.queue.poll_min_ms),
            poll_max: Duration::from_millis(config.queue.poll_max_ms),
            sync_lock: Arc::new(RwLock::new(())),
            pass_lock: Mutex::new(()),
        }
    }

    /// Share the lock a reconciliation run holds for writing; each
    /// dispatcher iteration holds it for reading.
    pub fn with_sync_lock(mut self, lock: Arc<RwLock<()>>) -> Self {
        self.sync_lock = lock;
        self
    }

    async fn broker(&self) -> Arc<dyn Broker> {
        self.broker.read().await.clone()
    }

    /// Enqueue candidates for `module`. With `live`, candidates come from
    /// that document set; otherwise from the search index. Returns how many
    /// jobs were enqueued.
    pub async fn service_queue(&self, module: &str, live: Option<&[Document]>) -> Result<usize> {
        let candidates: Vec<Document> = match live {
            Some(docs) => docs.iter().filter(|d| d.next == module).cloned().collect(),
            None => self.index.find_by_next(module, self.batch_size).await?,
        };
        if candidates.is_empty() {
            return Ok(0);
        }

        let broker = self.broker().await;
        let mut in_flight = self.in_flight(broker.as_ref(), module).await?;
        let check = self.keys.check(module);
        let mut enqueued = 0;
        for doc in candidates {
            if !in_flight.insert(doc.id.clone()) {
                continue;
            }
            let job = Job::new(module, doc, None);
            broker.push_back(&check, &job.encode()?).await?;
            enqueued += 1;
        }

        if enqueued > 0 {
            debug!(module, enqueued, "enqueued documents");
        }
        Ok(enqueued)
    }

    /// Document ids that already have a job for `module` somewhere.
    async fn in_flight(&self, broker: &dyn Broker, module: &str) -> Result<HashSet<String>> {
        let mut ids = HashSet::new();
        for key in self.keys.module_lists(module) {
            for raw in broker.range(&key).await? {
                if let Ok(job) = Job::decode(&raw) {
                    ids.insert(job.document.id);
                }
            }
        }
        for raw in broker.range(&self.keys.done()).await? {
            if let Ok(record) = DoneRecord::decode(&raw) {
                if record.module == module {
                    ids.insert(record.document_id);
                }
            }
        }
        Ok(ids)
    }

    /// Drain the done list, merging every completion.
    pub async fn process_done_queue(&self) -> Result<DispatchReport> {
        let broker = self.broker().await;
        let done = self.keys.done();
        let mut report = DispatchReport::default();

        while let Some(raw) = broker.pop_front(&done).await? {
            let record = match DoneRecord::decode(&raw) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "dropping malformed done record");
                    continue;
                }
            };
            match self.complete(record).await {
                Ok(true) => report.completed += 1,
                Ok(false) => report.stale += 1,
                Err(e) => {
                    broker.push_front(&done, &raw).await?;
                    return Err(e);
                }
            }
        }
        Ok(report)
    }

    /// Merge one completion. Returns `false` for stale records.
    async fn complete(&self, record: DoneRecord) -> Result<bool> {
        let module = record.module.as_str();
        let Some(loaded) = self.store.read(&record.document_id)?.found() else {
            debug!(module, document = %record.document_id, "stale completion: document gone");
            return Ok(false);
        };
        let mut doc = loaded.doc;
        if doc.next != module {
            debug!(module, document = %doc.id, next = %doc.next, "stale completion: document moved on");
            return Ok(false);
        }

        match record.outcome {
            Outcome::Skipped => {}
            Outcome::Processed { output } => {
                if let Some(namespace) = output.document.and_then(|mut d| d.modules.remove(module)) {
                    doc.modules.insert(module.to_string(), namespace);
                }
                if let Some(content) = output.content {
                    self.store.write_content(&doc.id, module, &content)?;
                }
                if let Some(ids) = output.delete_chunk_ids.filter(|ids| !ids.is_empty()) {
                    self.index.delete_chunks(&ids).await?;
                }
                if let Some(chunks) = output.chunks.filter(|c| !c.is_empty()) {
                    self.index.upsert_chunks(&chunks).await?;
                }
            }
            Outcome::Failed { error } => {
                warn!(module, document = %doc.id, error = %error, "module failed on document");
                doc.namespace_mut(module)
                    .insert("error".into(), Value::String(error));
            }
        }

        doc.modules_done.insert(module.to_string());
        doc.next = self.pipeline.next_after(module, &doc);
        self.store.write(&doc)?;
        self.index_sync.publish(&doc).await?;
        debug!(module, document = %doc.id, next = %doc.next, "completion merged");
        Ok(true)
    }

    /// One dispatcher pass: drain completions, then service every module.
    ///
    /// Passes are serialized; concurrent in-flight scans would both see a
    /// document as unqueued.
    pub async fn iterate(&self, live: Option<&[Document]>) -> Result<DispatchReport> {
        let _serial = self.pass_lock.lock().await;
        let mut report = self.process_done_queue().await?;
        for module in self.pipeline.modules() {
            report.enqueued += self.service_queue(module, live).await?;
        }
        Ok(report)
    }

    /// Continuous loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(modules = ?self.pipeline.modules(), "dispatcher started");
        let mut backoff = self.poll_min;

        while !cancel.is_cancelled() {
            let result = {
                let _guard = self.sync_lock.read().await;
                self.iterate(None).await
            };
            match result {
                Ok(report) if !report.is_idle() => {
                    backoff = self.poll_min;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "dispatcher iteration failed, reconnecting broker");
                    self.reconnect().await;
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                    continue;
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.poll_max);
        }

        info!("dispatcher stopped");
        Ok(())
    }

    async fn reconnect(&self) {
        match self.connector.connect().await {
            Ok(broker) => *self.broker.write().await = broker,
            Err(e) => warn!(error = %e, "broker reconnect failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, SharedBroker};
    use crate::config::ModuleConfig;
    use filedex_core::index::memory::InMemoryIndex;
    use filedex_core::index::SearchFilter;
    use filedex_core::models::{ChunkDocument, ModuleOutput};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        broker: Arc<InMemoryBroker>,
        index: Arc<InMemoryIndex>,
        store: DocumentStore,
        dispatcher: Dispatcher,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::minimal(tmp.path());
        config.queue.prefix = "t".into();
        config.queue.poll_min_ms = 1;
        config.queue.poll_max_ms = 5;
        for name in ["scrape", "text"] {
            let m: ModuleConfig =
                toml::from_str(&format!("name = \"{}\"\nkind = \"text\"", name)).unwrap();
            config.modules.push(m);
        }
        let broker = Arc::new(InMemoryBroker::new());
        let index = Arc::new(InMemoryIndex::new());
        let dispatcher = Dispatcher::new(
            &config,
            broker.clone(),
            Arc::new(SharedBroker(broker.clone())),
            index.clone(),
        );
        Fixture {
            store: DocumentStore::new(config.metadata_root()),
            _tmp: tmp,
            broker,
            index,
            dispatcher,
        }
    }

    fn doc(id: &str, next: &str) -> Document {
        let mut d = Document::new(id, 10);
        d.add_path(&format!("{}.txt", id), 1.0);
        d.next = next.to_string();
        d
    }

    async fn push_done(broker: &InMemoryBroker, record: DoneRecord) {
        broker.push_back("t:done", &record.encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_is_deduplicated_by_document() {
        let f = fixture();
        let live = vec![doc("a", "scrape"), doc("b", "text"), doc("c", "")];

        assert_eq!(f.dispatcher.service_queue("scrape", Some(&live)).await.unwrap(), 1);
        assert_eq!(f.dispatcher.service_queue("scrape", Some(&live)).await.unwrap(), 0);

        // Claimed jobs still count as in flight.
        let raw = f.broker.pop_move("t:scrape:check", "t:scrape:run:processing").await.unwrap();
        assert!(raw.is_some());
        assert_eq!(f.dispatcher.service_queue("scrape", Some(&live)).await.unwrap(), 0);

        assert_eq!(f.dispatcher.service_queue("text", Some(&live)).await.unwrap(), 1);
        assert_eq!(f.broker.len("t:text:check").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn steady_state_candidates_come_from_the_index() {
        let f = fixture();
        f.index
            .upsert_documents(&[doc("a", "text"), doc("b", "scrape")], &[])
            .await
            .unwrap();

        let report = f.dispatcher.iterate(None).await.unwrap();
        assert_eq!(report.enqueued, 2);
        let raw = f.broker.range("t:text:check").await.unwrap();
        assert_eq!(Job::decode(&raw[0]).unwrap().document.id, "a");
    }

    #[tokio::test]
    async fn completion_merges_own_namespace_and_advances() {
        let f = fixture();
        let mut stored = doc("a", "scrape");
        stored.namespace_mut("text").insert("chunks".into(), json!(1));
        f.store.write(&stored).unwrap();

        let mut returned = stored.clone();
        returned.namespace_mut("scrape").insert("title".into(), json!("A"));
        returned.namespace_mut("text").insert("chunks".into(), json!(99));
        let job = Job::new("scrape", stored.clone(), None);
        push_done(
            &f.broker,
            DoneRecord::new(
                &job,
                Outcome::Processed {
                    output: ModuleOutput {
                        document: Some(returned),
                        content: Some("alpha body".into()),
                        chunks: Some(vec![ChunkDocument {
                            id: "a-scrape-0".into(),
                            file_id: "a".into(),
                            module: "scrape".into(),
                            index: 0,
                            text: "alpha body".into(),
                        }]),
                        delete_chunk_ids: None,
                    },
                },
            ),
        )
        .await;

        let report = f.dispatcher.process_done_queue().await.unwrap();
        assert_eq!(report.completed, 1);

        let merged = f.store.read("a").unwrap().found().unwrap().doc;
        assert_eq!(merged.namespace("scrape").unwrap()["title"], json!("A"));
        assert_eq!(merged.namespace("text").unwrap()["chunks"], json!(1));
        assert!(merged.modules_done.contains("scrape"));
        assert_eq!(merged.next, "text");
        assert_eq!(
            f.store.read_content("a", "scrape").unwrap().as_deref(),
            Some("alpha body")
        );

        let indexed = f.index.get("a").await.unwrap().found().unwrap();
        assert_eq!(indexed.next, "text");
        assert_eq!(f.index.chunks_for("a").len(), 1);
        let hits = f
            .index
            .search("alpha", &SearchFilter::default(), 10)
            .await
            .unwrap();
        assert_eq!(hits[0].file_id, "a");
    }

    #[tokio::test]
    async fn stale_and_failed_records() {
        let f = fixture();
        f.store.write(&doc("a", "text")).unwrap();

        // `a` is waiting on text, so a scrape completion is stale.
        let scrape_job = Job::new("scrape", doc("a", "scrape"), None);
        push_done(&f.broker, DoneRecord::new(&scrape_job, Outcome::Skipped)).await;
        // `gone` has no stored document.
        let gone_job = Job::new("text", doc("gone", "text"), None);
        push_done(&f.broker, DoneRecord::new(&gone_job, Outcome::Skipped)).await;
        let text_job = Job::new("text", doc("a", "text"), None);
        push_done(
            &f.broker,
            DoneRecord::new(
                &text_job,
                Outcome::Failed {
                    error: "unreadable".into(),
                },
            ),
        )
        .await;

        let report = f.dispatcher.process_done_queue().await.unwrap();
        assert_eq!(report.stale, 2);
        assert_eq!(report.completed, 1);

        let a = f.store.read("a").unwrap().found().unwrap().doc;
        assert_eq!(a.next, "");
        assert_eq!(a.namespace("text").unwrap()["error"], json!("unreadable"));
        assert!(!a.modules_done.contains("scrape"));
    }

    #[tokio::test]
    async fn reconnect_swaps_in_the_new_broker() {
        let f = fixture();
        let stored = doc("a", "text");
        f.store.write(&stored).unwrap();

        let replacement = Arc::new(InMemoryBroker::new());
        let dispatcher = Arc::new(Dispatcher {
            connector: Arc::new(SharedBroker(replacement.clone())),
            ..f.dispatcher
        });
        f.broker.set_unavailable(true);
        let job = Job::new("text", stored, None);
        push_done(&replacement, DoneRecord::new(&job, Outcome::Skipped)).await;

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            async move { dispatcher.run(cancel).await }
        });

        let mut merged = false;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if f.store.read("a").unwrap().found().unwrap().doc.next.is_empty() {
                merged = true;
                break;
            }
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(merged);
        assert_eq!(replacement.len("t:done").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn loop_survives_a_broker_outage() {
        let f = fixture();
        let stored = doc("a", "text");
        f.store.write(&stored).unwrap();

        let dispatcher = Arc::new(f.dispatcher);
        let cancel = CancellationToken::new();
        f.broker.set_unavailable(true);
        let handle = tokio::spawn({
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            async move { dispatcher.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        f.broker.set_unavailable(false);
        let job = Job::new("text", stored, None);
        push_done(&f.broker, DoneRecord::new(&job, Outcome::Skipped)).await;

        let mut merged = false;
        for _ in 0..60 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if f.store.read("a").unwrap().found().unwrap().doc.next.is_empty() {
                merged = true;
                break;
            }
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();
        assert!(merged);
    }
}
