//! End-to-end scenarios over the library: reconciliation, index sync,
//! dispatch and workers wired together on in-memory backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use filedex::archive::DriveStatus;
use filedex::broker::{Broker, InMemoryBroker, SharedBroker};
use filedex::config::{Config, ModuleConfig};
use filedex::daemon::{Runtime, SyncSummary};
use filedex::module::Module;
use filedex::modules::text::TextModule;
use filedex::progress::NoProgress;
use filedex::queue::TimeoutEntry;
use filedex::worker::{sweep_timeouts, Worker};
use filedex_core::index::memory::InMemoryIndex;
use filedex_core::index::{SearchFilter, SearchIndex};
use filedex_core::models::{Document, ModuleOutput};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ═══════════════════════════════════════════════════════════════════════
// Harness
// ═══════════════════════════════════════════════════════════════════════

struct Harness {
    _tmp: TempDir,
    root: PathBuf,
    config: Config,
    runtime: Runtime,
    index: Arc<InMemoryIndex>,
    broker: Arc<InMemoryBroker>,
}

fn harness(modules: &[&str], archive: bool) -> Harness {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("root");
    std::fs::create_dir_all(&root).unwrap();

    let mut config = Config::minimal(&root);
    config.queue.prefix = "t".into();
    config.queue.poll_min_ms = 1;
    config.queue.poll_max_ms = 10;
    if archive {
        config.paths.archive_root = Some(root.join("archive"));
    }
    for name in modules {
        let module: ModuleConfig =
            toml::from_str(&format!("name = \"{}\"\nkind = \"text\"", name)).unwrap();
        config.modules.push(module);
    }

    let index = Arc::new(InMemoryIndex::new());
    let broker = Arc::new(InMemoryBroker::new());
    let runtime = Runtime::with_backends(
        &config,
        index.clone(),
        broker.clone(),
        Arc::new(SharedBroker(broker.clone())),
    );
    Harness {
        _tmp: tmp,
        root,
        config,
        runtime,
        index,
        broker,
    }
}

impl Harness {
    fn write(&self, rel: &str, body: &str) {
        let path = self.root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    async fn sync(&self) -> SyncSummary {
        self.runtime
            .sync_once(&CancellationToken::new(), &NoProgress)
            .await
            .unwrap()
            .unwrap()
    }

    fn documents(&self) -> Vec<Document> {
        let by_id = self.config.metadata_root().join("by-id");
        let mut docs = Vec::new();
        let Ok(entries) = std::fs::read_dir(by_id) else {
            return docs;
        };
        for entry in entries {
            let id = entry.unwrap().file_name().to_string_lossy().to_string();
            let loaded = self.runtime.engine().store().read(&id).unwrap().found().unwrap();
            docs.push(loaded.doc);
        }
        docs.sort_by(|a, b| a.paths_list.cmp(&b.paths_list));
        docs
    }

    fn only_document(&self) -> Document {
        let docs = self.documents();
        assert_eq!(docs.len(), 1, "expected one document, got {:?}", docs);
        docs.into_iter().next().unwrap()
    }

    /// Hash the `by-path` link of `relpath` points at.
    fn link(&self, relpath: &str) -> Option<String> {
        self.runtime.engine().links().target(relpath)
    }

    fn worker(&self, module: Arc<dyn Module>) -> Worker {
        let id = format!("{}-test", module.name());
        Worker::new(&self.config, module, self.broker.clone(), &id).unwrap()
    }

    /// Drive one job of `worker` through check and run.
    async fn work(&self, worker: &mut Worker) {
        assert!(worker.claim_check().await.unwrap());
        assert!(worker.claim_run().await.unwrap());
    }
}

/// Tags every document with its path count; never touches the file.
struct TagModule;

#[async_trait]
impl Module for TagModule {
    fn name(&self) -> &str {
        "tag"
    }

    async fn should_process(&self, _file: Option<&Path>, _doc: &Document, _workdir: &Path) -> Result<bool> {
        Ok(true)
    }

    async fn process(&self, _file: Option<&Path>, doc: &Document, _workdir: &Path) -> Result<ModuleOutput> {
        let mut updated = doc.clone();
        updated.namespace_mut("tag").insert("copies".into(), json!(doc.copies));
        // Writes outside its own namespace must be ignored by the merge.
        updated.namespace_mut("text").insert("hijacked".into(), json!(true));
        Ok(ModuleOutput {
            document: Some(updated),
            ..Default::default()
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Reconciliation
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn identical_files_share_one_document() {
    let h = harness(&[], false);
    h.write("a.txt", "same bytes");
    h.write("sub/b.txt", "same bytes");

    let summary = h.sync().await;
    assert_eq!(summary.sync.files_scanned, 2);
    assert_eq!(summary.sync.documents_live, 1);

    let doc = h.only_document();
    assert_eq!(doc.paths_list, ["a.txt", "sub/b.txt"]);
    assert_eq!(doc.copies, 2);
    assert_eq!(doc.id.len(), 16);
    assert_eq!(h.link("a.txt").as_deref(), Some(doc.id.as_str()));
    assert_eq!(h.link("sub/b.txt").as_deref(), Some(doc.id.as_str()));
    assert!(h.index.all_ids().await.unwrap().contains(&doc.id));
}

#[tokio::test]
async fn unchanged_tree_reuses_hashes_and_writes_nothing() {
    let h = harness(&[], false);
    h.write("a.txt", "alpha");
    h.write("b.txt", "beta");
    h.sync().await;

    let again = h.sync().await;
    assert_eq!(again.sync.hashes_reused, 2);
    assert_eq!(again.sync.documents_upserted, 0);
    assert_eq!(again.sync.documents_deleted, 0);
    assert_eq!(again.index.upserted, 0);
}

#[tokio::test]
async fn deletions_converge_documents_links_and_index() {
    let h = harness(&[], false);
    h.write("a.txt", "same bytes");
    h.write("b.txt", "same bytes");
    h.write("c.txt", "other bytes");
    h.sync().await;
    assert_eq!(h.documents().len(), 2);

    std::fs::remove_file(h.root.join("b.txt")).unwrap();
    let summary = h.sync().await;
    assert_eq!(summary.sync.links_removed, 1);
    assert_eq!(summary.sync.documents_deleted, 0);
    let shared = h.documents().into_iter().find(|d| d.paths.contains_key("a.txt")).unwrap();
    assert_eq!(shared.paths_list, ["a.txt"]);
    assert!(h.link("b.txt").is_none());

    std::fs::remove_file(h.root.join("a.txt")).unwrap();
    std::fs::remove_file(h.root.join("c.txt")).unwrap();
    let summary = h.sync().await;
    assert_eq!(summary.sync.documents_deleted, 2);
    assert_eq!(summary.index.deleted, 2);
    assert!(h.documents().is_empty());
    assert!(h.index.all_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn moved_file_keeps_module_output() {
    let h = harness(&["text"], false);
    h.write("old/a.txt", "a paragraph worth indexing");
    h.sync().await;

    let mut worker = h.worker(Arc::new(TextModule::new("text", 100, 1 << 20)));
    h.work(&mut worker).await;
    h.runtime.dispatcher().iterate(None).await.unwrap();
    assert!(h.only_document().modules_done.contains("text"));

    std::fs::create_dir_all(h.root.join("new")).unwrap();
    std::fs::rename(h.root.join("old/a.txt"), h.root.join("new/a.txt")).unwrap();
    let summary = h.sync().await;
    assert_eq!(summary.dispatch.enqueued, 0);

    let doc = h.only_document();
    assert_eq!(doc.paths_list, ["new/a.txt"]);
    assert!(doc.modules_done.contains("text"));
    assert_eq!(doc.next, "");
    assert!(h.link("old/a.txt").is_none());
}

// ═══════════════════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn documents_visit_modules_in_pipeline_order() {
    let h = harness(&["text", "tag"], false);
    h.write("notes.txt", "Quarterly planning notes.\n\nBudget review follows.");

    let summary = h.sync().await;
    assert_eq!(summary.dispatch.enqueued, 1);
    assert_eq!(h.only_document().next, "text");
    assert_eq!(h.broker.len("t:text:check").await.unwrap(), 1);
    assert_eq!(h.broker.len("t:tag:check").await.unwrap(), 0);

    let mut text = h.worker(Arc::new(TextModule::new("text", 100, 1 << 20)));
    h.work(&mut text).await;
    let report = h.runtime.dispatcher().iterate(None).await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.enqueued, 1);

    let doc = h.only_document();
    assert_eq!(doc.next, "tag");
    assert!(doc.modules_done.contains("text"));
    assert_eq!(h.broker.len("t:tag:check").await.unwrap(), 1);

    let mut tag = h.worker(Arc::new(TagModule));
    h.work(&mut tag).await;
    h.runtime.dispatcher().iterate(None).await.unwrap();

    let doc = h.only_document();
    assert_eq!(doc.next, "");
    assert_eq!(doc.namespace("tag").unwrap()["copies"], json!(1));
    assert!(doc.namespace("text").unwrap().get("hijacked").is_none());

    let hits = h
        .index
        .search("budget", &SearchFilter::default(), 10)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, doc.id);

    let chunked = SearchFilter {
        include_chunks: true,
        ..Default::default()
    };
    let hits = h.index.search("budget", &chunked, 10).await.unwrap();
    assert!(hits.iter().any(|hit| hit.file_id == doc.id && hit.id != doc.id));
}

#[tokio::test]
async fn crashed_job_is_redelivered_after_its_deadline() {
    let h = harness(&["text"], false);
    h.write("a.txt", "at least once");
    h.sync().await;

    // A worker claims the job and dies before acknowledging it.
    let claimed = h
        .broker
        .pop_move("t:text:check", "t:text:check:processing")
        .await
        .unwrap()
        .unwrap();
    let entry = TimeoutEntry {
        origin: "t:text:check".into(),
        processing: "t:text:check:processing".into(),
        job: claimed.clone(),
    };
    h.broker.zadd("t:timeouts", &entry.encode().unwrap(), 0.0).await.unwrap();

    // The claimed job still counts as in flight.
    let report = h.runtime.dispatcher().iterate(None).await.unwrap();
    assert_eq!(report.enqueued, 0);

    let keys = h.runtime.keys().clone();
    assert_eq!(sweep_timeouts(h.broker.as_ref(), &keys).await.unwrap(), 1);
    assert_eq!(h.broker.range("t:text:check").await.unwrap(), vec![claimed]);
    assert_eq!(h.broker.len("t:text:check:processing").await.unwrap(), 0);

    let mut worker = h.worker(Arc::new(TextModule::new("text", 100, 1 << 20)));
    h.work(&mut worker).await;
    h.runtime.dispatcher().iterate(None).await.unwrap();
    assert_eq!(h.only_document().next, "");
    assert_eq!(h.broker.zcard("t:timeouts").await.unwrap(), 0);
}

// ═══════════════════════════════════════════════════════════════════════
// Archive drives
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn archive_drive_markers_follow_pipeline_and_mounts() {
    let h = harness(&["text"], true);
    h.write("archive/drive1/x.txt", "archived words");
    let archive = h.runtime.engine().archive().clone();

    let summary = h.sync().await;
    assert_eq!(summary.sync.drives_pending, 1);
    assert_eq!(archive.drive_status("drive1"), Some(DriveStatus::Pending));

    let mut worker = h.worker(Arc::new(TextModule::new("text", 100, 1 << 20)));
    h.work(&mut worker).await;
    h.runtime.dispatcher().iterate(None).await.unwrap();

    let summary = h.sync().await;
    assert_eq!(summary.sync.drives_ready, 1);
    assert_eq!(archive.drive_status("drive1"), Some(DriveStatus::Ready));

    // Unmounting keeps the document, offline and without a next module.
    std::fs::remove_dir_all(h.root.join("archive/drive1")).unwrap();
    let summary = h.sync().await;
    assert_eq!(summary.sync.documents_deleted, 0);
    let doc = h.only_document();
    assert!(doc.offline);
    assert!(doc.has_archive_paths);
    assert_eq!(doc.next, "");
    assert_eq!(doc.paths_list, ["archive/drive1/x.txt"]);
    assert!(h.link("archive/drive1/x.txt").is_none());
    assert_eq!(archive.drive_status("drive1"), Some(DriveStatus::Pending));

    // Content kept on a detached drive stays referenced while a copy appears
    // on another drive.
    h.write("archive/drive2/x.txt", "archived words");
    h.sync().await;
    let doc = h.only_document();
    assert!(!doc.offline);
    assert_eq!(doc.paths_list, ["archive/drive1/x.txt", "archive/drive2/x.txt"]);
    assert!(doc.modules_done.contains("text"));
    assert_eq!(archive.drive_status("drive2"), Some(DriveStatus::Ready));
    assert_eq!(archive.drive_status("drive1"), Some(DriveStatus::Pending));

    // drive1 comes back without the file: its path folds away with its marker.
    std::fs::create_dir_all(h.root.join("archive/drive1")).unwrap();
    h.write("archive/drive1/other.txt", "unrelated");
    h.sync().await;
    let moved = h
        .documents()
        .into_iter()
        .find(|d| d.paths.contains_key("archive/drive2/x.txt"))
        .unwrap();
    assert_eq!(moved.paths_list, ["archive/drive2/x.txt"]);
    assert_eq!(archive.drive_status("drive2"), Some(DriveStatus::Ready));
}

#[tokio::test]
async fn moving_a_file_between_drives_moves_the_marker() {
    let h = harness(&["text"], true);
    h.write("archive/drive1/x.txt", "archived words");
    let archive = h.runtime.engine().archive().clone();

    h.sync().await;
    let mut worker = h.worker(Arc::new(TextModule::new("text", 100, 1 << 20)));
    h.work(&mut worker).await;
    h.runtime.dispatcher().iterate(None).await.unwrap();
    h.sync().await;
    assert_eq!(archive.drive_status("drive1"), Some(DriveStatus::Ready));

    std::fs::create_dir_all(h.root.join("archive/drive2")).unwrap();
    std::fs::rename(
        h.root.join("archive/drive1/x.txt"),
        h.root.join("archive/drive2/x.txt"),
    )
    .unwrap();
    let summary = h.sync().await;

    let doc = h.only_document();
    assert_eq!(doc.paths_list, ["archive/drive2/x.txt"]);
    assert_eq!(doc.next, "");
    assert!(!doc.offline);
    assert!(h.link("archive/drive1/x.txt").is_none());
    assert_eq!(h.link("archive/drive2/x.txt").as_deref(), Some(doc.id.as_str()));
    assert_eq!(summary.sync.links_removed, 1);
    assert_eq!(archive.drive_status("drive1"), None);
    assert_eq!(archive.drive_status("drive2"), Some(DriveStatus::Ready));
}

#[tokio::test]
async fn changing_the_pipeline_forces_drives_pending() {
    let h = harness(&[], true);
    h.write("archive/drive1/x.txt", "archived words");
    h.sync().await;
    let archive = h.runtime.engine().archive().clone();
    assert_eq!(archive.drive_status("drive1"), Some(DriveStatus::Ready));

    let mut config = h.config.clone();
    let module: ModuleConfig = toml::from_str("name = \"text\"\nkind = \"text\"").unwrap();
    config.modules.push(module);
    let runtime = Runtime::with_backends(
        &config,
        h.index.clone(),
        h.broker.clone(),
        Arc::new(SharedBroker(h.broker.clone())),
    );
    let summary = runtime
        .sync_once(&CancellationToken::new(), &NoProgress)
        .await
        .unwrap()
        .unwrap();
    assert!(summary.sync.pipeline_changed);
    assert_eq!(archive.drive_status("drive1"), Some(DriveStatus::Pending));
    assert_eq!(h.broker.len("t:text:check").await.unwrap(), 1);
}
