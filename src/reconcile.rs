//! Reconciliation of the index root against persisted documents.
//!
//! One run has three strictly ordered phases:
//!
//! 1. **Load**: read and migrate every stored document.
//! 2. **Walk**: enumerate and hash every file, merging paths into one live
//!    document per content hash.
//! 3. **Apply**: persist changed documents and their path links, remove
//!    what disappeared, then refresh archive drive markers.
//!
//! Each phase fans out to a bounded pool of blocking tasks. A run aborted
//! half-way leaves storage partially converged; the next run finishes it.

use anyhow::Result;
use filedex_core::models::Document;
use filedex_core::pipeline::Pipeline;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::archive::ArchiveAwareness;
use crate::config::Config;
use crate::hasher::{determine_hash, HashedFile};
use crate::links::PathLinkIndex;
use crate::progress::{SyncPhase, SyncProgressEvent, SyncProgressReporter};
use crate::scan::scan_index_root;
use crate::store::DocumentStore;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync cancelled")]
    Cancelled,
}

/// Counters for one reconciliation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub documents_loaded: usize,
    pub documents_migrated: usize,
    pub files_scanned: usize,
    pub files_skipped: usize,
    pub hashes_reused: usize,
    pub documents_live: usize,
    pub documents_upserted: usize,
    pub documents_deleted: usize,
    pub links_removed: usize,
    pub drives_ready: usize,
    pub drives_pending: usize,
    pub pipeline_changed: bool,
}

/// What a run hands to the search index and the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub report: SyncReport,
    /// Every live document, in processing priority order.
    pub live: Vec<Document>,
    /// Live documents that differed from their persisted version.
    pub upserts: Vec<Document>,
}

impl SyncOutcome {
    pub fn live_by_hash(&self) -> BTreeMap<String, Document> {
        self.live
            .iter()
            .map(|d| (d.id.clone(), d.clone()))
            .collect()
    }
}

pub struct ReconciliationEngine {
    index_root: PathBuf,
    store: DocumentStore,
    links: PathLinkIndex,
    archive: ArchiveAwareness,
    pipeline: Pipeline,
    exclude_globs: Vec<String>,
    hash_workers: usize,
    file_workers: usize,
    running: Mutex<()>,
}

impl ReconciliationEngine {
    pub fn new(config: &Config) -> Self {
        let metadata_root = config.metadata_root();
        Self {
            index_root: config.paths.index_root.clone(),
            store: DocumentStore::new(&metadata_root),
            links: PathLinkIndex::new(&metadata_root),
            archive: ArchiveAwareness::new(
                &config.paths.index_root,
                config.paths.archive_root.as_deref(),
            ),
            pipeline: config.pipeline(),
            exclude_globs: config.sync.exclude_globs.clone(),
            hash_workers: config.hash_workers(),
            file_workers: config.file_workers(),
            running: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    pub fn links(&self) -> &PathLinkIndex {
        &self.links
    }

    pub fn archive(&self) -> &ArchiveAwareness {
        &self.archive
    }

    /// Run once unless a run is already in progress, in which case the
    /// trigger is dropped and `None` is returned.
    pub async fn try_run(
        &self,
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
    ) -> Result<Option<SyncOutcome>> {
        let Ok(_guard) = self.running.try_lock() else {
            info!("sync already running, trigger dropped");
            return Ok(None);
        };
        self.run_locked(cancel, progress).await.map(Some)
    }

    /// Run once, waiting for any run in progress to finish first.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
    ) -> Result<SyncOutcome> {
        let _guard = self.running.lock().await;
        self.run_locked(cancel, progress).await
    }

    async fn run_locked(
        &self,
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
    ) -> Result<SyncOutcome> {
        let started = Instant::now();
        let mut report = SyncReport::default();
        info!(root = %self.index_root.display(), "sync started");

        let prior = self.load(cancel, progress, &mut report).await?;
        let live = self.walk(&prior, cancel, progress, &mut report).await?;
        let upserts = self.apply(&prior, &live, cancel, progress, &mut report).await?;

        report.documents_live = live.len();
        info!(
            scanned = report.files_scanned,
            reused = report.hashes_reused,
            upserted = report.documents_upserted,
            deleted = report.documents_deleted,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "sync finished"
        );

        Ok(SyncOutcome {
            report,
            live,
            upserts,
        })
    }

    async fn load(
        &self,
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
        report: &mut SyncReport,
    ) -> Result<PriorState> {
        self.store.ensure()?;
        let loaded = self.store.read_all(self.file_workers).await?;
        report.documents_loaded = loaded.len();

        let migrated: Vec<Document> = loaded
            .iter()
            .filter(|l| l.migrated)
            .map(|l| l.doc.clone())
            .collect();
        report.documents_migrated = migrated.len();
        if !migrated.is_empty() {
            info!(count = migrated.len(), "persisting migrated documents");
            let store = self.store.clone();
            let results = run_blocking(migrated, self.file_workers, cancel, move |doc| {
                store.write(&doc)
            }, |_| {})
            .await?;
            results.into_iter().collect::<Result<Vec<_>>>()?;
        }

        let mut docs_by_hash = HashMap::new();
        let mut hash_by_relpath = HashMap::new();
        let mut unmounted = BTreeSet::new();
        for l in loaded {
            for relpath in l.doc.paths.keys() {
                hash_by_relpath.insert(relpath.clone(), l.doc.id.clone());
            }
            if self.archive.is_unmounted_archive_doc(&l.doc) {
                unmounted.insert(l.doc.id.clone());
            }
            docs_by_hash.insert(l.doc.id.clone(), l.doc);
        }

        let total = docs_by_hash.len() as u64;
        progress.report(SyncProgressEvent {
            phase: SyncPhase::Loading,
            n: total,
            total,
        });
        debug!(
            documents = docs_by_hash.len(),
            paths = hash_by_relpath.len(),
            unmounted = unmounted.len(),
            "persisted state loaded"
        );

        Ok(PriorState {
            docs_by_hash: Arc::new(docs_by_hash),
            hash_by_relpath: Arc::new(hash_by_relpath),
            unmounted,
        })
    }

    async fn walk(
        &self,
        prior: &PriorState,
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
        report: &mut SyncReport,
    ) -> Result<Vec<Document>> {
        let index_root = self.index_root.clone();
        let metadata_root = self.store.metadata_root().to_path_buf();
        let archive = self.archive.clone();
        let excludes = self.exclude_globs.clone();
        let files = tokio::task::spawn_blocking(move || {
            scan_index_root(&index_root, &metadata_root, &archive, &excludes)
        })
        .await??;

        report.files_scanned = files.len();
        let total = files.len() as u64;

        let docs_by_hash = prior.docs_by_hash.clone();
        let hash_by_relpath = prior.hash_by_relpath.clone();
        let results = run_blocking(
            files,
            self.hash_workers,
            cancel,
            move |file| {
                determine_hash(&file.path, &file.relpath, &docs_by_hash, &hash_by_relpath)
                    .map_err(|e| (file.relpath, e))
            },
            |n| {
                progress.report(SyncProgressEvent {
                    phase: SyncPhase::Scanning,
                    n: n as u64,
                    total,
                })
            },
        )
        .await?;

        let mut hashed: Vec<HashedFile> = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(h) => hashed.push(h),
                Err((relpath, e)) => {
                    warn!(relpath, error = %e, "skipping file");
                    report.files_skipped += 1;
                }
            }
        }
        hashed.sort_by(|a, b| a.relpath.cmp(&b.relpath));
        report.hashes_reused = hashed.iter().filter(|h| h.reused).count();

        let mut live: BTreeMap<String, Document> = BTreeMap::new();
        for h in hashed {
            let doc = live.entry(h.hash.clone()).or_insert_with(|| {
                match prior.docs_by_hash.get(&h.hash) {
                    Some(persisted) => {
                        // Keep only paths on drives whose directory is gone.
                        let mut doc = persisted.clone();
                        doc.retain_paths(|p| self.archive.is_on_detached_drive(p));
                        doc.size = h.size;
                        doc
                    }
                    None => Document::new(&h.hash, h.size),
                }
            });
            doc.add_path(&h.relpath, h.mtime);
        }

        for hash in &prior.unmounted {
            if live.contains_key(hash) {
                continue;
            }
            let Some(persisted) = prior.docs_by_hash.get(hash) else {
                continue;
            };
            let mut doc = persisted.clone();
            doc.retain_paths(|p| self.archive.is_on_unmounted_drive(p));
            if !doc.paths.is_empty() {
                live.insert(hash.clone(), doc);
            }
        }

        let mut ordered: Vec<(Option<String>, Document)> = live
            .into_values()
            .map(|mut doc| {
                self.archive.update_archive_flags(&mut doc);
                let previous = prior
                    .docs_by_hash
                    .get(&doc.id)
                    .map(|d| d.next.as_str())
                    .unwrap_or("");
                doc.next = self.pipeline.assign_next(&doc, previous);
                (self.archive.reachable_drive(&doc), doc)
            })
            .collect();

        // Reachable archive drives drain first so their markers turn ready.
        ordered.sort_by(|(da, a), (db, b)| {
            da.is_none()
                .cmp(&db.is_none())
                .then_with(|| da.cmp(db))
                .then_with(|| a.paths_list.cmp(&b.paths_list))
        });

        Ok(ordered.into_iter().map(|(_, doc)| doc).collect())
    }

    async fn apply(
        &self,
        prior: &PriorState,
        live: &[Document],
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
        report: &mut SyncReport,
    ) -> Result<Vec<Document>> {
        let upserts: Vec<Document> = live
            .iter()
            .filter(|doc| differs(doc, prior.docs_by_hash.get(&doc.id)))
            .cloned()
            .collect();
        report.documents_upserted = upserts.len();

        let live_paths: BTreeSet<&str> = live
            .iter()
            .flat_map(|d| d.paths.keys().map(String::as_str))
            .collect();
        let stale_links: Vec<String> = prior
            .hash_by_relpath
            .keys()
            .filter(|p| !live_paths.contains(p.as_str()))
            .cloned()
            .collect();
        let live_ids: BTreeSet<&str> = live.iter().map(|d| d.id.as_str()).collect();
        let stale_docs: Vec<String> = prior
            .docs_by_hash
            .keys()
            .filter(|id| !live_ids.contains(id.as_str()))
            .cloned()
            .collect();

        let total = (upserts.len() + stale_links.len() + stale_docs.len()) as u64;
        let mut done = 0u64;

        let store = self.store.clone();
        let links = self.links.clone();
        let results = run_blocking(
            upserts.clone(),
            self.file_workers,
            cancel,
            move |doc| -> Result<()> {
                store.write(&doc)?;
                for relpath in doc.paths.keys() {
                    if doc.offline {
                        links.unlink(relpath)?;
                    } else {
                        links.link(relpath, &doc.id)?;
                    }
                }
                Ok(())
            },
            |n| {
                progress.report(SyncProgressEvent {
                    phase: SyncPhase::Applying,
                    n: n as u64,
                    total,
                })
            },
        )
        .await?;
        results.into_iter().collect::<Result<Vec<_>>>()?;
        done += upserts.len() as u64;

        for relpath in &stale_links {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled.into());
            }
            self.links.unlink(relpath)?;
        }
        report.links_removed = stale_links.len();
        done += stale_links.len() as u64;

        for id in &stale_docs {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled.into());
            }
            self.store.delete(id)?;
            info!(id, "document removed");
        }
        report.documents_deleted = stale_docs.len();
        done += stale_docs.len() as u64;
        progress.report(SyncProgressEvent {
            phase: SyncPhase::Applying,
            n: done,
            total,
        });

        let snapshot = self.store.read_pipeline_snapshot()?;
        let pipeline_changed = snapshot.as_ref().map_or(false, |s| s != &self.pipeline);
        if pipeline_changed {
            info!("module pipeline changed since last sync, forcing drives to pending");
        }
        report.pipeline_changed = pipeline_changed;

        let markers = self.archive.update_drive_markers(live, pipeline_changed)?;
        report.drives_ready = markers.ready;
        report.drives_pending = markers.pending;

        if snapshot.as_ref() != Some(&self.pipeline) {
            self.store.write_pipeline_snapshot(&self.pipeline)?;
        }

        Ok(upserts)
    }
}

struct PriorState {
    docs_by_hash: Arc<HashMap<String, Document>>,
    hash_by_relpath: Arc<HashMap<String, String>>,
    /// Documents whose every path is a missing archive path.
    unmounted: BTreeSet<String>,
}

/// Whether `live` must be persisted over `persisted`.
fn differs(live: &Document, persisted: Option<&Document>) -> bool {
    let Some(p) = persisted else {
        return true;
    };
    live.paths != p.paths
        || live.next != p.next
        || live.paths_list != p.paths_list
        || live.version != p.version
        || live.has_archive_paths != p.has_archive_paths
        || live.offline != p.offline
        || live.size != p.size
        || live.mime_type != p.mime_type
        || live.mtime != p.mtime
        || live.modules_done != p.modules_done
}

/// Run `f` over `items` on the blocking pool, at most `workers` at a time.
///
/// Cancellation is checked before each item is started; `on_done` receives
/// the number of completed items.
async fn run_blocking<T, R, F, P>(
    items: Vec<T>,
    workers: usize,
    cancel: &CancellationToken,
    f: F,
    mut on_done: P,
) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
    P: FnMut(usize),
{
    let f = Arc::new(f);
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut tasks = JoinSet::new();
    let mut results = Vec::with_capacity(items.len());

    for item in items {
        let permit = semaphore.clone().acquire_owned().await?;
        if cancel.is_cancelled() {
            tasks.abort_all();
            return Err(SyncError::Cancelled.into());
        }
        let f = f.clone();
        tasks.spawn_blocking(move || {
            let _permit = permit;
            f(item)
        });
        while let Some(joined) = tasks.try_join_next() {
            results.push(joined?);
            on_done(results.len());
        }
    }

    while let Some(joined) = tasks.join_next().await {
        results.push(joined?);
        on_done(results.len());
    }
    Ok(results)
}
