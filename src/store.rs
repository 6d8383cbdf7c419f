//! Per-hash document persistence under `<metadata_root>/by-id/`.
//!
//! Layout:
//!
//! ```text
//! by-id/<hash>/document.json      canonical document
//! by-id/<hash>/<module>.content   large text output of a module
//! by-id/<hash>/<module>/          module working directory
//! pipeline.json                   module list seen by the last sync
//! ```
//!
//! Writes go to a temp file in the same directory and are renamed into
//! place, so a reader never observes a partially written document.

use anyhow::{Context, Result};
use filedex_core::migrations;
use filedex_core::models::{Document, Lookup};
use filedex_core::pipeline::Pipeline;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

const DOCUMENT_FILE: &str = "document.json";
const PIPELINE_FILE: &str = "pipeline.json";

/// A document read from disk, with whether migrations changed it.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub doc: Document,
    pub migrated: bool,
}

#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(metadata_root: impl Into<PathBuf>) -> Self {
        Self {
            root: metadata_root.into(),
        }
    }

    pub fn metadata_root(&self) -> &Path {
        &self.root
    }

    pub fn by_id_root(&self) -> PathBuf {
        self.root.join("by-id")
    }

    pub fn doc_dir(&self, id: &str) -> PathBuf {
        self.by_id_root().join(id)
    }

    /// Create `by-id/` if it does not exist yet.
    pub fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(self.by_id_root())
            .with_context(|| format!("Failed to create {}", self.by_id_root().display()))
    }

    /// Atomically persist `doc` as `by-id/<id>/document.json`.
    pub fn write(&self, doc: &Document) -> Result<()> {
        let dir = self.doc_dir(&doc.id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let json = serde_json::to_vec_pretty(doc)?;
        write_atomic(&dir.join(DOCUMENT_FILE), &json)
    }

    pub fn read(&self, id: &str) -> Result<Lookup<LoadedDocument>> {
        let path = self.doc_dir(id).join(DOCUMENT_FILE);
        if !path.exists() {
            return Ok(Lookup::NotFound);
        }
        Ok(Lookup::Found(read_document(&path)?))
    }

    /// Read every stored document, `workers` at a time.
    ///
    /// A directory without a readable `document.json` is corrupt and is
    /// removed; the next sync recreates it from the file on disk.
    pub async fn read_all(&self, workers: usize) -> Result<Vec<LoadedDocument>> {
        let by_id = self.by_id_root();
        if !by_id.exists() {
            return Ok(Vec::new());
        }

        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&by_id)
            .with_context(|| format!("Failed to list {}", by_id.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(entry.path());
            }
        }

        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();
        for dir in dirs {
            let permit = semaphore.clone().acquire_owned().await?;
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let path = dir.join(DOCUMENT_FILE);
                match read_document(&path) {
                    Ok(loaded) => Ok(Some(loaded)),
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "removing corrupt document directory");
                        std::fs::remove_dir_all(&dir)
                            .with_context(|| format!("Failed to remove {}", dir.display()))?;
                        Ok::<_, anyhow::Error>(None)
                    }
                }
            });
        }

        let mut docs = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Some(loaded) = joined?? {
                docs.push(loaded);
            }
        }
        docs.sort_by(|a, b| a.doc.id.cmp(&b.doc.id));
        Ok(docs)
    }

    /// Remove the document directory for `id`, including module outputs.
    pub fn delete(&self, id: &str) -> Result<()> {
        let dir = self.doc_dir(id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                debug!(id, "deleted document directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", dir.display())),
        }
    }

    pub fn content_path(&self, id: &str, module: &str) -> PathBuf {
        self.doc_dir(id).join(format!("{}.content", module))
    }

    pub fn write_content(&self, id: &str, module: &str, text: &str) -> Result<()> {
        let dir = self.doc_dir(id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        write_atomic(&self.content_path(id, module), text.as_bytes())
    }

    pub fn read_content(&self, id: &str, module: &str) -> Result<Option<String>> {
        let path = self.content_path(id, module);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Working directory for `module` on document `id`, created on demand.
    pub fn workdir(&self, id: &str, module: &str) -> Result<PathBuf> {
        let dir = self.doc_dir(id).join(module);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    pub fn read_pipeline_snapshot(&self) -> Result<Option<Pipeline>> {
        let path = self.root.join(PIPELINE_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes).with_context(|| {
                format!("Failed to parse {}", path.display())
            })?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    pub fn write_pipeline_snapshot(&self, pipeline: &Pipeline) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        write_atomic(
            &self.root.join(PIPELINE_FILE),
            &serde_json::to_vec_pretty(pipeline)?,
        )
    }
}

/// Bring a raw document object up to the current schema.
pub fn migrate(raw: &mut Map<String, Value>) -> bool {
    migrations::migrate(raw)
}

fn read_document(path: &Path) -> Result<LoadedDocument> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut raw: Map<String, Value> = serde_json::from_slice(&bytes)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let migrated = migrate(&mut raw);
    let doc: Document = serde_json::from_value(Value::Object(raw))
        .with_context(|| format!("Invalid document {}", path.display()))?;
    Ok(LoadedDocument { doc, migrated })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
    std::fs::write(&tmp, bytes).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))
}
