//! Core data models shared by the sync engine, the dispatcher and workers.
//!
//! A [`Document`] describes one unique file content (keyed by its content
//! hash) together with every relative path where that content was observed.
//! Module outputs live next to the well-known fields as namespaced JSON
//! objects, one per module.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema version written by this build. See [`crate::migrations`].
pub const CURRENT_VERSION: u32 = 3;

/// Per-content-hash document, persisted as `by-id/<id>/document.json`.
///
/// Field order here is the serialized order, which keeps the persisted JSON
/// diffable between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub paths: BTreeMap<String, f64>,
    #[serde(default)]
    pub paths_list: Vec<String>,
    #[serde(default)]
    pub mtime: f64,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type", default)]
    pub mime_type: String,
    #[serde(default)]
    pub copies: usize,
    #[serde(default)]
    pub next: String,
    #[serde(default)]
    pub has_archive_paths: bool,
    #[serde(default)]
    pub offline: bool,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub modules_done: BTreeSet<String>,
    /// Module namespaces: key is the module name, value its output object.
    #[serde(flatten)]
    pub modules: BTreeMap<String, Value>,
}

impl Document {
    /// A fresh document for a hash observed for the first time.
    pub fn new(id: impl Into<String>, size: u64) -> Self {
        Self {
            id: id.into(),
            paths: BTreeMap::new(),
            paths_list: Vec::new(),
            mtime: 0.0,
            size,
            mime_type: String::new(),
            copies: 0,
            next: String::new(),
            has_archive_paths: false,
            offline: false,
            version: CURRENT_VERSION,
            modules_done: BTreeSet::new(),
            modules: BTreeMap::new(),
        }
    }

    /// Record `relpath` with its observed mtime and refresh derived fields.
    pub fn add_path(&mut self, relpath: &str, mtime: f64) {
        self.paths.insert(relpath.to_string(), mtime);
        self.refresh_paths();
    }

    /// Drop every path for which `keep` returns false and refresh derived fields.
    pub fn retain_paths<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.paths.retain(|p, _| keep(p));
        self.refresh_paths();
    }

    /// Recompute `paths_list`, `copies`, `mtime` and `type` from `paths`.
    pub fn refresh_paths(&mut self) {
        self.paths_list = self.paths.keys().cloned().collect();
        self.copies = self.paths.len();
        self.mtime = self.paths.values().copied().fold(0.0, f64::max);
        if let Some(first) = self.paths_list.first() {
            self.mime_type = guess_mime(first);
        }
    }

    /// The output namespace of `module`, if it has written one.
    pub fn namespace(&self, module: &str) -> Option<&Map<String, Value>> {
        self.modules.get(module).and_then(Value::as_object)
    }

    /// Mutable access to `module`'s namespace, creating it on demand.
    pub fn namespace_mut(&mut self, module: &str) -> &mut Map<String, Value> {
        let entry = self
            .modules
            .entry(module.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        match entry {
            Value::Object(map) => map,
            _ => unreachable!("namespace was just normalized to an object"),
        }
    }
}

/// MIME type derived from a path's extension.
pub fn guess_mime(relpath: &str) -> String {
    mime_guess::from_path(relpath)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// A derived search document produced by a module (e.g. a text chunk).
///
/// Chunk documents are keyed by `file_id` so they can be dropped together
/// with the file they were derived from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkDocument {
    pub id: String,
    pub file_id: String,
    pub module: String,
    pub index: i64,
    pub text: String,
}

/// What a module's `process` call hands back to the dispatcher.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleOutput {
    /// The document as the module sees it. Only the module's own namespace
    /// is merged back into the canonical document.
    #[serde(default)]
    pub document: Option<Document>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub chunks: Option<Vec<ChunkDocument>>,
    #[serde(default)]
    pub delete_chunk_ids: Option<Vec<String>>,
}

/// Outcome of a lookup that may legitimately find nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Found(T),
    NotFound,
}

impl<T> Lookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            Lookup::Found(v) => Some(v),
            Lookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, Lookup::Found(_))
    }
}

impl<T> From<Option<T>> for Lookup<T> {
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Lookup::Found(v),
            None => Lookup::NotFound,
        }
    }
}

/// A single search hit returned by a [`crate::index::SearchIndex`].
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    /// Document hash for file hits, chunk id for chunk hits.
    pub id: String,
    pub file_id: String,
    pub paths: Vec<String>,
    pub next: String,
    pub score: f64,
    pub snippet: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_path_refreshes_derived_fields() {
        let mut doc = Document::new("abc", 2);
        doc.add_path("b.txt", 20.0);
        doc.add_path("a.txt", 10.0);

        assert_eq!(doc.paths_list, vec!["a.txt", "b.txt"]);
        assert_eq!(doc.copies, 2);
        assert_eq!(doc.mtime, 20.0);
        assert_eq!(doc.mime_type, "text/plain");
    }

    #[test]
    fn retain_paths_recomputes_mtime() {
        let mut doc = Document::new("abc", 2);
        doc.add_path("a.txt", 10.0);
        doc.add_path("b.txt", 20.0);
        doc.retain_paths(|p| p == "a.txt");

        assert_eq!(doc.paths_list, vec!["a.txt"]);
        assert_eq!(doc.copies, 1);
        assert_eq!(doc.mtime, 10.0);
    }

    #[test]
    fn module_namespaces_round_trip_through_flatten() {
        let mut doc = Document::new("abc", 2);
        doc.add_path("a.txt", 1.0);
        doc.namespace_mut("text")
            .insert("chunks".into(), Value::from(3));

        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"type\":\"text/plain\""));
        assert!(json.contains("\"text\":{\"chunks\":3}"));

        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.namespace("text").unwrap()["chunks"], 3);
    }

    #[test]
    fn lookup_from_option() {
        assert!(Lookup::from(Some(1)).is_found());
        assert_eq!(Lookup::<u8>::from(None), Lookup::NotFound);
    }
}
