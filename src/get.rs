//! Document retrieval by hash or relative path.
//!
//! `fdx get` accepts either a content hash or a path relative to the index
//! root; a path is resolved through its `by-path` link.

use anyhow::{bail, Result};
use filedex_core::models::{Document, Lookup};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::Config;
use crate::links::PathLinkIndex;
use crate::store::DocumentStore;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentResponse {
    pub document: Document,
    /// Stored text output per module.
    pub content: BTreeMap<String, String>,
}

/// Resolve `key` (hash first, then relative path) to a stored document.
pub fn get_document(config: &Config, key: &str) -> Result<Lookup<DocumentResponse>> {
    let store = DocumentStore::new(config.metadata_root());
    let links = PathLinkIndex::new(&config.metadata_root());

    let mut found = store.read(key)?;
    if !found.is_found() {
        let relpath = key.trim_start_matches("./").trim_start_matches('/');
        if let Some(hash) = links.target(relpath) {
            found = store.read(&hash)?;
        }
    }
    let Some(loaded) = found.found() else {
        return Ok(Lookup::NotFound);
    };

    let mut content = BTreeMap::new();
    for module in &loaded.doc.modules_done {
        if let Some(text) = store.read_content(&loaded.doc.id, module)? {
            content.insert(module.clone(), text);
        }
    }

    Ok(Lookup::Found(DocumentResponse {
        document: loaded.doc,
        content,
    }))
}

/// CLI entry point: print the document (and any module content) to stdout.
pub fn run_get(config: &Config, key: &str, json: bool) -> Result<()> {
    let Some(resp) = get_document(config, key)?.found() else {
        bail!("document not found: {}", key);
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&resp)?);
        return Ok(());
    }

    let doc = &resp.document;
    println!("--- Document ---");
    println!("id:       {}", doc.id);
    println!("type:     {}", doc.mime_type);
    println!("size:     {}", doc.size);
    println!("copies:   {}", doc.copies);
    println!("next:     {}", if doc.next.is_empty() { "(done)" } else { &doc.next });
    println!("offline:  {}", doc.offline);
    println!(
        "done:     {}",
        doc.modules_done.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    println!();

    println!("--- Paths ({}) ---", doc.paths_list.len());
    for path in &doc.paths_list {
        println!("{}", path);
    }
    println!();

    for (module, value) in &doc.modules {
        println!("--- {} ---", module);
        println!("{}", serde_json::to_string_pretty(value)?);
        println!();
    }

    for (module, text) in &resp.content {
        println!("--- {} content ({} chars) ---", module, text.chars().count());
        println!("{}", text);
        println!();
    }

    Ok(())
}
