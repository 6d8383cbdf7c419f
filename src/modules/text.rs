//! Built-in `text` module: splits text files into searchable chunks.
//!
//! The full text becomes the document's searchable content; each
//! paragraph-aligned chunk becomes a chunk document. Chunk ids are
//! deterministic, so reprocessing overwrites the previous chunks and only
//! the surplus from a longer earlier version needs deleting.

use anyhow::{Context, Result};
use async_trait::async_trait;
use filedex_core::chunk::{chunk_id, chunk_text};
use filedex_core::models::{Document, ModuleOutput};
use serde_json::{json, Value};
use std::path::Path;

use crate::config::ModuleConfig;
use crate::module::Module;

const DEFAULT_MAX_TOKENS: usize = 700;
const DEFAULT_MAX_BYTES: u64 = 16 * 1024 * 1024;

/// MIME types outside `text/*` that are still plain text.
const TEXT_LIKE: &[&str] = &[
    "application/json",
    "application/xml",
    "application/javascript",
    "application/toml",
    "application/x-sh",
    "application/x-yaml",
];

pub struct TextModule {
    name: String,
    max_tokens: usize,
    max_bytes: u64,
}

impl TextModule {
    pub fn new(name: &str, max_tokens: usize, max_bytes: u64) -> Self {
        Self {
            name: name.to_string(),
            max_tokens,
            max_bytes,
        }
    }

    pub fn from_config(config: &ModuleConfig) -> Result<Self> {
        let max_tokens = setting_u64(config, "max_tokens")?
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_TOKENS);
        let max_bytes = setting_u64(config, "max_bytes")?.unwrap_or(DEFAULT_MAX_BYTES);
        Ok(Self::new(&config.name, max_tokens.max(1), max_bytes))
    }
}

fn setting_u64(config: &ModuleConfig, key: &str) -> Result<Option<u64>> {
    match config.settings.get(key) {
        None => Ok(None),
        Some(value) => {
            let n = value
                .as_integer()
                .filter(|n| *n >= 0)
                .with_context(|| {
                    format!("modules.{}.settings.{} must be a non-negative integer", config.name, key)
                })?;
            Ok(Some(n as u64))
        }
    }
}

fn is_text(mime: &str) -> bool {
    mime.starts_with("text/") || TEXT_LIKE.contains(&mime)
}

#[async_trait]
impl Module for TextModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn should_process(
        &self,
        file: Option<&Path>,
        doc: &Document,
        _workdir: &Path,
    ) -> Result<bool> {
        Ok(file.is_some() && doc.size > 0 && doc.size <= self.max_bytes && is_text(&doc.mime_type))
    }

    async fn process(
        &self,
        file: Option<&Path>,
        doc: &Document,
        _workdir: &Path,
    ) -> Result<ModuleOutput> {
        let path = file.context("text module needs a file on disk")?;
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let chunks = chunk_text(&doc.id, &self.name, &text, self.max_tokens);
        let previous = doc
            .namespace(&self.name)
            .and_then(|ns| ns.get("chunks"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        let stale: Vec<String> = (chunks.len() as i64..previous)
            .map(|i| chunk_id(&doc.id, &self.name, i))
            .collect();

        let mut updated = doc.clone();
        let ns = updated.namespace_mut(&self.name);
        ns.insert("chunks".into(), json!(chunks.len()));
        ns.insert("chars".into(), json!(text.chars().count()));

        Ok(ModuleOutput {
            document: Some(updated),
            content: Some(text),
            chunks: Some(chunks),
            delete_chunk_ids: (!stale.is_empty()).then_some(stale),
        })
    }
}
