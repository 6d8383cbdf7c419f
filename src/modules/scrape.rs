//! Built-in `scrape` module: metadata fields from an external extractor.
//!
//! Field extraction itself lives behind the [`Scraper`] trait. The stock
//! [`CommandScraper`] runs a configured command with the file path as its
//! last argument and expects a JSON object on stdout (a one-element array
//! of objects, as `exiftool -json` prints, is accepted too).

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use filedex_core::models::{Document, ModuleOutput};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ModuleConfig;
use crate::module::Module;

const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Extracts a flat field map from one file.
#[async_trait]
pub trait Scraper: Send + Sync {
    async fn scrape(&self, path: &Path, mime: &str) -> Result<Map<String, Value>>;
}

pub struct CommandScraper {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandScraper {
    pub fn new(program: &str, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.to_string(),
            args,
            timeout,
        }
    }

    /// Reads `settings.command` (program and leading arguments) and
    /// `settings.timeout_secs`.
    pub fn from_config(config: &ModuleConfig) -> Result<Self> {
        let command: Vec<String> = config
            .settings
            .get("command")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        let Some((program, args)) = command.split_first() else {
            bail!(
                "module '{}' has kind 'scrape' but no settings.command",
                config.name
            );
        };
        let timeout = config
            .settings
            .get("timeout_secs")
            .and_then(|v| v.as_integer())
            .filter(|n| *n > 0)
            .map(|n| n as u64)
            .unwrap_or(DEFAULT_TIMEOUT_SECS);
        Ok(Self::new(program, args.to_vec(), Duration::from_secs(timeout)))
    }
}

#[async_trait]
impl Scraper for CommandScraper {
    async fn scrape(&self, path: &Path, _mime: &str) -> Result<Map<String, Value>> {
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(&self.program)
                .args(&self.args)
                .arg(path)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .with_context(|| format!("{} timed out after {:?}", self.program, self.timeout))?
        .with_context(|| format!("Failed to run {}", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} failed: {}", self.program, stderr.trim());
        }

        let value: Value = serde_json::from_slice(&output.stdout)
            .with_context(|| format!("{} did not print JSON", self.program))?;
        match value {
            Value::Object(map) => Ok(map),
            Value::Array(mut items) if items.len() == 1 && items[0].is_object() => {
                match items.remove(0) {
                    Value::Object(map) => Ok(map),
                    _ => unreachable!("checked is_object above"),
                }
            }
            _ => bail!("{} printed JSON that is not an object", self.program),
        }
    }
}

pub struct ScrapeModule {
    name: String,
    scraper: Arc<dyn Scraper>,
}

impl ScrapeModule {
    pub fn new(name: &str, scraper: Arc<dyn Scraper>) -> Self {
        Self {
            name: name.to_string(),
            scraper,
        }
    }
}

#[async_trait]
impl Module for ScrapeModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn should_process(
        &self,
        file: Option<&Path>,
        _doc: &Document,
        _workdir: &Path,
    ) -> Result<bool> {
        Ok(file.is_some())
    }

    async fn process(
        &self,
        file: Option<&Path>,
        doc: &Document,
        _workdir: &Path,
    ) -> Result<ModuleOutput> {
        let path = file.context("scrape module needs a file on disk")?;
        let fields = self.scraper.scrape(path, &doc.mime_type).await?;

        let mut updated = doc.clone();
        *updated.namespace_mut(&self.name) = fields;

        Ok(ModuleOutput {
            document: Some(updated),
            ..Default::default()
        })
    }
}
