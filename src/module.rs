//! Enrichment module contract.
//!
//! A module is one stage of the document pipeline. Workers drive it
//! through the queue protocol:
//!
//! ```text
//!   <module>:check ──► should_process(file, doc, workdir)
//!                         │ true                 │ false
//!                         ▼                      ▼
//!   <module>:run   ──► process(...)           done (skipped)
//!                         │
//!                         ▼
//!                      done (processed) ──► dispatcher merges output
//! ```
//!
//! Built-in modules (`text`, `scrape`) run in the worker process; `http`
//! modules forward both calls to a remote service. All three sit behind
//! the same [`Module`] trait, so the worker loop does not care which one
//! it drives.

use anyhow::{bail, Result};
use async_trait::async_trait;
use filedex_core::models::{Document, ModuleOutput};
use std::path::Path;
use std::sync::Arc;

use crate::config::ModuleConfig;
use crate::modules::http::HttpModule;
use crate::modules::scrape::{CommandScraper, ScrapeModule};
use crate::modules::text::TextModule;

// ═══════════════════════════════════════════════════════════════════════
// Module Trait
// ═══════════════════════════════════════════════════════════════════════

/// One pipeline stage.
///
/// # Lifecycle
///
/// 1. [`load`](Module::load) runs before the first run claim of an
///    activation batch (e.g. to load a model into GPU memory).
/// 2. [`should_process`](Module::should_process) and
///    [`process`](Module::process) run once per job.
/// 3. [`unload`](Module::unload) runs when the worker goes idle or hands
///    its rotation group slot to the next member.
///
/// `file` is the first path of the document that currently exists on
/// disk, or `None` when every copy is on an unmounted drive. `workdir` is
/// the module's private directory for this document.
#[async_trait]
pub trait Module: Send + Sync {
    /// The module name; also its namespace key in documents.
    fn name(&self) -> &str;

    async fn load(&self) -> Result<()> {
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        Ok(())
    }

    /// Whether [`process`](Module::process) has anything to do.
    async fn should_process(
        &self,
        file: Option<&Path>,
        doc: &Document,
        workdir: &Path,
    ) -> Result<bool>;

    /// Do the work. Only the module's own namespace of the returned
    /// document is merged back.
    async fn process(
        &self,
        file: Option<&Path>,
        doc: &Document,
        workdir: &Path,
    ) -> Result<ModuleOutput>;
}

// ═══════════════════════════════════════════════════════════════════════
// Construction
// ═══════════════════════════════════════════════════════════════════════

/// Instantiate the module described by `config`.
pub fn build_module(config: &ModuleConfig) -> Result<Arc<dyn Module>> {
    let module: Arc<dyn Module> = match config.kind.as_str() {
        "text" => Arc::new(TextModule::from_config(config)?),
        "scrape" => Arc::new(ScrapeModule::new(
            &config.name,
            Arc::new(CommandScraper::from_config(config)?),
        )),
        "http" => Arc::new(HttpModule::from_config(config)?),
        other => bail!(
            "Unknown module kind '{}' for '{}'. Must be text, scrape, or http.",
            other,
            config.name
        ),
    };
    Ok(module)
}
