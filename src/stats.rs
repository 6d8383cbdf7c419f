//! Status overview: what is stored, indexed, queued and archived.
//!
//! Used by `fdx status` to give confidence that syncs and workers are
//! making progress: stored document count, indexed count, per-module queue
//! depths and the state of every archive drive marker.

use anyhow::Result;
use filedex_core::index::SearchIndex;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::archive::{ArchiveAwareness, DriveStatus};
use crate::broker::{Broker, SqliteBroker};
use crate::config::Config;
use crate::queue::QueueKeys;
use crate::sqlite_index::SqliteIndex;
use crate::store::DocumentStore;

/// Upper bound when counting documents waiting on one module.
const WAITING_SCAN_LIMIT: usize = 1_000_000;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ModuleStatus {
    pub module: String,
    /// Indexed documents whose `next` is this module.
    pub waiting: usize,
    pub check: usize,
    pub check_processing: usize,
    pub run: usize,
    pub run_processing: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub documents_stored: usize,
    pub documents_indexed: usize,
    pub done_pending: usize,
    pub timeouts: usize,
    pub modules: Vec<ModuleStatus>,
    pub drives: BTreeMap<String, DriveStatus>,
}

pub async fn collect_status(
    config: &Config,
    index: &dyn SearchIndex,
    broker: &dyn Broker,
) -> Result<StatusReport> {
    let store = DocumentStore::new(config.metadata_root());
    let archive = ArchiveAwareness::new(
        &config.paths.index_root,
        config.paths.archive_root.as_deref(),
    );
    let keys = QueueKeys::new(config.queue.prefix.clone());

    let documents_stored = match std::fs::read_dir(store.by_id_root()) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .count(),
        Err(_) => 0,
    };

    let indexed = index.exists().await?;
    let documents_indexed = if indexed {
        index.all_ids().await?.len()
    } else {
        0
    };

    let mut modules = Vec::new();
    for module in config.pipeline().modules() {
        let waiting = if indexed {
            index.find_by_next(module, WAITING_SCAN_LIMIT).await?.len()
        } else {
            0
        };
        modules.push(ModuleStatus {
            module: module.clone(),
            waiting,
            check: broker.len(&keys.check(module)).await?,
            check_processing: broker.len(&keys.check_processing(module)).await?,
            run: broker.len(&keys.run(module)).await?,
            run_processing: broker.len(&keys.run_processing(module)).await?,
        });
    }

    Ok(StatusReport {
        documents_stored,
        documents_indexed,
        done_pending: broker.len(&keys.done()).await?,
        timeouts: broker.zcard(&keys.timeouts()).await?,
        modules,
        drives: archive.markers()?,
    })
}

/// Run the status command: open both databases and print a summary.
pub async fn run_status(config: &Config, json: bool) -> Result<()> {
    let index = SqliteIndex::open(&config.search_db_path()).await?;
    let broker = SqliteBroker::open(&config.queue_db_path()).await?;
    let report = collect_status(config, &index, &broker).await?;
    index.pool().close().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("filedex status");
    println!("==============");
    println!();
    println!("  Index root:  {}", config.paths.index_root.display());
    println!("  Metadata:    {}", config.metadata_root().display());
    println!(
        "  Search DB:   {} ({})",
        config.search_db_path().display(),
        format_bytes(file_size(&config.search_db_path()))
    );
    println!();
    println!("  Documents:   {}", report.documents_stored);
    println!("  Indexed:     {}", report.documents_indexed);
    println!("  Done queue:  {}", report.done_pending);
    println!("  In flight:   {}", report.timeouts);

    if !report.modules.is_empty() {
        println!();
        println!("  By module:");
        println!(
            "  {:<20} {:>8} {:>8} {:>8} {:>8} {:>8}",
            "MODULE", "WAITING", "CHECK", "CHK-PROC", "RUN", "RUN-PROC"
        );
        println!("  {}", "-".repeat(66));
        for m in &report.modules {
            println!(
                "  {:<20} {:>8} {:>8} {:>8} {:>8} {:>8}",
                m.module, m.waiting, m.check, m.check_processing, m.run, m.run_processing
            );
        }
    }

    if !report.drives.is_empty() {
        println!();
        println!("  Archive drives:");
        for (drive, status) in &report.drives {
            let label = match status {
                DriveStatus::Ready => "ready",
                DriveStatus::Pending => "pending",
            };
            println!("  {:<24} {}", drive, label);
        }
    }

    println!();
    Ok(())
}

fn file_size(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
