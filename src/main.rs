//! # filedex CLI (`fdx`)
//!
//! The `fdx` binary drives every part of filedex: one-shot syncs, the
//! long-running daemon, module workers and read-only inspection.
//!
//! ## Usage
//!
//! ```bash
//! fdx --config ./config/filedex.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fdx init` | Create metadata directories and SQLite schemas |
//! | `fdx sync` | One reconciliation run, index sync and dispatch pass |
//! | `fdx daemon` | Scheduler, dispatcher and timeout sweeper until Ctrl-C |
//! | `fdx worker <module>` | Claim and process jobs for one module |
//! | `fdx get <hash-or-path>` | Print a stored document |
//! | `fdx search "<query>"` | Search the index |
//! | `fdx status` | Document counts, queue depths, drive markers |
//!
//! ## Exit codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Any error (bad config, malformed schedule, I/O failure) |
//! | 2 | Worker identity mismatch: the module is not in the pipeline |

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

use filedex::broker::SqliteBroker;
use filedex::config::{self, Config};
use filedex::daemon::{run_daemon, Runtime, SyncSummary};
use filedex::logging::{init_logging, LogConfig};
use filedex::module::build_module;
use filedex::progress::{format_number, ProgressMode};
use filedex::search::SearchOptions;
use filedex::worker::{Worker, WorkerError};
use filedex::{get, migrate, search, stats};

/// filedex: content-addressed file indexing with a module pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/filedex.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "fdx",
    about = "filedex: content-addressed file indexing with a module pipeline",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/filedex.toml")]
    config: PathBuf,

    /// Debug-level logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the metadata directories and database schemas.
    ///
    /// Idempotent: running it again changes nothing.
    Init,

    /// Reconcile the index root once.
    ///
    /// Hashes new and changed files, updates documents and path links,
    /// publishes to the search index and enqueues pending module work.
    Sync {
        /// Progress output: `human`, `json` or `off`. Defaults to human when
        /// stderr is a terminal.
        #[arg(long, value_parser = ["human", "json", "off"])]
        progress: Option<String>,

        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Run the scheduler, dispatcher and timeout sweeper until interrupted.
    Daemon,

    /// Process jobs for one module until interrupted.
    Worker {
        /// Module name, as configured under `[[modules]]`.
        module: String,

        /// Stable worker identity; defaults to a random one.
        #[arg(long)]
        worker_id: Option<String>,
    },

    /// Print a document by content hash or relative path.
    Get {
        key: String,

        #[arg(long)]
        json: bool,
    },

    /// Search indexed documents. An empty query lists documents.
    Search {
        #[arg(default_value = "")]
        query: String,

        /// Only documents waiting on this module.
        #[arg(long)]
        next: Option<String>,

        /// Only documents whose MIME type starts with this prefix.
        #[arg(long)]
        mime: Option<String>,

        /// Include chunk documents.
        #[arg(long)]
        chunks: bool,

        #[arg(long, default_value_t = 20)]
        limit: usize,

        #[arg(long)]
        json: bool,
    },

    /// Show document counts, queue depths and archive drive markers.
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(LogConfig {
        verbose: cli.verbose,
        json: cli.log_json,
    }) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if let Some(WorkerError::IdentityMismatch(module)) = e.downcast_ref::<WorkerError>() {
                error!(module = %module, "fatal: worker identity mismatch");
                return ExitCode::from(2);
            }
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Initialized {}", cfg.metadata_root().display());
        }
        Commands::Sync { progress, json } => {
            let mode = progress
                .as_deref()
                .and_then(ProgressMode::parse)
                .unwrap_or_else(ProgressMode::default_for_tty);
            let runtime = Runtime::open(&cfg).await?;
            let cancel = cancel_on_ctrl_c();
            let reporter = mode.reporter();
            match runtime.sync_once(&cancel, reporter.as_ref()).await? {
                Some(summary) if json => println!("{}", serde_json::to_string_pretty(&summary)?),
                Some(summary) => print_summary(&summary),
                None => println!("A sync is already running."),
            }
        }
        Commands::Daemon => {
            let interval = cfg.schedule_interval()?;
            let runtime = Arc::new(Runtime::open(&cfg).await?);
            run_daemon(runtime, interval, cancel_on_ctrl_c()).await?;
        }
        Commands::Worker { module, worker_id } => run_worker(&cfg, &module, worker_id).await?,
        Commands::Get { key, json } => get::run_get(&cfg, &key, json)?,
        Commands::Search {
            query,
            next,
            mime,
            chunks,
            limit,
            json,
        } => {
            let options = SearchOptions {
                next,
                mime_prefix: mime,
                chunks,
                limit,
            };
            search::run_search(&cfg, &query, &options, json).await?;
        }
        Commands::Status { json } => stats::run_status(&cfg, json).await?,
    }

    Ok(())
}

async fn run_worker(cfg: &Config, module: &str, worker_id: Option<String>) -> anyhow::Result<()> {
    let Some(module_config) = cfg.module(module) else {
        return Err(WorkerError::IdentityMismatch(module.to_string()).into());
    };
    let module = build_module(module_config)?;
    let broker = Arc::new(SqliteBroker::open(&cfg.queue_db_path()).await?);
    let worker_id = worker_id.unwrap_or_else(|| {
        format!("{}-{}", module.name(), &Uuid::new_v4().simple().to_string()[..8])
    });

    let mut worker = Worker::new(cfg, module, broker, &worker_id)?;
    worker.run(cancel_on_ctrl_c()).await
}

/// A token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            trigger.cancel();
        }
    });
    token
}

fn print_summary(summary: &SyncSummary) {
    let s = &summary.sync;
    println!("sync complete");
    println!("  files scanned:      {}", format_number(s.files_scanned as u64));
    println!("  files skipped:      {}", format_number(s.files_skipped as u64));
    println!("  hashes reused:      {}", format_number(s.hashes_reused as u64));
    println!("  documents live:     {}", format_number(s.documents_live as u64));
    println!("  documents upserted: {}", format_number(s.documents_upserted as u64));
    println!("  documents deleted:  {}", format_number(s.documents_deleted as u64));
    println!("  links removed:      {}", format_number(s.links_removed as u64));
    if s.drives_ready + s.drives_pending > 0 {
        println!("  drives ready:       {}", s.drives_ready);
        println!("  drives pending:     {}", s.drives_pending);
    }
    println!("  indexed:            {}", format_number(summary.index.upserted as u64));
    println!("  removed from index: {}", format_number(summary.index.deleted as u64));
    println!("  jobs enqueued:      {}", format_number(summary.dispatch.enqueued as u64));
}
