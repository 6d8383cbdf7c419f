//! Tracing subscriber setup shared by every `fdx` command.

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "filedex=info,fdx=info";

/// Logging options taken from the command line.
pub struct LogConfig {
    pub verbose: bool,
    /// Emit one JSON object per line instead of human-readable text.
    pub json: bool,
}

/// Initialize tracing with an stderr writer.
///
/// `RUST_LOG` takes precedence over the built-in filter; `--verbose` raises
/// the default to `debug`.
pub fn init_logging(config: LogConfig) -> Result<()> {
    let default_filter = if config.verbose {
        "filedex=debug,fdx=debug"
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filter)
            .boxed()
    };

    tracing_subscriber::registry().with(layer).try_init()?;
    Ok(())
}
