//! TOML configuration.
//!
//! The config file names the three roots (index, metadata, archive), the
//! worker pool sizes and schedule for reconciliation, the SQLite locations
//! of the search index and queue broker, and the ordered module pipeline.
//! A handful of `FILEDEX_*` environment variables override file values so
//! the same file can be reused across hosts.

use anyhow::{bail, Context, Result};
use filedex_core::migrations::RESERVED_KEYS;
use filedex_core::pipeline::Pipeline;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub paths: PathsConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    pub index_root: PathBuf,
    #[serde(default)]
    pub metadata_root: Option<PathBuf>,
    #[serde(default)]
    pub archive_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Concurrent hashing tasks; `0` means one per CPU.
    #[serde(default)]
    pub hash_workers: usize,
    /// Concurrent document reads/writes; `0` means two per CPU.
    #[serde(default)]
    pub file_workers: usize,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            hash_workers: 0,
            file_workers: 0,
            exclude_globs: Vec::new(),
        }
    }
}

fn default_schedule() -> String {
    "1h".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_settle_poll_ms")]
    pub settle_poll_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            batch_size: default_batch_size(),
            settle_poll_ms: default_settle_poll_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    500
}
fn default_settle_poll_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_poll_min_ms")]
    pub poll_min_ms: u64,
    #[serde(default = "default_poll_max_ms")]
    pub poll_max_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            prefix: default_prefix(),
            job_timeout_secs: default_job_timeout_secs(),
            poll_min_ms: default_poll_min_ms(),
            poll_max_ms: default_poll_max_ms(),
        }
    }
}

fn default_prefix() -> String {
    "filedex".to_string()
}
fn default_job_timeout_secs() -> u64 {
    300
}
fn default_poll_min_ms() -> u64 {
    50
}
fn default_poll_max_ms() -> u64 {
    2000
}

/// One pipeline stage.
#[derive(Debug, Deserialize, Clone)]
pub struct ModuleConfig {
    pub name: String,
    /// Implementation: `text`, `scrape`, or `http`.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Base URL for `http` modules.
    #[serde(default)]
    pub url: Option<String>,
    /// Rotation group shared with other workers (e.g. one GPU).
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_group_budget_secs")]
    pub group_budget_secs: u64,
    #[serde(default = "default_group_ttl_secs")]
    pub group_ttl_secs: u64,
    #[serde(default)]
    pub settings: toml::Table,
}

fn default_kind() -> String {
    "http".to_string()
}
fn default_group_budget_secs() -> u64 {
    60
}
fn default_group_ttl_secs() -> u64 {
    30
}

impl Config {
    pub fn metadata_root(&self) -> PathBuf {
        self.paths
            .metadata_root
            .clone()
            .unwrap_or_else(|| self.paths.index_root.join(".filedex"))
    }

    pub fn search_db_path(&self) -> PathBuf {
        self.search
            .db_path
            .clone()
            .unwrap_or_else(|| self.metadata_root().join("search.sqlite"))
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.queue
            .db_path
            .clone()
            .unwrap_or_else(|| self.metadata_root().join("queue.sqlite"))
    }

    pub fn hash_workers(&self) -> usize {
        match self.sync.hash_workers {
            0 => num_cpus::get().max(1),
            n => n,
        }
    }

    pub fn file_workers(&self) -> usize {
        match self.sync.file_workers {
            0 => (num_cpus::get() * 2).max(1),
            n => n,
        }
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.job_timeout_secs)
    }

    /// Parsed reconciliation cadence.
    pub fn schedule_interval(&self) -> Result<Duration> {
        parse_schedule(&self.sync.schedule)
    }

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.modules.iter().map(|m| m.name.clone()))
    }

    pub fn module(&self, name: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// A config rooted at `index_root` with every other setting defaulted.
    pub fn minimal(index_root: impl Into<PathBuf>) -> Self {
        Self {
            paths: PathsConfig {
                index_root: index_root.into(),
                metadata_root: None,
                archive_root: None,
            },
            sync: SyncConfig::default(),
            search: SearchConfig::default(),
            queue: QueueConfig::default(),
            modules: Vec::new(),
        }
    }
}

/// Parse a schedule expression such as `15m` or `1h 30m`.
pub fn parse_schedule(expr: &str) -> Result<Duration> {
    let interval = humantime::parse_duration(expr.trim())
        .with_context(|| format!("Invalid sync.schedule expression: '{}'", expr))?;
    if interval.is_zero() {
        bail!("sync.schedule must be greater than zero");
    }
    Ok(interval)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
    validate(&config)?;
    Ok(config)
}

fn apply_env_overrides<F>(config: &mut Config, var: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = var("FILEDEX_INDEX_ROOT") {
        config.paths.index_root = PathBuf::from(v);
    }
    if let Some(v) = var("FILEDEX_METADATA_ROOT") {
        config.paths.metadata_root = Some(PathBuf::from(v));
    }
    if let Some(v) = var("FILEDEX_ARCHIVE_ROOT") {
        config.paths.archive_root = Some(PathBuf::from(v));
    }
    if let Some(v) = var("FILEDEX_SCHEDULE") {
        config.sync.schedule = v;
    }
    if let Some(v) = var("FILEDEX_HASH_WORKERS") {
        config.sync.hash_workers = v
            .parse()
            .with_context(|| format!("FILEDEX_HASH_WORKERS is not a number: '{}'", v))?;
    }
    if let Some(v) = var("FILEDEX_FILE_WORKERS") {
        config.sync.file_workers = v
            .parse()
            .with_context(|| format!("FILEDEX_FILE_WORKERS is not a number: '{}'", v))?;
    }
    if let Some(v) = var("FILEDEX_JOB_TIMEOUT_SECS") {
        config.queue.job_timeout_secs = v
            .parse()
            .with_context(|| format!("FILEDEX_JOB_TIMEOUT_SECS is not a number: '{}'", v))?;
    }
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    if let Some(archive) = &config.paths.archive_root {
        if !archive.starts_with(&config.paths.index_root) {
            bail!(
                "paths.archive_root ({}) must be inside paths.index_root ({})",
                archive.display(),
                config.paths.index_root.display()
            );
        }
        if archive == &config.paths.index_root {
            bail!("paths.archive_root must be a subdirectory of paths.index_root");
        }
    }

    parse_schedule(&config.sync.schedule)?;

    if config.queue.job_timeout_secs == 0 {
        bail!("queue.job_timeout_secs must be > 0");
    }
    if config.search.batch_size == 0 {
        bail!("search.batch_size must be > 0");
    }
    if config.queue.poll_min_ms == 0 || config.queue.poll_max_ms < config.queue.poll_min_ms {
        bail!("queue.poll_min_ms must be > 0 and <= queue.poll_max_ms");
    }

    let mut seen = HashSet::new();
    for module in &config.modules {
        if module.name.trim().is_empty() {
            bail!("modules[].name must not be empty");
        }
        if module.name.contains(':') || module.name.contains('/') {
            bail!("module name '{}' must not contain ':' or '/'", module.name);
        }
        if RESERVED_KEYS.contains(&module.name.as_str()) {
            bail!(
                "module name '{}' is a reserved document field; pick another name",
                module.name
            );
        }
        if !seen.insert(module.name.as_str()) {
            bail!("module '{}' is configured twice", module.name);
        }
        match module.kind.as_str() {
            "text" | "scrape" => {}
            "http" => {
                if module.url.is_none() {
                    bail!("module '{}' has kind 'http' but no url", module.name);
                }
            }
            other => bail!(
                "Unknown module kind '{}' for '{}'. Must be text, scrape, or http.",
                other,
                module.name
            ),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Config {
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn defaults_fill_optional_sections() {
        let config = parse(
            r#"
            [paths]
            index_root = "/srv/files"
            "#,
        );
        assert_eq!(config.metadata_root(), PathBuf::from("/srv/files/.filedex"));
        assert_eq!(
            config.queue_db_path(),
            PathBuf::from("/srv/files/.filedex/queue.sqlite")
        );
        assert_eq!(config.queue.job_timeout_secs, 300);
        assert!(config.hash_workers() >= 1);
        assert_eq!(config.schedule_interval().unwrap(), Duration::from_secs(3600));
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn modules_keep_their_order() {
        let config = parse(
            r#"
            [paths]
            index_root = "/srv"

            [[modules]]
            name = "scrape"
            kind = "scrape"

            [[modules]]
            name = "text"
            kind = "text"
            [modules.settings]
            max_tokens = 200
            "#,
        );
        assert_eq!(config.pipeline().modules(), ["scrape", "text"]);
        assert_eq!(
            config.module("text").unwrap().settings["max_tokens"].as_integer(),
            Some(200)
        );
    }

    #[test]
    fn archive_root_outside_index_root_is_rejected() {
        let config = parse(
            r#"
            [paths]
            index_root = "/srv/files"
            archive_root = "/mnt/archive"
            "#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn duplicate_modules_are_rejected() {
        let config = parse(
            r#"
            [paths]
            index_root = "/srv"
            [[modules]]
            name = "text"
            kind = "text"
            [[modules]]
            name = "text"
            kind = "text"
            "#,
        );
        assert!(validate(&config).is_err());
    }

    #[test]
    fn module_named_like_a_document_field_is_rejected() {
        for name in ["size", "next", "paths", "type", "modules_done"] {
            let config = parse(&format!(
                "[paths]\nindex_root = \"/srv\"\n[[modules]]\nname = \"{}\"\nkind = \"text\"\n",
                name
            ));
            let err = validate(&config).unwrap_err().to_string();
            assert!(err.contains("reserved"), "{}: {}", name, err);
        }
    }

    #[test]
    fn malformed_schedule_is_an_error() {
        assert!(parse_schedule("every tuesday").is_err());
        assert!(parse_schedule("0s").is_err());
        assert_eq!(parse_schedule("15m").unwrap(), Duration::from_secs(900));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let mut config = parse(
            r#"
            [paths]
            index_root = "/srv"
            "#,
        );
        apply_env_overrides(&mut config, |key| match key {
            "FILEDEX_INDEX_ROOT" => Some("/data".to_string()),
            "FILEDEX_HASH_WORKERS" => Some("3".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.paths.index_root, PathBuf::from("/data"));
        assert_eq!(config.hash_workers(), 3);

        let bad = apply_env_overrides(&mut config, |key| {
            (key == "FILEDEX_FILE_WORKERS").then(|| "many".to_string())
        });
        assert!(bad.is_err());
    }
}
