//! Worker side of the queue protocol.
//!
//! ```text
//!  check ──pop_move──► check:processing ──should_process──┬─► run
//!                                                         └─► done (skipped)
//!  run   ──blocking_pop_move──► run:processing ──process──► done
//! ```
//!
//! Every claim records a deadline in the shared timeouts set before any
//! module code runs. Acknowledgement pushes the result first and only then
//! clears the deadline and the processing entry, so a crash at any point
//! leaves the job where [`sweep_timeouts`] can find it. Delivery is
//! at-least-once.

use anyhow::Result;
use filedex_core::migrations::RESERVED_KEYS;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{now_secs, Broker};
use crate::config::Config;
use crate::group::ResourceGroup;
use crate::module::Module;
use crate::queue::{DoneRecord, Job, Outcome, QueueKeys, TimeoutEntry};
use crate::store::DocumentStore;

/// How long a run claim waits for a job before giving up.
const CLAIM_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("fatal: worker identity mismatch: module '{0}' is not in the configured pipeline")]
    IdentityMismatch(String),
    #[error("module name '{0}' is a reserved document field")]
    ReservedName(String),
}

/// Move expired jobs back to the head of the queue they were claimed from.
///
/// Returns the number of jobs requeued. A deadline whose job is no longer
/// in its processing list was acknowledged in the meantime and is dropped.
pub async fn sweep_timeouts(broker: &dyn Broker, keys: &QueueKeys) -> Result<usize> {
    let timeouts = keys.timeouts();
    let now = now_secs();
    let mut requeued = 0;

    while let Some((member, deadline)) = broker.zpopmin(&timeouts).await? {
        if deadline > now {
            broker.zadd(&timeouts, &member, deadline).await?;
            break;
        }
        let entry = match TimeoutEntry::decode(&member) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "dropping malformed timeout entry");
                continue;
            }
        };
        if broker.remove(&entry.processing, &entry.job).await? > 0 {
            broker.push_front(&entry.origin, &entry.job).await?;
            requeued += 1;
        }
    }

    if requeued > 0 {
        info!(requeued, "requeued timed-out jobs");
    }
    Ok(requeued)
}

struct Rotation {
    group: ResourceGroup,
    budget: Duration,
    active_since: Option<Instant>,
}

pub struct Worker {
    module: Arc<dyn Module>,
    broker: Arc<dyn Broker>,
    keys: QueueKeys,
    store: DocumentStore,
    index_root: PathBuf,
    worker_id: String,
    job_timeout: Duration,
    poll_min: Duration,
    poll_max: Duration,
    rotation: Option<Rotation>,
    loaded: bool,
}

impl Worker {
    /// Fails with [`WorkerError::IdentityMismatch`] when `module` is not a
    /// configured pipeline stage, and with [`WorkerError::ReservedName`] when
    /// its name would shadow a document field.
    pub fn new(
        config: &Config,
        module: Arc<dyn Module>,
        broker: Arc<dyn Broker>,
        worker_id: &str,
    ) -> Result<Self> {
        let name = module.name().to_string();
        if RESERVED_KEYS.contains(&name.as_str()) {
            return Err(WorkerError::ReservedName(name).into());
        }
        let Some(module_config) = config.module(&name) else {
            return Err(WorkerError::IdentityMismatch(name).into());
        };

        let keys = QueueKeys::new(config.queue.prefix.clone());
        let rotation = module_config.group.as_deref().map(|group| Rotation {
            group: ResourceGroup::new(
                broker.clone(),
                keys.clone(),
                group,
                worker_id,
                Duration::from_secs(module_config.group_ttl_secs),
            ),
            budget: Duration::from_secs(module_config.group_budget_secs),
            active_since: None,
        });

        Ok(Self {
            module,
            broker,
            keys,
            store: DocumentStore::new(config.metadata_root()),
            index_root: config.paths.index_root.clone(),
            worker_id: worker_id.to_string(),
            job_timeout: config.job_timeout(),
            poll_min: Duration::from_millis(config.queue.poll_min_ms),
            poll_max: Duration::from_millis(config.queue.poll_max_ms),
            rotation,
            loaded: false,
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and handle one check job. Returns whether a job was handled.
    pub async fn claim_check(&mut self) -> Result<bool> {
        let name = self.module.name().to_string();
        let origin = self.keys.check(&name);
        let processing = self.keys.check_processing(&name);

        let Some(raw) = self.broker.pop_move(&origin, &processing).await? else {
            return Ok(false);
        };
        let Some(job) = self.accept(&origin, &processing, &raw).await? else {
            return Ok(false);
        };
        let deadline = self.record_deadline(&origin, &processing, &raw).await?;

        let (file, workdir) = self.locate(&job)?;
        let decision = self
            .module
            .should_process(file.as_deref(), &job.document, &workdir)
            .await;

        match decision {
            Ok(true) => {
                self.broker.push_back(&self.keys.run(&name), &raw).await?;
            }
            Ok(false) => {
                self.push_done(DoneRecord::new(&job, Outcome::Skipped)).await?;
            }
            Err(e) => {
                warn!(module = %name, document = %job.document.id, error = %e, "should_process failed");
                self.push_done(DoneRecord::new(
                    &job,
                    Outcome::Failed {
                        error: format!("{:#}", e),
                    },
                ))
                .await?;
            }
        }
        self.acknowledge(&processing, &raw, &deadline).await?;
        Ok(true)
    }

    /// Claim and handle one run job, subject to group rotation. Returns
    /// whether a job was handled.
    pub async fn claim_run(&mut self) -> Result<bool> {
        if !self.holds_resource().await? {
            return Ok(false);
        }

        let name = self.module.name().to_string();
        let origin = self.keys.run(&name);
        let processing = self.keys.run_processing(&name);

        let Some(raw) = self
            .broker
            .blocking_pop_move(&origin, &processing, CLAIM_TIMEOUT)
            .await?
        else {
            self.go_idle().await;
            return Ok(false);
        };
        let Some(job) = self.accept(&origin, &processing, &raw).await? else {
            return Ok(false);
        };
        let deadline = self.record_deadline(&origin, &processing, &raw).await?;

        if !self.loaded {
            self.module.load().await?;
            self.loaded = true;
            debug!(module = %name, "module loaded");
        }
        if let Some(rotation) = &mut self.rotation {
            rotation.active_since.get_or_insert_with(Instant::now);
        }

        let (file, workdir) = self.locate(&job)?;
        let outcome = match self
            .module
            .process(file.as_deref(), &job.document, &workdir)
            .await
        {
            Ok(output) => Outcome::Processed { output },
            Err(e) => {
                warn!(module = %name, document = %job.document.id, error = %e, "process failed");
                Outcome::Failed {
                    error: format!("{:#}", e),
                }
            }
        };

        self.push_done(DoneRecord::new(&job, outcome)).await?;
        self.acknowledge(&processing, &raw, &deadline).await?;
        Ok(true)
    }

    /// Claim loop until `cancel` fires. Sleeps with exponential backoff
    /// between `poll_min` and `poll_max` while both queues are empty.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<()> {
        info!(module = %self.module.name(), worker = %self.worker_id, "worker started");
        let mut backoff = self.poll_min;

        while !cancel.is_cancelled() {
            let worked = match self.step().await {
                Ok(worked) => worked,
                Err(e) => {
                    error!(module = %self.module.name(), error = %e, "worker iteration failed");
                    false
                }
            };
            if worked {
                backoff = self.poll_min;
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(self.poll_max);
        }

        self.go_idle().await;
        if let Some(rotation) = &self.rotation {
            rotation.group.leave().await?;
        }
        info!(module = %self.module.name(), worker = %self.worker_id, "worker stopped");
        Ok(())
    }

    async fn step(&mut self) -> Result<bool> {
        let checked = self.claim_check().await?;
        let ran = self.claim_run().await?;
        Ok(checked || ran)
    }

    /// Decode a claimed job. Jobs addressed to another worker go back to the
    /// tail of their queue; undecodable payloads are dropped.
    async fn accept(&self, origin: &str, processing: &str, raw: &str) -> Result<Option<Job>> {
        let job = match Job::decode(raw) {
            Ok(job) => job,
            Err(e) => {
                warn!(queue = %origin, error = %e, "dropping malformed job");
                self.broker.remove(processing, raw).await?;
                return Ok(None);
            }
        };
        if let Some(owner) = &job.worker_id {
            if owner != &self.worker_id {
                self.broker.push_back(origin, raw).await?;
                self.broker.remove(processing, raw).await?;
                return Ok(None);
            }
        }
        Ok(Some(job))
    }

    async fn record_deadline(&self, origin: &str, processing: &str, raw: &str) -> Result<String> {
        let entry = TimeoutEntry {
            origin: origin.to_string(),
            processing: processing.to_string(),
            job: raw.to_string(),
        }
        .encode()?;
        self.broker
            .zadd(
                &self.keys.timeouts(),
                &entry,
                now_secs() + self.job_timeout.as_secs_f64(),
            )
            .await?;
        Ok(entry)
    }

    async fn push_done(&self, record: DoneRecord) -> Result<()> {
        self.broker
            .push_back(&self.keys.done(), &record.encode()?)
            .await
    }

    async fn acknowledge(&self, processing: &str, raw: &str, deadline: &str) -> Result<()> {
        self.broker.zrem(&self.keys.timeouts(), deadline).await?;
        self.broker.remove(processing, raw).await?;
        Ok(())
    }

    /// First path of the document present under the index root, and the
    /// module's working directory for it.
    fn locate(&self, job: &Job) -> Result<(Option<PathBuf>, PathBuf)> {
        let file = first_existing(&self.index_root, &job.document.paths_list);
        let workdir = self.store.workdir(&job.document.id, &job.module)?;
        Ok((file, workdir))
    }

    /// Group gating: heartbeat, check headship, rotate after the budget.
    async fn holds_resource(&mut self) -> Result<bool> {
        let Some(rotation) = &mut self.rotation else {
            return Ok(true);
        };
        rotation.group.heartbeat().await?;
        let is_head = rotation.group.is_head().await?;
        let over_budget = is_head
            && rotation
                .active_since
                .is_some_and(|since| since.elapsed() >= rotation.budget);
        if is_head && !over_budget {
            return Ok(true);
        }

        rotation.active_since = None;
        self.go_idle().await;
        if over_budget {
            if let Some(rotation) = &self.rotation {
                info!(group = %rotation.group.name(), worker = %self.worker_id, "group budget used, rotating");
                rotation.group.rotate().await?;
            }
        }
        Ok(false)
    }

    /// End the current activation batch.
    async fn go_idle(&mut self) {
        if !self.loaded {
            return;
        }
        self.loaded = false;
        if let Err(e) = self.module.unload().await {
            warn!(module = %self.module.name(), error = %e, "unload failed");
        } else {
            debug!(module = %self.module.name(), "module unloaded");
        }
    }
}

fn first_existing(index_root: &Path, paths: &[String]) -> Option<PathBuf> {
    paths
        .iter()
        .map(|p| index_root.join(p))
        .find(|p| p.is_file())
}
