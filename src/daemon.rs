//! Long-running service wiring.
//!
//! [`Runtime`] holds the shared handles every command needs: the
//! reconciliation engine, the search index, the broker and the dispatcher.
//! [`run_daemon`] runs three independent loops on top of it until
//! cancelled:
//!
//! ```text
//!   scheduler ──► sync pass (write guard) ──► index sync ──► live dispatch
//!   dispatcher loop (read guard per iteration)
//!   timeout sweeper
//! ```

use anyhow::Result;
use filedex_core::index::SearchIndex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerConnector, SqliteBroker, SqliteBrokerConnector};
use crate::config::Config;
use crate::dispatcher::{DispatchReport, Dispatcher};
use crate::index_sync::{IndexSyncReport, SearchIndexSync};
use crate::progress::{NoProgress, SyncProgressReporter};
use crate::queue::QueueKeys;
use crate::reconcile::{ReconciliationEngine, SyncReport};
use crate::scheduler::Scheduler;
use crate::sqlite_index::SqliteIndex;
use crate::worker::sweep_timeouts;

/// Result of one sync pass.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub sync: SyncReport,
    pub index: IndexSyncReport,
    pub dispatch: DispatchReport,
}

pub struct Runtime {
    config: Config,
    engine: ReconciliationEngine,
    index: Arc<dyn SearchIndex>,
    index_sync: SearchIndexSync,
    broker: Arc<dyn Broker>,
    dispatcher: Arc<Dispatcher>,
    keys: QueueKeys,
    sync_lock: Arc<RwLock<()>>,
}

impl Runtime {
    /// Open the SQLite search index and broker named by `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let index: Arc<dyn SearchIndex> =
            Arc::new(SqliteIndex::open(&config.search_db_path()).await?);
        let broker: Arc<dyn Broker> = Arc::new(SqliteBroker::open(&config.queue_db_path()).await?);
        let connector: Arc<dyn BrokerConnector> =
            Arc::new(SqliteBrokerConnector::new(config.queue_db_path()));
        Ok(Self::with_backends(config, index, broker, connector))
    }

    pub fn with_backends(
        config: &Config,
        index: Arc<dyn SearchIndex>,
        broker: Arc<dyn Broker>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Self {
        let engine = ReconciliationEngine::new(config);
        let sync_lock = Arc::new(RwLock::new(()));
        let dispatcher = Dispatcher::new(config, broker.clone(), connector, index.clone())
            .with_sync_lock(sync_lock.clone());
        let index_sync = SearchIndexSync::new(
            index.clone(),
            engine.store().clone(),
            config.search.batch_size,
            Duration::from_millis(config.search.settle_poll_ms),
        );
        Self {
            config: config.clone(),
            engine,
            index,
            index_sync,
            broker,
            dispatcher: Arc::new(dispatcher),
            keys: QueueKeys::new(config.queue.prefix.clone()),
            sync_lock,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    pub fn index(&self) -> Arc<dyn SearchIndex> {
        self.index.clone()
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }

    /// Reconcile, publish to the search index, then enqueue the live set.
    /// Returns `None` when another pass was already running.
    pub async fn sync_once(
        &self,
        cancel: &CancellationToken,
        progress: &dyn SyncProgressReporter,
    ) -> Result<Option<SyncSummary>> {
        let (sync, index) = {
            let _guard = self.sync_lock.write().await;
            let Some(outcome) = self.engine.try_run(cancel, progress).await? else {
                return Ok(None);
            };
            let index = self
                .index_sync
                .reconcile(&outcome.upserts, &outcome.live_by_hash())
                .await?;
            (outcome, index)
        };

        let dispatch = self.dispatcher.iterate(Some(&sync.live)).await?;
        info!(
            upserted = sync.report.documents_upserted,
            deleted = sync.report.documents_deleted,
            indexed = index.upserted,
            enqueued = dispatch.enqueued,
            "sync pass complete"
        );
        Ok(Some(SyncSummary {
            sync: sync.report,
            index,
            dispatch,
        }))
    }
}

/// Run the scheduler, dispatcher and timeout sweeper until `cancel` fires.
pub async fn run_daemon(runtime: Arc<Runtime>, interval: Duration, cancel: CancellationToken) -> Result<()> {
    info!(interval = %humantime::format_duration(interval), "daemon started");

    let scheduler = tokio::spawn({
        let runtime = runtime.clone();
        let cancel = cancel.clone();
        async move {
            Scheduler::new(interval)
                .run(cancel.clone(), || {
                    let runtime = runtime.clone();
                    let cancel = cancel.clone();
                    async move {
                        if let Err(e) = runtime.sync_once(&cancel, &NoProgress).await {
                            error!(error = %format!("{:#}", e), "sync pass failed");
                        }
                    }
                })
                .await
        }
    });

    let dispatcher = tokio::spawn({
        let dispatcher = runtime.dispatcher();
        let cancel = cancel.clone();
        async move { dispatcher.run(cancel).await }
    });

    let sweeper = tokio::spawn({
        let broker = runtime.broker();
        let keys = runtime.keys().clone();
        let every = Duration::from_millis(runtime.config().queue.poll_max_ms);
        let cancel = cancel.clone();
        async move { sweep_loop(broker, keys, every, cancel).await }
    });

    let (scheduled, dispatched, swept) = tokio::join!(scheduler, dispatcher, sweeper);
    scheduled?;
    dispatched??;
    swept?;
    info!("daemon stopped");
    Ok(())
}

async fn sweep_loop(
    broker: Arc<dyn Broker>,
    keys: QueueKeys,
    every: Duration,
    cancel: CancellationToken,
) {
    loop {
        if let Err(e) = sweep_timeouts(broker.as_ref(), &keys).await {
            warn!(error = %e, "timeout sweep failed");
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(every) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, SharedBroker};
    use crate::config::ModuleConfig;
    use filedex_core::index::memory::InMemoryIndex;
    use tempfile::TempDir;

    fn runtime(tmp: &TempDir) -> (Runtime, Arc<InMemoryBroker>) {
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let mut config = Config::minimal(&root);
        config.queue.prefix = "t".into();
        config.queue.poll_min_ms = 1;
        config.queue.poll_max_ms = 10;
        let m: ModuleConfig = toml::from_str("name = \"text\"\nkind = \"text\"").unwrap();
        config.modules.push(m);

        let broker = Arc::new(InMemoryBroker::new());
        let rt = Runtime::with_backends(
            &config,
            Arc::new(InMemoryIndex::new()),
            broker.clone(),
            Arc::new(SharedBroker(broker.clone())),
        );
        (rt, broker)
    }

    #[tokio::test]
    async fn sync_pass_indexes_and_enqueues() {
        let tmp = TempDir::new().unwrap();
        let (rt, broker) = runtime(&tmp);
        std::fs::write(rt.config().paths.index_root.join("a.txt"), "hello").unwrap();

        let summary = rt
            .sync_once(&CancellationToken::new(), &NoProgress)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.sync.documents_upserted, 1);
        assert_eq!(summary.index.upserted, 1);
        assert_eq!(summary.dispatch.enqueued, 1);
        assert_eq!(broker.len("t:text:check").await.unwrap(), 1);

        // A second pass changes nothing and enqueues nothing new.
        let again = rt
            .sync_once(&CancellationToken::new(), &NoProgress)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.sync.documents_upserted, 0);
        assert_eq!(again.dispatch.enqueued, 0);
    }

    #[tokio::test]
    async fn daemon_stops_on_cancel() {
        let tmp = TempDir::new().unwrap();
        let (rt, broker) = runtime(&tmp);
        std::fs::write(rt.config().paths.index_root.join("a.txt"), "hello").unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_daemon(
            Arc::new(rt),
            Duration::from_secs(3600),
            cancel.clone(),
        ));
        for _ in 0..100 {
            if broker.len("t:text:check").await.unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(broker.len("t:text:check").await.unwrap(), 1);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
