//! Interval trigger for reconciliation runs.
//!
//! The first tick fires immediately (sync on startup), then once per
//! interval. A tick that comes due while the previous one is still running
//! is dropped rather than queued, so runs never overlap or pile up.

use std::future::Future;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct Scheduler {
    interval: Duration,
}

impl Scheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Call `tick` on every interval until `cancel` fires. A tick in
    /// progress is allowed to finish.
    pub async fn run<F, Fut>(&self, cancel: CancellationToken, mut tick: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            debug!("scheduled sync tick");
            tick().await;
        }
    }
}
