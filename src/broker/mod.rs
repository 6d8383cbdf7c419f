//! Queue broker abstraction.
//!
//! The dispatcher, workers and the timeout sweeper coordinate only through
//! a [`Broker`]: named lists (FIFO queues), named sorted sets (deadlines)
//! and expiring keys (group heartbeats). Every operation is atomic with
//! respect to other callers of the same broker, including other processes
//! sharing a SQLite broker file.
//!
//! | Method | Semantics |
//! |--------|-----------|
//! | [`push_back`](Broker::push_back) / [`push_front`](Broker::push_front) | append / prepend to a list |
//! | [`pop_front`](Broker::pop_front) | remove and return the list head |
//! | [`pop_move`](Broker::pop_move) | pop the head of one list and append it to another, atomically |
//! | [`blocking_pop_move`](Broker::blocking_pop_move) | as above, waiting up to a timeout for an item |
//! | [`remove`](Broker::remove) | remove every occurrence of a value |
//! | [`zadd`](Broker::zadd) / [`zpopmin`](Broker::zpopmin) | sorted set by score |
//! | [`set_ex`](Broker::set_ex) / [`get`](Broker::get) | key with a time-to-live |

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use memory::InMemoryBroker;
pub use sqlite::{SqliteBroker, SqliteBrokerConnector};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn push_back(&self, key: &str, value: &str) -> Result<()>;

    async fn push_front(&self, key: &str, value: &str) -> Result<()>;

    async fn pop_front(&self, key: &str) -> Result<Option<String>>;

    /// Pop the head of `src` and append it to `dst` in one step.
    async fn pop_move(&self, src: &str, dst: &str) -> Result<Option<String>>;

    /// Like [`pop_move`](Broker::pop_move), waiting up to `timeout` for `src`
    /// to become non-empty.
    async fn blocking_pop_move(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>>;

    /// Remove every occurrence of `value` from `key`; returns how many.
    async fn remove(&self, key: &str, value: &str) -> Result<usize>;

    /// Every element of `key`, head first.
    async fn range(&self, key: &str) -> Result<Vec<String>>;

    async fn len(&self, key: &str) -> Result<usize>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Remove and return the member with the lowest score.
    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    async fn zcard(&self, key: &str) -> Result<usize>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Value of `key` unless it is missing or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

/// Produces broker handles; used to reconnect after a failure.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>>;
}

/// A connector that always hands out the same broker.
pub struct SharedBroker(pub Arc<dyn Broker>);

#[async_trait]
impl BrokerConnector for SharedBroker {
    async fn connect(&self) -> Result<Arc<dyn Broker>> {
        self.0.ping().await?;
        Ok(self.0.clone())
    }
}

/// Seconds since the Unix epoch; used for deadlines and expiries.
pub fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
