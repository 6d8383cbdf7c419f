//! SQLite-backed [`Broker`] shared by every process using the same file.
//!
//! Lists are rows ordered by an integer position (head = lowest). Each
//! mutating operation is one statement or one transaction, so concurrent
//! processes see atomic pushes, pops and moves. Blocking pops poll.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{now_secs, Broker, BrokerConnector};
use crate::{db, migrate};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct SqliteBroker {
    pool: SqlitePool,
}

impl SqliteBroker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the broker database at `path`, creating its tables.
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::migrate_broker(&pool).await?;
        Ok(Self::new(pool))
    }
}

/// Reconnects by reopening the broker database file.
pub struct SqliteBrokerConnector {
    path: PathBuf,
}

impl SqliteBrokerConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl BrokerConnector for SqliteBrokerConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>> {
        debug!(path = %self.path.display(), "connecting to broker");
        Ok(Arc::new(SqliteBroker::open(&self.path).await?))
    }
}

#[async_trait]
impl Broker for SqliteBroker {
    async fn push_back(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO broker_lists (key, pos, value) \
             SELECT ?, COALESCE(MAX(pos), 0) + 1, ? FROM broker_lists WHERE key = ?",
        )
        .bind(key)
        .bind(value)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn push_front(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO broker_lists (key, pos, value) \
             SELECT ?, COALESCE(MIN(pos), 0) - 1, ? FROM broker_lists WHERE key = ?",
        )
        .bind(key)
        .bind(value)
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            "DELETE FROM broker_lists WHERE rowid = \
             (SELECT rowid FROM broker_lists WHERE key = ? ORDER BY pos LIMIT 1) \
             RETURNING value",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn pop_move(&self, src: &str, dst: &str) -> Result<Option<String>> {
        let mut tx = self.pool.begin().await?;

        let value: Option<String> = sqlx::query_scalar(
            "DELETE FROM broker_lists WHERE rowid = \
             (SELECT rowid FROM broker_lists WHERE key = ? ORDER BY pos LIMIT 1) \
             RETURNING value",
        )
        .bind(src)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(v) = &value {
            sqlx::query(
                "INSERT INTO broker_lists (key, pos, value) \
                 SELECT ?, COALESCE(MAX(pos), 0) + 1, ? FROM broker_lists WHERE key = ?",
            )
            .bind(dst)
            .bind(v)
            .bind(dst)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(value)
    }

    async fn blocking_pop_move(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(value) = self.pop_move(src, dst).await? {
                return Ok(Some(value));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn remove(&self, key: &str, value: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM broker_lists WHERE key = ? AND value = ?")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        let values: Vec<String> =
            sqlx::query_scalar("SELECT value FROM broker_lists WHERE key = ? ORDER BY pos")
                .bind(key)
                .fetch_all(&self.pool)
                .await?;
        Ok(values)
    }

    async fn len(&self, key: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM broker_lists WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        sqlx::query(
            "INSERT INTO broker_zsets (key, member, score) VALUES (?, ?, ?) \
             ON CONFLICT(key, member) DO UPDATE SET score = excluded.score",
        )
        .bind(key)
        .bind(member)
        .bind(score)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>> {
        let row = sqlx::query(
            "DELETE FROM broker_zsets WHERE rowid = \
             (SELECT rowid FROM broker_zsets WHERE key = ? ORDER BY score, member LIMIT 1) \
             RETURNING member, score",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| (r.get("member"), r.get("score"))))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM broker_zsets WHERE key = ? AND member = ?")
            .bind(key)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM broker_zsets WHERE key = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        sqlx::query(
            "INSERT INTO broker_kv (key, value, expires_at) VALUES (?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(now_secs() + ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar(
            "SELECT value FROM broker_kv WHERE key = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(key)
        .bind(now_secs())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for table in ["broker_kv", "broker_lists", "broker_zsets"] {
            sqlx::query(&format!("DELETE FROM {} WHERE key = ?", table))
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
