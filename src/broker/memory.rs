//! In-process [`Broker`] for tests and single-process setups.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::{Broker, BrokerError};

#[derive(Default)]
struct State {
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    kv: HashMap<String, (String, Instant)>,
}

#[derive(Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    pushed: Notify,
    unavailable: AtomicBool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`BrokerError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("in-memory broker offline".into()).into());
        }
        Ok(())
    }

    fn try_pop_move(&self, src: &str, dst: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        let value = state.lists.get_mut(src)?.pop_front()?;
        state
            .lists
            .entry(dst.to_string())
            .or_default()
            .push_back(value.clone());
        Some(value)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn push_back(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn push_front(&self, key: &str, value: &str) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .lists
            .entry(key.to_string())
            .or_default()
            .push_front(value.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        Ok(state.lists.get_mut(key).and_then(VecDeque::pop_front))
    }

    async fn pop_move(&self, src: &str, dst: &str) -> Result<Option<String>> {
        self.check()?;
        Ok(self.try_pop_move(src, dst))
    }

    async fn blocking_pop_move(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.check()?;
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.try_pop_move(src, dst) {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn remove(&self, key: &str, value: &str) -> Result<usize> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        Ok(before - list.len())
    }

    async fn range(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn len(&self, key: &str) -> Result<usize> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<(String, f64)>> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let Some(set) = state.zsets.get_mut(key) else {
            return Ok(None);
        };
        let min = set
            .iter()
            .min_by(|(ma, sa), (mb, sb)| {
                sa.partial_cmp(sb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| ma.cmp(mb))
            })
            .map(|(m, _)| m.clone());
        Ok(min.and_then(|m| set.remove_entry(&m)))
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        Ok(state
            .zsets
            .get_mut(key)
            .map_or(false, |set| set.remove(member).is_some()))
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state.zsets.get(key).map_or(0, HashMap::len))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.state
            .lock()
            .unwrap()
            .kv
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state
            .kv
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(v, _)| v.clone()))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.kv.remove(key);
        state.lists.remove(key);
        state.zsets.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn lists_are_fifo_with_front_insertion() {
        let broker = InMemoryBroker::new();
        broker.push_back("q", "a").await.unwrap();
        broker.push_back("q", "b").await.unwrap();
        broker.push_front("q", "z").await.unwrap();
        assert_eq!(broker.range("q").await.unwrap(), vec!["z", "a", "b"]);
        assert_eq!(broker.pop_front("q").await.unwrap().as_deref(), Some("z"));
        assert_eq!(broker.remove("q", "b").await.unwrap(), 1);
        assert_eq!(broker.len("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pop_move_transfers_head() {
        let broker = InMemoryBroker::new();
        broker.push_back("src", "a").await.unwrap();
        assert_eq!(
            broker.pop_move("src", "dst").await.unwrap().as_deref(),
            Some("a")
        );
        assert_eq!(broker.pop_move("src", "dst").await.unwrap(), None);
        assert_eq!(broker.range("dst").await.unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn blocking_pop_move_wakes_on_push() {
        let broker = Arc::new(InMemoryBroker::new());
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .blocking_pop_move("src", "dst", Duration::from_secs(5))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.push_back("src", "job").await.unwrap();
        assert_eq!(waiter.await.unwrap().as_deref(), Some("job"));

        let empty = broker
            .blocking_pop_move("src", "dst", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(empty, None);
    }

    #[tokio::test]
    async fn zpopmin_returns_lowest_score() {
        let broker = InMemoryBroker::new();
        broker.zadd("z", "late", 20.0).await.unwrap();
        broker.zadd("z", "early", 10.0).await.unwrap();
        assert_eq!(broker.zcard("z").await.unwrap(), 2);
        assert_eq!(
            broker.zpopmin("z").await.unwrap(),
            Some(("early".to_string(), 10.0))
        );
        assert!(broker.zrem("z", "late").await.unwrap());
        assert_eq!(broker.zpopmin("z").await.unwrap(), None);
    }

    #[tokio::test]
    async fn keys_expire() {
        let broker = InMemoryBroker::new();
        broker
            .set_ex("k", "v", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(broker.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(broker.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unavailable_broker_fails_calls() {
        let broker = InMemoryBroker::new();
        broker.set_unavailable(true);
        let err = broker.ping().await.unwrap_err();
        assert!(err.downcast_ref::<BrokerError>().is_some());
        broker.set_unavailable(false);
        broker.ping().await.unwrap();
    }
}
