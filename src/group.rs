//! Resource-sharing rotation groups.
//!
//! Workers of different modules that share one scarce resource (typically
//! a GPU) join the same group. Membership is an ordered broker list; each
//! member also keeps an expiring `alive` key fresh. Only the head of the
//! list may claim run jobs. After its time budget the head moves itself to
//! the tail, handing the resource to the next member. A member whose
//! `alive` key lapsed is evicted by whoever finds it at the head.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::broker::{now_secs, Broker};
use crate::queue::QueueKeys;

pub struct ResourceGroup {
    broker: Arc<dyn Broker>,
    keys: QueueKeys,
    name: String,
    worker_id: String,
    ttl: Duration,
}

impl ResourceGroup {
    pub fn new(
        broker: Arc<dyn Broker>,
        keys: QueueKeys,
        name: &str,
        worker_id: &str,
        ttl: Duration,
    ) -> Self {
        Self {
            broker,
            keys,
            name: name.to_string(),
            worker_id: worker_id.to_string(),
            ttl,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn members_key(&self) -> String {
        self.keys.group_members(&self.name)
    }

    /// Refresh this worker's liveness and join the group if not a member.
    pub async fn heartbeat(&self) -> Result<()> {
        self.broker
            .set_ex(
                &self.keys.group_alive(&self.name, &self.worker_id),
                &now_secs().to_string(),
                self.ttl,
            )
            .await?;

        let members = self.broker.range(&self.members_key()).await?;
        if !members.iter().any(|m| m == &self.worker_id) {
            self.broker
                .push_back(&self.members_key(), &self.worker_id)
                .await?;
            info!(group = %self.name, worker = %self.worker_id, "joined resource group");
        }
        Ok(())
    }

    /// Whether this worker currently holds the resource. Members at the
    /// head whose heartbeat lapsed are evicted first.
    pub async fn is_head(&self) -> Result<bool> {
        let members_key = self.members_key();
        for member in self.broker.range(&members_key).await? {
            if self
                .broker
                .get(&self.keys.group_alive(&self.name, &member))
                .await?
                .is_some()
            {
                return Ok(member == self.worker_id);
            }
            self.broker.remove(&members_key, &member).await?;
            info!(group = %self.name, worker = %member, "evicted lapsed group member");
        }
        Ok(false)
    }

    /// Move this worker to the tail of the group.
    pub async fn rotate(&self) -> Result<()> {
        let members_key = self.members_key();
        self.broker.remove(&members_key, &self.worker_id).await?;
        self.broker.push_back(&members_key, &self.worker_id).await?;
        debug!(group = %self.name, worker = %self.worker_id, "rotated to tail");
        Ok(())
    }

    pub async fn leave(&self) -> Result<()> {
        self.broker
            .remove(&self.members_key(), &self.worker_id)
            .await?;
        self.broker
            .del(&self.keys.group_alive(&self.name, &self.worker_id))
            .await?;
        info!(group = %self.name, worker = %self.worker_id, "left resource group");
        Ok(())
    }
}
