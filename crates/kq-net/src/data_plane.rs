//! A single data node: owns a set of queues keyed by shard, and the
//! `(namespace, queue)` index into them.

use kq_core::{
    LockId, LockedMessage, QueueConfig, QueueError, QueueItem, Queue, ShardId,
};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::rpc::client::{connect_to_shard_manager, deadline_context};
use crate::rpc::protocol::RpcError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DataPlaneError {
    #[error("queue {1} not found in namespace {0}")]
    NotFound(String, String),

    #[error("queue {1} already exists in namespace {0}")]
    AlreadyExists(String, String),
}

pub type DataPlaneResult<T> = Result<T, DataPlaneError>;

impl From<DataPlaneError> for RpcError {
    fn from(e: DataPlaneError) -> Self {
        match e {
            DataPlaneError::NotFound(ns, q) => RpcError::NotFound(format!("{ns}/{q}")),
            DataPlaneError::AlreadyExists(ns, q) => RpcError::AlreadyExists(format!("{ns}/{q}")),
        }
    }
}

impl From<QueueError> for RpcError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Empty => RpcError::NotFound("queue is empty".to_string()),
            QueueError::Full => RpcError::FailedPrecondition("queue is full".to_string()),
            QueueError::Closed => RpcError::FailedPrecondition("queue is closed".to_string()),
            QueueError::UnknownLock(id) => RpcError::NotFound(format!("lock {id}")),
            QueueError::Expired(id) => RpcError::FailedPrecondition(format!("lock {id} expired")),
        }
    }
}

/// A node's local queue store: every shard it currently hosts, plus the
/// name lookup into it. Registers itself with the Shard Manager on
/// startup and unregisters on clean shutdown (spec §4.2).
pub struct DataPlane {
    address: String,
    internal_address: String,
    shard_manager_addr: std::net::SocketAddr,
    queues: RwLock<HashMap<u64, Queue>>,
    index: RwLock<HashMap<(String, String), ShardId>>,
}

impl DataPlane {
    pub fn new(
        address: String,
        internal_address: String,
        shard_manager_addr: std::net::SocketAddr,
    ) -> Self {
        Self {
            address,
            internal_address,
            shard_manager_addr,
            queues: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_with_shard_manager(&self) -> Result<(), std::io::Error> {
        let sm = connect_to_shard_manager(self.shard_manager_addr).await?;
        sm.register_node(
            deadline_context(),
            self.address.clone(),
            self.internal_address.clone(),
        )
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        info!(address = %self.address, "registered with shard manager");
        Ok(())
    }

    pub async fn unregister_from_shard_manager(&self) {
        match connect_to_shard_manager(self.shard_manager_addr).await {
            Ok(sm) => {
                if let Err(e) = sm
                    .unregister_node(deadline_context(), self.address.clone())
                    .await
                {
                    warn!(error = %e, "failed to unregister from shard manager");
                }
            }
            Err(e) => warn!(error = %e, "failed to reach shard manager during shutdown"),
        }
        info!(address = %self.address, "unregistered from shard manager");
    }

    fn key(namespace: &str, queue: &str) -> (String, String) {
        (namespace.to_string(), queue.to_string())
    }

    pub async fn new_queue(
        &self,
        shard_id: ShardId,
        namespace: &str,
        queue: &str,
    ) -> DataPlaneResult<ShardId> {
        let key = Self::key(namespace, queue);
        if self.index.read().await.contains_key(&key) {
            return Err(DataPlaneError::AlreadyExists(
                namespace.to_string(),
                queue.to_string(),
            ));
        }
        self.queues
            .write()
            .await
            .insert(shard_id.0, Queue::new(QueueConfig::default()));
        self.index.write().await.insert(key, shard_id);
        debug!(%namespace, %queue, %shard_id, "queue materialized on this node");
        Ok(shard_id)
    }

    pub async fn get(&self, namespace: &str, queue: &str) -> DataPlaneResult<ShardId> {
        self.index
            .read()
            .await
            .get(&Self::key(namespace, queue))
            .copied()
            .ok_or_else(|| DataPlaneError::NotFound(namespace.to_string(), queue.to_string()))
    }

    pub async fn delete(&self, namespace: &str, queue: &str) -> DataPlaneResult<()> {
        let shard_id = self
            .index
            .write()
            .await
            .remove(&Self::key(namespace, queue))
            .ok_or_else(|| DataPlaneError::NotFound(namespace.to_string(), queue.to_string()))?;
        self.queues.write().await.remove(&shard_id.0);
        Ok(())
    }

    /// Not implemented by the reference node either; kept as a typed
    /// `Unimplemented` response rather than a missing RPC method.
    pub async fn get_stats(&self, namespace: &str, queue: &str) -> Result<(), RpcError> {
        self.queue_for(namespace, queue).await?;
        Err(RpcError::Unimplemented("get_stats".to_string()))
    }

    async fn queue_for(&self, namespace: &str, queue: &str) -> Result<ShardId, RpcError> {
        self.get(namespace, queue).await.map_err(RpcError::from)
    }

    pub async fn clear(&self, namespace: &str, queue: &str) -> Result<(), RpcError> {
        let shard_id = self.queue_for(namespace, queue).await?;
        let queues = self.queues.read().await;
        let q = queues
            .get(&shard_id.0)
            .ok_or_else(|| RpcError::Internal("shard index out of sync".to_string()))?;
        q.clear().await;
        Ok(())
    }

    pub async fn enqueue(
        &self,
        namespace: &str,
        queue: &str,
        priority: u32,
    ) -> Result<QueueItem, RpcError> {
        let shard_id = self.queue_for(namespace, queue).await?;
        let queues = self.queues.read().await;
        let q = queues
            .get(&shard_id.0)
            .ok_or_else(|| RpcError::Internal("shard index out of sync".to_string()))?;
        Ok(q.enqueue(priority).await?)
    }

    pub async fn dequeue(&self, namespace: &str, queue: &str) -> Result<QueueItem, RpcError> {
        let shard_id = self.queue_for(namespace, queue).await?;
        let queues = self.queues.read().await;
        let q = queues
            .get(&shard_id.0)
            .ok_or_else(|| RpcError::Internal("shard index out of sync".to_string()))?;
        Ok(q.dequeue().await?)
    }

    pub async fn peek(&self, namespace: &str, queue: &str) -> Result<QueueItem, RpcError> {
        let shard_id = self.queue_for(namespace, queue).await?;
        let queues = self.queues.read().await;
        let q = queues
            .get(&shard_id.0)
            .ok_or_else(|| RpcError::Internal("shard index out of sync".to_string()))?;
        Ok(q.peek().await?)
    }

    pub async fn peek_lock(
        &self,
        namespace: &str,
        queue: &str,
    ) -> Result<LockedMessage, RpcError> {
        let shard_id = self.queue_for(namespace, queue).await?;
        let queues = self.queues.read().await;
        let q = queues
            .get(&shard_id.0)
            .ok_or_else(|| RpcError::Internal("shard index out of sync".to_string()))?;
        Ok(q.peek_lock().await?)
    }

    pub async fn ack(&self, namespace: &str, queue: &str, lock_id: LockId) -> Result<(), RpcError> {
        let shard_id = self.queue_for(namespace, queue).await?;
        let queues = self.queues.read().await;
        let q = queues
            .get(&shard_id.0)
            .ok_or_else(|| RpcError::Internal("shard index out of sync".to_string()))?;
        Ok(q.ack(lock_id).await?)
    }

    pub async fn nack(&self, namespace: &str, queue: &str, lock_id: LockId) -> Result<(), RpcError> {
        let shard_id = self.queue_for(namespace, queue).await?;
        let queues = self.queues.read().await;
        let q = queues
            .get(&shard_id.0)
            .ok_or_else(|| RpcError::Internal("shard index out of sync".to_string()))?;
        Ok(q.nack(lock_id).await?)
    }

    pub async fn extend(
        &self,
        namespace: &str,
        queue: &str,
        lock_id: LockId,
        additional: Duration,
    ) -> Result<(), RpcError> {
        let shard_id = self.queue_for(namespace, queue).await?;
        let queues = self.queues.read().await;
        let q = queues
            .get(&shard_id.0)
            .ok_or_else(|| RpcError::Internal("shard index out of sync".to_string()))?;
        Ok(q.extend(lock_id, additional).await?)
    }

    pub async fn set_visibility_timeout(
        &self,
        namespace: &str,
        queue: &str,
        timeout: Duration,
    ) -> Result<(), RpcError> {
        let shard_id = self.queue_for(namespace, queue).await?;
        let queues = self.queues.read().await;
        let q = queues
            .get(&shard_id.0)
            .ok_or_else(|| RpcError::Internal("shard index out of sync".to_string()))?;
        q.set_visibility_timeout(timeout).await;
        Ok(())
    }

    pub async fn refresh_visibility_timeout(
        &self,
        namespace: &str,
        queue: &str,
        lock_id: LockId,
    ) -> Result<(), RpcError> {
        let shard_id = self.queue_for(namespace, queue).await?;
        let queues = self.queues.read().await;
        let q = queues
            .get(&shard_id.0)
            .ok_or_else(|| RpcError::Internal("shard index out of sync".to_string()))?;
        Ok(q.refresh_visibility_timeout(lock_id).await?)
    }

    pub async fn release_lock(
        &self,
        namespace: &str,
        queue: &str,
        lock_id: LockId,
    ) -> Result<(), RpcError> {
        let shard_id = self.queue_for(namespace, queue).await?;
        let queues = self.queues.read().await;
        let q = queues
            .get(&shard_id.0)
            .ok_or_else(|| RpcError::Internal("shard index out of sync".to_string()))?;
        Ok(q.release_lock(lock_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> std::net::SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[tokio::test]
    async fn new_queue_then_enqueue_dequeue_roundtrip() {
        let dp = DataPlane::new("127.0.0.1:9100".into(), "127.0.0.1:9100".into(), addr());
        let shard_id = ShardId::pack(1, 2);
        dp.new_queue(shard_id, "acct", "orders").await.unwrap();

        let item = dp.enqueue("acct", "orders", 5).await.unwrap();
        let dequeued = dp.dequeue("acct", "orders").await.unwrap();
        assert_eq!(item.message_id, dequeued.message_id);
    }

    #[tokio::test]
    async fn new_queue_twice_fails_already_exists() {
        let dp = DataPlane::new("127.0.0.1:9100".into(), "127.0.0.1:9100".into(), addr());
        let shard_id = ShardId::pack(1, 2);
        dp.new_queue(shard_id, "acct", "orders").await.unwrap();
        let err = dp.new_queue(shard_id, "acct", "orders").await.unwrap_err();
        assert_eq!(
            err,
            DataPlaneError::AlreadyExists("acct".into(), "orders".into())
        );
    }

    #[tokio::test]
    async fn operations_on_unknown_queue_return_not_found() {
        let dp = DataPlane::new("127.0.0.1:9100".into(), "127.0.0.1:9100".into(), addr());
        let err = dp.enqueue("acct", "missing", 1).await.unwrap_err();
        assert!(matches!(err, RpcError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_removes_queue_and_index_entry() {
        let dp = DataPlane::new("127.0.0.1:9100".into(), "127.0.0.1:9100".into(), addr());
        let shard_id = ShardId::pack(1, 2);
        dp.new_queue(shard_id, "acct", "orders").await.unwrap();
        dp.delete("acct", "orders").await.unwrap();
        assert!(dp.get("acct", "orders").await.is_err());
    }

    #[tokio::test]
    async fn peek_lock_ack_cycle() {
        let dp = DataPlane::new("127.0.0.1:9100".into(), "127.0.0.1:9100".into(), addr());
        let shard_id = ShardId::pack(1, 2);
        dp.new_queue(shard_id, "acct", "orders").await.unwrap();
        dp.enqueue("acct", "orders", 1).await.unwrap();

        let locked = dp.peek_lock("acct", "orders").await.unwrap();
        dp.ack("acct", "orders", locked.lock_id).await.unwrap();
        let err = dp.dequeue("acct", "orders").await.unwrap_err();
        assert!(matches!(err, RpcError::NotFound(_)));
    }
}
