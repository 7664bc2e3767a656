//! Stateless request router: resolves `(namespace, queue)` to a data node
//! via the Shard Manager, caches the mapping, and fans control operations
//! out to the right node.

use crate::rpc::client::{connect_to_shard_manager, deadline_context, DataPlaneClientPool};
use crate::rpc::protocol::{RpcError, ShardManagerRpcClient};
use kq_core::ShardId;
use std::collections::HashMap;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Error, Clone)]
pub enum ControlPlaneError {
    #[error("queue {1} not found in namespace {0}")]
    NotFound(String, String),

    #[error("queue {1} already exists in namespace {0}")]
    AlreadyExists(String, String),

    #[error("shard manager unavailable: {0}")]
    DependencyFailure(String),

    #[error("{0}")]
    Internal(String),
}

pub type ControlPlaneResult<T> = Result<T, ControlPlaneError>;

impl From<RpcError> for ControlPlaneError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::NotFound(what) => ControlPlaneError::NotFound(String::new(), what),
            RpcError::AlreadyExists(what) => ControlPlaneError::AlreadyExists(String::new(), what),
            RpcError::FailedPrecondition(msg) | RpcError::DependencyFailure(msg) => {
                ControlPlaneError::DependencyFailure(msg)
            }
            other => ControlPlaneError::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ControlPlaneError {
    fn from(e: std::io::Error) -> Self {
        ControlPlaneError::DependencyFailure(e.to_string())
    }
}

/// Outcome of resolving `(namespace, queue)`, distinguishing a fresh
/// Shard Manager allocation from a cache hit or pre-existing shard.
pub struct Resolved {
    pub address: String,
    pub shard_id: ShardId,
    pub is_new: bool,
}

pub struct ControlPlane {
    shard_manager_addr: SocketAddr,
    sm_client: Mutex<Option<ShardManagerRpcClient>>,
    address_cache: RwLock<HashMap<String, HashMap<String, String>>>,
    data_pool: DataPlaneClientPool,
}

impl ControlPlane {
    pub fn new(shard_manager_addr: SocketAddr) -> Self {
        Self {
            shard_manager_addr,
            sm_client: Mutex::new(None),
            address_cache: RwLock::new(HashMap::new()),
            data_pool: DataPlaneClientPool::new(),
        }
    }

    async fn shard_manager(&self) -> ControlPlaneResult<ShardManagerRpcClient> {
        let mut guard = self.sm_client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = connect_to_shard_manager(self.shard_manager_addr).await?;
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn invalidate_shard_manager(&self) {
        *self.sm_client.lock().await = None;
    }

    fn cache_get(&self, cache: &HashMap<String, HashMap<String, String>>, ns: &str, q: &str) -> Option<String> {
        cache.get(ns).and_then(|m| m.get(q)).cloned()
    }

    /// Calls `GetShard` on the Shard Manager, dropping the cached client on
    /// a transport-level failure so the next call reconnects.
    async fn get_shard_via_manager(
        &self,
        namespace: &str,
        queue: &str,
        create_if_not_found: bool,
    ) -> ControlPlaneResult<crate::rpc::protocol::ShardDescriptor> {
        let sm = self.shard_manager().await?;
        let outcome = sm
            .get_shard(
                deadline_context(),
                namespace.to_string(),
                queue.to_string(),
                create_if_not_found,
            )
            .await;
        match outcome {
            Err(e) => {
                self.invalidate_shard_manager().await;
                Err(ControlPlaneError::DependencyFailure(e.to_string()))
            }
            Ok(Err(rpc_err)) => Err(rpc_err.into()),
            Ok(Ok(descriptor)) => Ok(descriptor),
        }
    }

    pub async fn add_namespace(&self, namespace: String) -> ControlPlaneResult<()> {
        // Mirrors the reference's AddNamespace: materializes a default queue
        // so the namespace has at least one shard to cluster future queues under.
        self.add_queue(namespace, ".Default".to_string()).await?;
        Ok(())
    }

    pub async fn add_queue(&self, namespace: String, queue: String) -> ControlPlaneResult<Resolved> {
        let descriptor = self.get_shard_via_manager(&namespace, &queue, true).await?;

        if !descriptor.is_new {
            return Err(ControlPlaneError::AlreadyExists(namespace, queue));
        }

        let node = self.data_pool.get_or_connect(&descriptor.leader_address).await?;
        let created = node
            .new_queue(deadline_context(), descriptor.shard_id, namespace.clone(), queue.clone())
            .await
            .map_err(|e| ControlPlaneError::Internal(e.to_string()))?;

        if let Err(e) = created {
            warn!(%namespace, %queue, "rolling back shard allocation after failed New");
            if let Ok(sm) = self.shard_manager().await {
                let _ = sm
                    .delete_shard(deadline_context(), namespace.clone(), queue.clone())
                    .await;
            }
            return Err(e.into());
        }

        self.address_cache
            .write()
            .await
            .entry(namespace.clone())
            .or_default()
            .insert(queue.clone(), descriptor.leader_address.clone());

        info!(%namespace, %queue, address = %descriptor.leader_address, "queue created");
        Ok(Resolved {
            address: descriptor.leader_address,
            shard_id: descriptor.shard_id,
            is_new: true,
        })
    }

    pub async fn get_dataplane(&self, namespace: &str, queue: &str) -> ControlPlaneResult<String> {
        if let Some(addr) = self.cache_get(&*self.address_cache.read().await, namespace, queue) {
            return Ok(addr);
        }

        let descriptor = self.get_shard_via_manager(namespace, queue, false).await?;

        self.address_cache
            .write()
            .await
            .entry(namespace.to_string())
            .or_default()
            .insert(queue.to_string(), descriptor.leader_address.clone());

        Ok(descriptor.leader_address)
    }

    pub async fn get_queue(&self, namespace: &str, queue: &str) -> ControlPlaneResult<Resolved> {
        let descriptor = self.get_shard_via_manager(namespace, queue, false).await?;
        Ok(Resolved {
            address: descriptor.leader_address,
            shard_id: descriptor.shard_id,
            is_new: false,
        })
    }

    /// Forwards to the owning node only; evicts and re-resolves once on a
    /// `NotFound` response from a stale cache entry (spec §4.4).
    pub async fn clear_queue(&self, namespace: &str, queue: &str) -> ControlPlaneResult<()> {
        self.with_resolved_retry(namespace, queue, |node, ns, q| async move {
            node.clear(deadline_context(), ns, q).await
        })
        .await
    }

    pub async fn delete_queue(&self, namespace: &str, queue: &str) -> ControlPlaneResult<()> {
        let result = self
            .with_resolved_retry(namespace, queue, |node, ns, q| async move {
                node.delete(deadline_context(), ns, q).await
            })
            .await;

        if result.is_ok() {
            let sm = self.shard_manager().await?;
            let _ = sm
                .delete_shard(deadline_context(), namespace.to_string(), queue.to_string())
                .await;
            self.address_cache
                .write()
                .await
                .get_mut(namespace)
                .map(|m| m.remove(queue));
        }
        result
    }

    pub async fn get_stats(&self) -> ControlPlaneResult<()> {
        Err(ControlPlaneError::Internal("unimplemented".to_string()))
    }

    /// Resolves `(namespace, queue)` through the cache, runs `op` against
    /// the node, and on a `NotFound` evicts and re-resolves exactly once.
    async fn with_resolved_retry<F, Fut>(
        &self,
        namespace: &str,
        queue: &str,
        op: F,
    ) -> ControlPlaneResult<()>
    where
        F: Fn(crate::rpc::protocol::DataPlaneRpcClient, String, String) -> Fut,
        Fut: std::future::Future<Output = Result<Result<(), RpcError>, tarpc::client::RpcError>>,
    {
        let address = self.get_dataplane(namespace, queue).await?;
        let node = self.data_pool.get_or_connect(&address).await?;
        let first = op(node, namespace.to_string(), queue.to_string())
            .await
            .map_err(|e| ControlPlaneError::Internal(e.to_string()))?;

        match first {
            Ok(()) => Ok(()),
            Err(RpcError::NotFound(_)) => {
                debug!(%namespace, %queue, "stale cache entry, evicting and re-resolving");
                self.address_cache
                    .write()
                    .await
                    .get_mut(namespace)
                    .map(|m| m.remove(queue));
                self.data_pool.invalidate(&address).await;

                let address = self.get_dataplane(namespace, queue).await?;
                let node = self.data_pool.get_or_connect(&address).await?;
                op(node, namespace.to_string(), queue.to_string())
                    .await
                    .map_err(|e| ControlPlaneError::Internal(e.to_string()))?
                    .map_err(ControlPlaneError::from)
            }
            Err(other) => Err(other.into()),
        }
    }
}
