//! Cluster singleton that maps `(namespace, queue)` to a shard and a data
//! node, and tracks node liveness.
//!
//! The registry is nested by namespace (spec §9's resolved ambiguity: the
//! nested form over the flat one), so allocation can cluster a namespace's
//! queues under the same `nsId`.

use kq_core::{ShardId, LIVENESS_SWEEP_INTERVAL, LIVENESS_WINDOW, SHARD_ID_ALLOCATION_RETRIES};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShardManagerError {
    #[error("shard for {0}/{1} not found")]
    NotFound(String, String),

    #[error("no alive data node available")]
    NoAvailableNode,

    #[error("exhausted {SHARD_ID_ALLOCATION_RETRIES} shard id allocation attempts")]
    RetryLater,
}

pub type ShardManagerResult<T> = Result<T, ShardManagerError>;

#[derive(Debug, Clone)]
pub struct Node {
    pub address: String,
    pub internal_address: String,
    pub last_seen: Instant,
    pub is_alive: bool,
}

#[derive(Debug, Clone)]
pub struct Shard {
    pub shard_id: ShardId,
    pub leader_address: String,
    pub internal_address: String,
    pub followers: Vec<String>,
    pub updated_at: Instant,
}

#[derive(Debug, Clone)]
pub struct ShardDescriptor {
    pub shard_id: ShardId,
    pub leader_address: String,
    pub internal_address: String,
    pub is_new: bool,
}

struct State {
    nodes: HashMap<String, Node>,
    shards: HashMap<u64, Shard>,
    names: HashMap<String, HashMap<String, u64>>,
}

/// Node registry, nested shard store, and the allocation algorithm,
/// all behind one multi-reader/single-writer lock (spec §5).
pub struct ShardManager {
    state: RwLock<State>,
}

impl Default for ShardManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShardManager {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                nodes: HashMap::new(),
                shards: HashMap::new(),
                names: HashMap::new(),
            }),
        }
    }

    pub async fn register_node(&self, address: String, internal_address: String) {
        let mut state = self.state.write().await;
        state.nodes.insert(
            address.clone(),
            Node {
                address,
                internal_address,
                last_seen: Instant::now(),
                is_alive: true,
            },
        );
    }

    /// Clears leader addresses of shards owned by this node and drops it
    /// from any follower list; the name mapping is retained so a future
    /// allocation can replace the leader without losing placement history.
    pub async fn unregister_node(&self, address: &str) {
        let mut state = self.state.write().await;
        state.nodes.remove(address);
        for shard in state.shards.values_mut() {
            if shard.leader_address == address {
                shard.leader_address.clear();
                shard.updated_at = Instant::now();
            }
            shard.followers.retain(|f| f != address);
        }
    }

    pub async fn heartbeat(&self, address: &str) -> ShardManagerResult<()> {
        let mut state = self.state.write().await;
        match state.nodes.get_mut(address) {
            Some(node) => {
                node.last_seen = Instant::now();
                node.is_alive = true;
                Ok(())
            }
            None => Err(ShardManagerError::NoAvailableNode),
        }
    }

    pub async fn get_shard(
        &self,
        namespace: &str,
        queue: &str,
        create_if_not_found: bool,
    ) -> ShardManagerResult<ShardDescriptor> {
        let mut state = self.state.write().await;

        if let Some(shard_id) = state
            .names
            .get(namespace)
            .and_then(|queues| queues.get(queue))
            .copied()
        {
            let shard = state.shards.get(&shard_id).expect("name maps to shard");
            return Ok(ShardDescriptor {
                shard_id: ShardId(shard_id),
                leader_address: shard.leader_address.clone(),
                internal_address: shard.internal_address.clone(),
                is_new: false,
            });
        }

        if !create_if_not_found {
            return Err(ShardManagerError::NotFound(
                namespace.to_string(),
                queue.to_string(),
            ));
        }

        let ns_id = match state.names.get(namespace).and_then(|m| m.values().next()) {
            Some(existing_shard_id) => ShardId(*existing_shard_id).ns_id(),
            None => rand::thread_rng().gen(),
        };

        let mut allocated = None;
        for _ in 0..SHARD_ID_ALLOCATION_RETRIES {
            let q_id: u32 = rand::thread_rng().gen();
            let shard_id = ShardId::pack(ns_id, q_id);
            if !state.shards.contains_key(&shard_id.0) {
                allocated = Some(shard_id);
                break;
            }
        }
        let shard_id = allocated.ok_or(ShardManagerError::RetryLater)?;

        let leader = {
            let alive: Vec<&String> = state
                .nodes
                .values()
                .filter(|n| n.is_alive)
                .map(|n| &n.address)
                .collect();
            if alive.is_empty() {
                return Err(ShardManagerError::NoAvailableNode);
            }
            let idx = rand::thread_rng().gen_range(0..alive.len());
            alive[idx].clone()
        };
        let internal_address = state
            .nodes
            .get(&leader)
            .map(|n| n.internal_address.clone())
            .unwrap_or_default();

        state.shards.insert(
            shard_id.0,
            Shard {
                shard_id,
                leader_address: leader.clone(),
                internal_address: internal_address.clone(),
                followers: Vec::new(),
                updated_at: Instant::now(),
            },
        );
        state
            .names
            .entry(namespace.to_string())
            .or_default()
            .insert(queue.to_string(), shard_id.0);

        Ok(ShardDescriptor {
            shard_id,
            leader_address: leader,
            internal_address,
            is_new: true,
        })
    }

    /// Deprecated alias kept on the wire; forwards to `get_shard` with
    /// `create_if_not_found = true`.
    pub async fn request_shard(
        &self,
        namespace: &str,
        queue: &str,
    ) -> ShardManagerResult<ShardDescriptor> {
        debug!("request_shard is deprecated, forwarding to get_shard(create_if_not_found=true)");
        self.get_shard(namespace, queue, true).await
    }

    pub async fn delete_shard(&self, namespace: &str, queue: &str) -> ShardManagerResult<()> {
        let mut state = self.state.write().await;
        let shard_id = state
            .names
            .get_mut(namespace)
            .and_then(|queues| queues.remove(queue))
            .ok_or_else(|| ShardManagerError::NotFound(namespace.to_string(), queue.to_string()))?;
        state.shards.remove(&shard_id);
        Ok(())
    }

    pub async fn list_shards(&self) -> Vec<ShardDescriptor> {
        let state = self.state.read().await;
        state
            .shards
            .values()
            .map(|s| ShardDescriptor {
                shard_id: s.shard_id,
                leader_address: s.leader_address.clone(),
                internal_address: s.internal_address.clone(),
                is_new: false,
            })
            .collect()
    }

    /// Spawns the background sweeper that marks nodes dead past the
    /// liveness window (spec §9: wired here since the reference only
    /// implements the heartbeat write path, not the sweep).
    pub fn spawn_liveness_sweeper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(LIVENESS_SWEEP_INTERVAL).await;
                manager.sweep_dead_nodes().await;
            }
        });
    }

    async fn sweep_dead_nodes(&self) {
        let mut state = self.state.write().await;
        let now = Instant::now();
        for node in state.nodes.values_mut() {
            if node.is_alive && now.duration_since(node.last_seen) > LIVENESS_WINDOW {
                warn!(address = %node.address, "marking node dead after missed heartbeats");
                node.is_alive = false;
            }
        }
    }

    #[cfg(test)]
    async fn alive_node_count(&self) -> usize {
        self.state.read().await.nodes.values().filter(|n| n.is_alive).count()
    }

    #[cfg(test)]
    pub(crate) async fn force_stale(&self, address: &str, age: Duration) {
        let mut state = self.state.write().await;
        if let Some(n) = state.nodes.get_mut(address) {
            n.last_seen = Instant::now() - age;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocation_packs_ns_and_queue_ids() {
        let sm = ShardManager::new();
        sm.register_node("n1:9002".into(), "n1-internal:9002".into()).await;

        let first = sm.get_shard("acct", "orders", true).await.unwrap();
        assert!(first.is_new);
        let (ns_id, _) = first.shard_id.split();

        let second = sm.get_shard("acct", "invoices", true).await.unwrap();
        assert_eq!(second.shard_id.ns_id(), ns_id, "queues in the same namespace cluster under the same nsId");
    }

    #[tokio::test]
    async fn get_shard_without_create_returns_not_found() {
        let sm = ShardManager::new();
        let err = sm.get_shard("acct", "missing", false).await.unwrap_err();
        assert_eq!(err, ShardManagerError::NotFound("acct".into(), "missing".into()));
    }

    #[tokio::test]
    async fn allocation_with_no_nodes_fails_precondition() {
        let sm = ShardManager::new();
        let err = sm.get_shard("acct", "orders", true).await.unwrap_err();
        assert_eq!(err, ShardManagerError::NoAvailableNode);
    }

    #[tokio::test]
    async fn unregister_clears_leader_but_keeps_name_mapping() {
        let sm = ShardManager::new();
        sm.register_node("n1:9002".into(), "n1-internal:9002".into()).await;
        let shard = sm.get_shard("acct", "orders", true).await.unwrap();

        sm.unregister_node("n1:9002").await;

        let again = sm.get_shard("acct", "orders", false).await.unwrap();
        assert_eq!(again.shard_id, shard.shard_id);
        assert_eq!(again.leader_address, "");
    }

    #[tokio::test]
    async fn liveness_sweep_marks_stale_nodes_dead() {
        let sm = Arc::new(ShardManager::new());
        sm.register_node("n1:9002".into(), "n1-internal:9002".into()).await;
        sm.force_stale("n1:9002", LIVENESS_WINDOW + Duration::from_secs(1)).await;
        sm.sweep_dead_nodes().await;
        assert_eq!(sm.alive_node_count().await, 0);
    }

    #[tokio::test]
    async fn delete_shard_removes_name_and_record() {
        let sm = ShardManager::new();
        sm.register_node("n1:9002".into(), "n1-internal:9002".into()).await;
        sm.get_shard("acct", "orders", true).await.unwrap();
        sm.delete_shard("acct", "orders").await.unwrap();
        let err = sm.get_shard("acct", "orders", false).await.unwrap_err();
        assert_eq!(err, ShardManagerError::NotFound("acct".into(), "orders".into()));
    }
}
