//! Core types shared by the queue engine and the three RPC planes.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Packed shard identifier: `(nsId << 32) | qId`.
///
/// Given a `ShardId`, both halves are always recoverable by bit-split; the
/// Shard Manager never stores `nsId` separately from an allocated shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId(pub u64);

impl ShardId {
    pub fn pack(ns_id: u32, q_id: u32) -> Self {
        Self(((ns_id as u64) << 32) | q_id as u64)
    }

    pub fn split(&self) -> (u32, u32) {
        ((self.0 >> 32) as u32, self.0 as u32)
    }

    pub fn ns_id(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub fn q_id(&self) -> u32 {
        self.0 as u32
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard-{:016x}", self.0)
    }
}

/// Address of a data-plane node, e.g. `127.0.0.1:9002`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn to_socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-queue configuration. `max_delivery_count` and `enable_dlq` are not
/// fixed by the wire protocol; they are the queue's own runtime config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub enable_dlq: bool,
    pub max_delivery_count: u32,
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enable_dlq: false,
            max_delivery_count: 5,
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

/// A single message in a queue. Smaller `priority` sorts first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub message_id: Uuid,
    pub priority: u32,
}

impl QueueItem {
    pub fn new(priority: u32) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            priority,
        }
    }
}

/// Opaque token returned by `PeekLock`, required by `Ack`/`Nack`/`Extend`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId(pub Uuid);

impl LockId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message currently hidden behind a `PeekLock`, as returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockedMessage {
    pub item: QueueItem,
    pub lock_id: LockId,
}

/// Liveness window before a node is excluded from shard allocation.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(10);

/// Interval between liveness sweeps.
pub const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Deadline attached to every outbound Control Plane RPC.
pub const CONTROL_RPC_DEADLINE: Duration = Duration::from_secs(15);

/// Number of collision retries the Shard Manager allows during allocation.
pub const SHARD_ID_ALLOCATION_RETRIES: u32 = 30;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_split_roundtrip() {
        let id = ShardId::pack(7, 42);
        assert_eq!(id.split(), (7, 42));
        assert_eq!(id.ns_id(), 7);
        assert_eq!(id.q_id(), 42);
    }

    #[test]
    fn node_address_format() {
        let addr = NodeAddress::new("127.0.0.1", 9002);
        assert_eq!(addr.to_socket_addr(), "127.0.0.1:9002");
        assert_eq!(format!("{}", addr), "127.0.0.1:9002");
    }

    #[test]
    fn queue_config_defaults() {
        let cfg = QueueConfig::default();
        assert!(!cfg.enable_dlq);
        assert_eq!(cfg.max_delivery_count, 5);
    }
}
