//! tarpc service trait definitions for the three planes.

use kq_core::{LockId, LockedMessage, QueueItem, ShardId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result type for RPC operations, serializable across the wire.
pub type RpcResult<T> = Result<T, RpcError>;

/// Wire-safe projection of the internal error taxonomy (spec §7). No
/// `std::error::Error` source chain crosses the RPC boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RpcError {
    NotFound(String),
    AlreadyExists(String),
    QueueDisabled(String),
    FailedPrecondition(String),
    DependencyFailure(String),
    DeadlineExceeded(String),
    Unimplemented(String),
    Internal(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::NotFound(what) => write!(f, "not found: {}", what),
            RpcError::AlreadyExists(what) => write!(f, "already exists: {}", what),
            RpcError::QueueDisabled(what) => write!(f, "queue disabled: {}", what),
            RpcError::FailedPrecondition(msg) => write!(f, "failed precondition: {}", msg),
            RpcError::DependencyFailure(msg) => write!(f, "dependency failure: {}", msg),
            RpcError::DeadlineExceeded(msg) => write!(f, "deadline exceeded: {}", msg),
            RpcError::Unimplemented(what) => write!(f, "unimplemented: {}", what),
            RpcError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {}

/// A data node, as reported by the Shard Manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub shard_id: ShardId,
    pub leader_address: String,
    pub internal_address: String,
    pub is_new: bool,
}

#[tarpc::service]
pub trait ShardManagerRpc {
    /// Called by a data node on startup.
    async fn register_node(address: String, internal_address: String) -> RpcResult<()>;

    /// Called by a data node on clean shutdown.
    async fn unregister_node(address: String) -> RpcResult<()>;

    /// Resolve or allocate the shard for `(namespace, queue)`.
    async fn get_shard(
        namespace: String,
        queue: String,
        create_if_not_found: bool,
    ) -> RpcResult<ShardDescriptor>;

    /// Remove the name mapping and the shard record.
    async fn delete_shard(namespace: String, queue: String) -> RpcResult<()>;

    /// Deprecated: forwards to `get_shard(create_if_not_found = true)`.
    async fn request_shard(namespace: String, queue: String) -> RpcResult<ShardDescriptor>;

    async fn list_shards() -> RpcResult<Vec<ShardDescriptor>>;

    /// Refresh a node's liveness timestamp.
    async fn heartbeat(address: String) -> RpcResult<()>;
}

#[tarpc::service]
pub trait ControlPlaneRpc {
    async fn add_namespace(namespace: String) -> RpcResult<()>;

    async fn add_queue(namespace: String, queue: String) -> RpcResult<ShardDescriptor>;

    async fn get_queue(namespace: String, queue: String) -> RpcResult<ShardDescriptor>;

    async fn clear_queue(namespace: String, queue: String) -> RpcResult<()>;

    async fn delete_queue(namespace: String, queue: String) -> RpcResult<()>;

    async fn get_dataplane(namespace: String, queue: String) -> RpcResult<String>;

    async fn get_stats() -> RpcResult<()>;
}

#[tarpc::service]
pub trait DataPlaneRpc {
    async fn new_queue(shard_id: ShardId, namespace: String, queue: String) -> RpcResult<ShardId>;

    async fn get(namespace: String, queue: String) -> RpcResult<ShardId>;

    async fn get_stats(namespace: String, queue: String) -> RpcResult<()>;

    async fn delete(namespace: String, queue: String) -> RpcResult<()>;

    async fn clear(namespace: String, queue: String) -> RpcResult<()>;

    async fn enqueue(namespace: String, queue: String, priority: u32) -> RpcResult<QueueItem>;

    async fn dequeue(namespace: String, queue: String) -> RpcResult<QueueItem>;

    async fn peek(namespace: String, queue: String) -> RpcResult<QueueItem>;

    async fn peek_lock(namespace: String, queue: String) -> RpcResult<LockedMessage>;

    async fn ack(namespace: String, queue: String, lock_id: LockId) -> RpcResult<()>;

    async fn nack(namespace: String, queue: String, lock_id: LockId) -> RpcResult<()>;

    async fn extend(
        namespace: String,
        queue: String,
        lock_id: LockId,
        additional: Duration,
    ) -> RpcResult<()>;

    async fn set_visibility_timeout(
        namespace: String,
        queue: String,
        timeout: Duration,
    ) -> RpcResult<()>;

    async fn refresh_visibility_timeout(
        namespace: String,
        queue: String,
        lock_id: LockId,
    ) -> RpcResult<()>;

    async fn release_lock(namespace: String, queue: String, lock_id: LockId) -> RpcResult<()>;
}
