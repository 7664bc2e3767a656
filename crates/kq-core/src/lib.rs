//! # kq-core
//!
//! The priority queue engine and the shared types it, and the three RPC
//! planes built on top of it, speak: shard identifiers, node addresses,
//! queue configuration, and the typed error taxonomy.

pub mod error;
pub mod queue;
pub mod types;

pub use error::{QueueError, QueueResult};
pub use queue::Queue;
pub use types::{
    LockId, LockedMessage, NodeAddress, QueueConfig, QueueItem, ShardId,
    CONTROL_RPC_DEADLINE, LIVENESS_SWEEP_INTERVAL, LIVENESS_WINDOW, SHARD_ID_ALLOCATION_RETRIES,
};
