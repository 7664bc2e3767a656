//! Error types for the priority queue engine.

use thiserror::Error;

/// Result type for queue engine operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur against a single queue's priority engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,

    #[error("queue is full")]
    Full,

    #[error("queue is closed")]
    Closed,

    #[error("lock {0} is unknown")]
    UnknownLock(String),

    #[error("lock {0} has expired")]
    Expired(String),
}
