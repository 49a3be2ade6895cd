//! Queue errors.

use thiserror::Error;
use uuid::Uuid;

/// Queue error types.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Queue is at capacity.
    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// No active task with that ID.
    #[error("task not active: {0}")]
    TaskNotActive(Uuid),

    /// The task already settled.
    #[error("task already settled: {0}")]
    AlreadySettled(Uuid),
}
