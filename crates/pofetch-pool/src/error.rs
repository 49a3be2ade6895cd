//! Pool errors.

use thiserror::Error;

use pofetch_browser::SessionError;
use pofetch_core::ConfigError;
use pofetch_profile::ProfileError;
use pofetch_queue::QueueError;

/// Errors surfaced by the pool to its caller.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Configuration rejected at initialize.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Profile provisioning failed.
    #[error("profile error: {0}")]
    Profile(#[from] ProfileError),

    /// Session/tab operation failed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Queue operation failed.
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// Not a single worker came up.
    #[error("all {count} workers failed to start")]
    AllWorkersFailed { count: u32 },

    /// No worker with that ID.
    #[error("worker not found: {0}")]
    WorkerNotFound(u32),

    /// The worker cannot take tasks right now.
    #[error("worker {0} is not available for tasks")]
    WorkerUnavailable(u32),

    /// Browser launch failed.
    #[error("failed to launch browser for worker {worker_id}: {reason}")]
    LaunchFailed { worker_id: u32, reason: String },

    /// In-place restarts exhausted for a worker.
    #[error("worker {worker_id} restart failed after {attempts} attempts")]
    RestartExhausted { worker_id: u32, attempts: u32 },

    /// The pool is not in a state that accepts this call.
    #[error("pool is not accepting work (status: {status})")]
    NotAccepting { status: String },
}
