//! Status reports exposed by `get_status`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-worker slice of a status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusReport {
    /// Worker ID.
    pub id: u32,
    /// Lifecycle status name.
    pub status: String,
    /// Browser process id, if up.
    pub process_id: Option<u32>,
    /// Last sampled resident memory (bytes).
    pub memory_bytes: u64,
    /// In-flight task count.
    pub current_task_count: usize,
    /// Tasks processed successfully.
    pub processed_count: u64,
    /// Failed attempts.
    pub failed_count: u64,
    /// Errors since last restart.
    pub error_count: u32,
    /// Completed restarts.
    pub restart_count: u32,
    /// Whether it can take a task right now.
    pub available: bool,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatusReport {
    /// Pool instance ID.
    pub pool_id: Uuid,
    /// Pool status name.
    pub status: String,
    /// Per-worker details.
    pub workers: Vec<WorkerStatusReport>,
    /// Tasks queued or awaiting retry.
    pub pending_tasks: usize,
    /// Tasks currently on workers.
    pub active_tasks: usize,
    /// Archived completions.
    pub completed_tasks: usize,
    /// Archived terminal failures.
    pub failed_tasks: usize,
    /// Everything ever submitted.
    pub total_submitted: u64,
    /// System memory usage fraction at last sample.
    pub system_memory_fraction: f64,
    /// Mean queue wait (milliseconds).
    pub avg_queue_wait_ms: f64,
    /// Profile corruption rate (`corrupted / created`).
    pub profile_corruption_rate: f64,
    /// Worker restarts completed in the last five minutes.
    pub restarts_last_5m: usize,
    /// Recent pool-level errors, oldest first.
    pub recent_errors: Vec<String>,
}
