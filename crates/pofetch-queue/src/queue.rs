//! Priority queue with delayed retries and bounded archives.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use pofetch_core::{PoTask, TaskPriority};

use crate::error::QueueError;
use crate::sink::TaskSink;

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum queued tasks before submissions are rejected.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Delay before a failed task becomes eligible for retry (seconds).
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Cap on the completed and failed archives.
    #[serde(default = "default_max_archive_size")]
    pub max_archive_size: usize,
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_retry_delay() -> u64 {
    5
}

fn default_max_archive_size() -> usize {
    1000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            retry_delay_secs: default_retry_delay(),
            max_archive_size: default_max_archive_size(),
        }
    }
}

impl QueueConfig {
    fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Where a completed call left the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    /// Archived as completed.
    Completed,
    /// Scheduled for a delayed retry.
    RetryScheduled,
    /// Archived as terminally failed.
    FailedTerminal,
}

/// A terminally failed task plus the recorded reason.
#[derive(Debug, Clone)]
pub struct FailedTask {
    /// The settled task.
    pub task: PoTask,
    /// Why it failed.
    pub reason: String,
}

/// Queue counters and wait metrics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks waiting in the priority heap.
    pub pending: usize,
    /// Tasks currently assigned to workers.
    pub active: usize,
    /// Tasks waiting out their retry delay.
    pub retry_pending: usize,
    /// Archived completions.
    pub completed: usize,
    /// Archived terminal failures.
    pub failed: usize,
    /// Everything ever submitted.
    pub total_submitted: u64,
    /// Mean time tasks spent queued before dispatch (milliseconds).
    pub avg_wait_ms: f64,
}

/// Heap entry: lower priority value wins, FIFO within a priority.
struct QueuedTask {
    task: PoTask,
    seq: u64,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.task.id == other.task.id
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: reverse so the smallest
        // (priority, seq) pair surfaces first.
        other
            .task
            .priority
            .cmp(&self.task.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct ActiveEntry {
    task: PoTask,
    worker_id: u32,
}

struct RetryEntry {
    task: PoTask,
    ready_at: Instant,
}

struct QueueInner {
    heap: BinaryHeap<QueuedTask>,
    enqueued_at: HashMap<Uuid, Instant>,
    active: HashMap<Uuid, ActiveEntry>,
    retry_pending: Vec<RetryEntry>,
    completed: VecDeque<PoTask>,
    failed: VecDeque<FailedTask>,
    seq: u64,
    total_submitted: u64,
    wait_total: Duration,
    wait_samples: u64,
}

/// Priority+retry queue shared between the pool and its workers.
pub struct TaskQueue {
    config: QueueConfig,
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    /// Create an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                enqueued_at: HashMap::new(),
                active: HashMap::new(),
                retry_pending: Vec::new(),
                completed: VecDeque::new(),
                failed: VecDeque::new(),
                seq: 0,
                total_submitted: 0,
                wait_total: Duration::ZERO,
                wait_samples: 0,
            }),
        }
    }

    /// Enqueue one task. Rejects at capacity.
    pub async fn add_task(&self, task: PoTask) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().await;
        if inner.heap.len() >= self.config.max_queue_size {
            return Err(QueueError::QueueFull {
                capacity: self.config.max_queue_size,
            });
        }
        debug!("Enqueueing task {} ({})", task.id, task.po_number);
        inner.total_submitted += 1;
        Self::push(&mut inner, task);
        Ok(())
    }

    /// Enqueue a batch. Returns how many were accepted; stops at the
    /// first capacity rejection.
    pub async fn add_tasks(&self, tasks: Vec<PoTask>) -> usize {
        let mut inner = self.inner.lock().await;
        let mut accepted = 0;
        for task in tasks {
            if inner.heap.len() >= self.config.max_queue_size {
                warn!("Queue full, rejecting remainder of batch");
                break;
            }
            inner.total_submitted += 1;
            Self::push(&mut inner, task);
            accepted += 1;
        }
        accepted
    }

    /// Dequeue the most urgent task and mark it active for `worker_id`.
    pub async fn get_next_task(&self, worker_id: u32) -> Option<PoTask> {
        let mut inner = self.inner.lock().await;
        let entry = inner.heap.pop()?;
        let task = entry.task;

        if let Some(queued) = inner.enqueued_at.remove(&task.id) {
            let wait = queued.elapsed();
            inner.wait_total += wait;
            inner.wait_samples += 1;
        }

        debug!("Task {} dispatched to worker {}", task.id, worker_id);
        inner.active.insert(
            task.id,
            ActiveEntry {
                task: task.clone(),
                worker_id,
            },
        );
        Some(task)
    }

    /// Settle an active task on behalf of `worker_id`.
    ///
    /// The settlement is rejected if the task is no longer active or
    /// has been reclaimed and reassigned to a different worker, so a
    /// stale completion can never settle a redistributed task.
    ///
    /// Success archives it. Failure schedules a delayed retry at
    /// elevated priority while retries remain, otherwise archives it
    /// as terminally failed with `reason`.
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        worker_id: u32,
        success: bool,
        duration: Duration,
        reason: &str,
    ) -> Result<TaskDisposition, QueueError> {
        let mut inner = self.inner.lock().await;
        match inner.active.get(&task_id) {
            Some(entry) if entry.worker_id == worker_id => {}
            _ => return Err(QueueError::TaskNotActive(task_id)),
        }
        let entry = inner
            .active
            .remove(&task_id)
            .ok_or(QueueError::TaskNotActive(task_id))?;
        let mut task = entry.task;

        if success {
            task.mark_settled();
            debug!(
                "Task {} completed by worker {} in {:?}",
                task_id, entry.worker_id, duration
            );
            Self::archive_completed(&mut inner, self.config.max_archive_size, task);
            return Ok(TaskDisposition::Completed);
        }

        if task.can_retry() {
            task.record_retry();
            task.priority = TaskPriority::Urgent;
            let ready_at = Instant::now() + self.config.retry_delay();
            info!(
                "Task {} failed ({}), retry {}/{} scheduled",
                task_id, reason, task.retry_count, task.max_retries
            );
            inner.retry_pending.push(RetryEntry { task, ready_at });
            return Ok(TaskDisposition::RetryScheduled);
        }

        task.mark_settled();
        warn!("Task {} terminally failed: {}", task_id, reason);
        Self::archive_failed(&mut inner, self.config.max_archive_size, task, reason);
        Ok(TaskDisposition::FailedTerminal)
    }

    /// Move a never-dispatched or reclaimed task straight to the
    /// failed archive. Used when no worker can take it.
    pub async fn fail_task(&self, mut task: PoTask, reason: &str) {
        let mut inner = self.inner.lock().await;
        inner.active.remove(&task.id);
        task.mark_settled();
        warn!("Task {} failed without retry: {}", task.id, reason);
        Self::archive_failed(&mut inner, self.config.max_archive_size, task, reason);
    }

    /// Force-fail every task still marked active, regardless of
    /// retries left. Used at the shutdown deadline. Returns the
    /// settled task ids.
    pub async fn fail_active(&self, reason: &str) -> Vec<Uuid> {
        let mut inner = self.inner.lock().await;
        let ids: Vec<Uuid> = inner.active.keys().copied().collect();
        for id in &ids {
            if let Some(entry) = inner.active.remove(id) {
                let mut task = entry.task;
                task.mark_settled();
                Self::archive_failed(&mut inner, self.config.max_archive_size, task, reason);
            }
        }
        if !ids.is_empty() {
            warn!("Force-failed {} active tasks: {}", ids.len(), reason);
        }
        ids
    }

    /// Move every queued and retry-pending task to the failed archive.
    /// Used when no healthy worker remains. Returns the settled task
    /// ids.
    pub async fn fail_all_pending(&self, reason: &str) -> Vec<Uuid> {
        let mut inner = self.inner.lock().await;
        let mut ids = Vec::new();
        while let Some(entry) = inner.heap.pop() {
            let mut task = entry.task;
            inner.enqueued_at.remove(&task.id);
            task.mark_settled();
            ids.push(task.id);
            Self::archive_failed(&mut inner, self.config.max_archive_size, task, reason);
        }
        let retries: Vec<RetryEntry> = inner.retry_pending.drain(..).collect();
        for entry in retries {
            let mut task = entry.task;
            task.mark_settled();
            ids.push(task.id);
            Self::archive_failed(&mut inner, self.config.max_archive_size, task, reason);
        }
        if !ids.is_empty() {
            warn!("Failed {} undispatched tasks: {}", ids.len(), reason);
        }
        ids
    }

    /// Re-enqueue retries whose delay has elapsed. Returns how many
    /// re-entered the queue. Retries bypass the capacity check so they
    /// are never dropped.
    pub async fn sweep_retries(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let mut due = Vec::new();
        let mut remaining = Vec::new();
        for entry in inner.retry_pending.drain(..) {
            if entry.ready_at <= now {
                due.push(entry.task);
            } else {
                remaining.push(entry);
            }
        }
        inner.retry_pending = remaining;

        let count = due.len();
        for task in due {
            Self::push(&mut inner, task);
        }
        if count > 0 {
            debug!("Re-enqueued {} retries", count);
        }
        count
    }

    /// Reclaim every task still marked active for a dead worker.
    ///
    /// Tasks with retries left re-enter the queue immediately at
    /// elevated priority; exhausted tasks are archived as failed.
    /// Returns the requeued count and the ids of the tasks that were
    /// terminally failed.
    pub async fn unregister_worker(&self, worker_id: u32) -> (usize, Vec<Uuid>) {
        let mut inner = self.inner.lock().await;
        let orphaned: Vec<Uuid> = inner
            .active
            .iter()
            .filter(|(_, e)| e.worker_id == worker_id)
            .map(|(id, _)| *id)
            .collect();

        let mut requeued = 0;
        let mut failed = Vec::new();
        for task_id in orphaned {
            let entry = match inner.active.remove(&task_id) {
                Some(e) => e,
                None => continue,
            };
            let mut task = entry.task;
            if task.can_retry() {
                task.record_retry();
                task.priority = TaskPriority::Urgent;
                Self::push(&mut inner, task);
                requeued += 1;
            } else {
                task.mark_settled();
                failed.push(task.id);
                Self::archive_failed(
                    &mut inner,
                    self.config.max_archive_size,
                    task,
                    &format!("worker {worker_id} lost and retries exhausted"),
                );
            }
        }

        if requeued + failed.len() > 0 {
            info!(
                "Reclaimed {} tasks from worker {} ({} requeued, {} failed)",
                requeued + failed.len(),
                worker_id,
                requeued,
                failed.len()
            );
        }
        (requeued, failed)
    }

    /// Assign queued tasks to available sinks, least-loaded first.
    /// Availability is rechecked after every assignment. Returns the
    /// `(sink_id, task)` pairs actually assigned.
    pub async fn distribute_tasks(&self, sinks: &mut [&mut dyn TaskSink]) -> Vec<(u32, PoTask)> {
        let mut assigned = Vec::new();

        loop {
            let target = sinks
                .iter_mut()
                .filter(|s| s.is_available())
                .min_by_key(|s| s.load());
            let Some(sink) = target else { break };
            let sink_id = sink.sink_id();

            let Some(task) = self.get_next_task(sink_id).await else {
                break;
            };

            match sink.try_assign(task.clone()) {
                Ok(()) => assigned.push((sink_id, task)),
                Err(returned) => {
                    // Sink refused after claiming availability; put the
                    // task back and stop trusting this pass.
                    let mut inner = self.inner.lock().await;
                    inner.active.remove(&returned.id);
                    Self::push(&mut inner, returned);
                    break;
                }
            }
        }

        assigned
    }

    /// Trim archives to the configured bound.
    pub async fn trim_archives(&self) {
        let mut inner = self.inner.lock().await;
        while inner.completed.len() > self.config.max_archive_size {
            inner.completed.pop_front();
        }
        while inner.failed.len() > self.config.max_archive_size {
            inner.failed.pop_front();
        }
    }

    /// Current counters.
    pub async fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().await;
        let avg_wait_ms = if inner.wait_samples > 0 {
            inner.wait_total.as_secs_f64() * 1000.0 / inner.wait_samples as f64
        } else {
            0.0
        };
        QueueStats {
            pending: inner.heap.len(),
            active: inner.active.len(),
            retry_pending: inner.retry_pending.len(),
            completed: inner.completed.len(),
            failed: inner.failed.len(),
            total_submitted: inner.total_submitted,
            avg_wait_ms,
        }
    }

    /// Tasks not yet settled (queued, active, or awaiting retry).
    pub async fn outstanding(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.heap.len() + inner.active.len() + inner.retry_pending.len()
    }

    /// Number of tasks currently assigned to workers.
    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    /// Snapshot of the failed archive.
    pub async fn failed_tasks(&self) -> Vec<FailedTask> {
        self.inner.lock().await.failed.iter().cloned().collect()
    }

    /// Snapshot of the completed archive.
    pub async fn completed_tasks(&self) -> Vec<PoTask> {
        self.inner.lock().await.completed.iter().cloned().collect()
    }

    fn push(inner: &mut QueueInner, task: PoTask) {
        inner.seq += 1;
        let seq = inner.seq;
        inner.enqueued_at.insert(task.id, Instant::now());
        inner.heap.push(QueuedTask { task, seq });
    }

    fn archive_completed(inner: &mut QueueInner, cap: usize, task: PoTask) {
        if inner.completed.len() >= cap {
            inner.completed.pop_front();
        }
        inner.completed.push_back(task);
    }

    fn archive_failed(inner: &mut QueueInner, cap: usize, task: PoTask, reason: &str) {
        if inner.failed.len() >= cap {
            inner.failed.pop_front();
        }
        inner.failed.push_back(FailedTask {
            task,
            reason: reason.to_string(),
        });
    }
}
