//! Purchase-order task definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task priority. Lower values are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskPriority {
    /// Served before everything else (retries land here).
    Urgent = 0,
    /// High priority.
    High = 1,
    /// Default priority.
    Normal = 2,
    /// Background work.
    Low = 3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// Terminal status reported by the automation backend for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatusCode {
    /// All attachments retrieved.
    Completed,
    /// Some attachments retrieved, some failed.
    Partial,
    /// Processing failed.
    Failed,
    /// PO exists but carries no attachments.
    NoAttachments,
    /// PO number not found in the portal.
    PoNotFound,
}

impl std::fmt::Display for TaskStatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatusCode::Completed => write!(f, "COMPLETED"),
            TaskStatusCode::Partial => write!(f, "PARTIAL"),
            TaskStatusCode::Failed => write!(f, "FAILED"),
            TaskStatusCode::NoAttachments => write!(f, "NO_ATTACHMENTS"),
            TaskStatusCode::PoNotFound => write!(f, "PO_NOT_FOUND"),
        }
    }
}

/// One unit of work: fetch the attachments of a single purchase order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoTask {
    /// Unique task ID.
    pub id: Uuid,
    /// Business key: the purchase-order number.
    pub po_number: String,
    /// Opaque payload handed through to the automation backend.
    pub payload: serde_json::Value,
    /// Task priority.
    pub priority: TaskPriority,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Time the task was handed to a worker.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the task settled. Once set, the task is immutable.
    pub completed_at: Option<DateTime<Utc>>,
    /// Number of retry attempts so far.
    pub retry_count: u32,
    /// Maximum retries allowed.
    pub max_retries: u32,
}

impl PoTask {
    /// Create a new task for a PO number.
    pub fn new(po_number: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            po_number: po_number.into(),
            payload: serde_json::Value::Null,
            priority: TaskPriority::Normal,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: 3,
        }
    }

    /// Set task priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the opaque backend payload.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set maximum retries.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Check if the task can be retried.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Check if the task has settled (completed or terminally failed).
    pub fn is_settled(&self) -> bool {
        self.completed_at.is_some()
    }

    /// Record that a worker picked up the task. No-op once settled.
    pub fn mark_started(&mut self) {
        if !self.is_settled() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Record settlement. No-op if already settled.
    pub fn mark_settled(&mut self) {
        if self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }

    /// Bump the retry counter, clamped at `max_retries`.
    pub fn record_retry(&mut self) {
        if self.can_retry() {
            self.retry_count += 1;
            self.started_at = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new() {
        let task = PoTask::new("PO-12345");
        assert_eq!(task.po_number, "PO-12345");
        assert_eq!(task.priority, TaskPriority::Normal);
        assert_eq!(task.retry_count, 0);
        assert!(!task.is_settled());
    }

    #[test]
    fn test_priority_order() {
        assert!(TaskPriority::Urgent < TaskPriority::High);
        assert!(TaskPriority::High < TaskPriority::Normal);
        assert!(TaskPriority::Normal < TaskPriority::Low);
    }

    #[test]
    fn test_can_retry() {
        let mut task = PoTask::new("PO-1").with_max_retries(2);
        assert!(task.can_retry());
        task.record_retry();
        task.record_retry();
        assert_eq!(task.retry_count, 2);
        assert!(!task.can_retry());

        // Clamped at max_retries
        task.record_retry();
        assert_eq!(task.retry_count, 2);
    }

    #[test]
    fn test_settled_is_immutable() {
        let mut task = PoTask::new("PO-1");
        task.mark_settled();
        let settled_at = task.completed_at;

        task.mark_settled();
        task.mark_started();
        assert_eq!(task.completed_at, settled_at);
        assert!(task.started_at.is_none());
    }

    #[test]
    fn test_status_code_display() {
        assert_eq!(TaskStatusCode::Completed.to_string(), "COMPLETED");
        assert_eq!(TaskStatusCode::PoNotFound.to_string(), "PO_NOT_FOUND");
    }
}
