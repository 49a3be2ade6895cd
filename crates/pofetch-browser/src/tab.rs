//! Single page-processing slot within a session.

use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use pofetch_core::PoTask;

use crate::error::SessionError;

/// Tab lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabStatus {
    /// Idle and ready for a task.
    Ready,
    /// Running exactly one task.
    Processing,
    /// Last task errored; tab still usable.
    Error,
    /// The tab died and cannot be reused.
    Crashed,
    /// Closed by the session.
    Closed,
}

/// A single page-processing unit. Runs one task at a time.
///
/// Invariant: `current_task` is `Some` exactly when status is
/// `Processing`.
#[derive(Debug)]
pub struct Tab {
    /// Unique tab ID.
    pub id: Uuid,
    /// Owning session.
    pub session_id: Uuid,
    /// Lifecycle status.
    pub status: TabStatus,
    /// The task being processed, if any.
    pub current_task: Option<PoTask>,
    /// Tasks completed successfully on this tab.
    pub completed_tasks: Vec<Uuid>,
    /// Tasks that failed on this tab.
    pub failed_tasks: Vec<Uuid>,
    /// Total errors observed.
    pub error_count: u32,
    /// Errors since the last success.
    pub consecutive_errors: u32,
    /// Cumulative processing time.
    pub total_processing: Duration,
    /// Last state change.
    pub last_activity: Instant,
    processing_since: Option<Instant>,
}

impl Tab {
    /// Create a fresh tab owned by `session_id`.
    pub fn new(session_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            status: TabStatus::Ready,
            current_task: None,
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            error_count: 0,
            consecutive_errors: 0,
            total_processing: Duration::ZERO,
            last_activity: Instant::now(),
            processing_since: None,
        }
    }

    /// Whether the tab can accept a task.
    pub fn is_available(&self) -> bool {
        matches!(self.status, TabStatus::Ready | TabStatus::Error)
    }

    /// Start processing a task.
    pub fn assign(&mut self, mut task: PoTask) -> Result<(), SessionError> {
        if self.current_task.is_some() {
            return Err(SessionError::TabBusy(self.id));
        }
        if !self.is_available() {
            return Err(SessionError::TabBusy(self.id));
        }

        task.mark_started();
        debug!("Tab {} processing task {}", self.id, task.id);
        self.current_task = Some(task);
        self.status = TabStatus::Processing;
        self.processing_since = Some(Instant::now());
        self.last_activity = Instant::now();
        Ok(())
    }

    /// Finish the current task, returning it to the caller.
    pub fn complete(&mut self, success: bool) -> Option<PoTask> {
        let task = self.current_task.take()?;

        if let Some(since) = self.processing_since.take() {
            self.total_processing += since.elapsed();
        }

        if success {
            self.completed_tasks.push(task.id);
            self.consecutive_errors = 0;
            self.status = TabStatus::Ready;
        } else {
            self.failed_tasks.push(task.id);
            self.error_count += 1;
            self.consecutive_errors += 1;
            self.status = TabStatus::Error;
        }
        self.last_activity = Instant::now();
        Some(task)
    }

    /// The tab died. Auto-fails the current task, which is returned so
    /// the session can hand it back for retry.
    pub fn crash(&mut self) -> Option<PoTask> {
        self.status = TabStatus::Crashed;
        self.error_count += 1;
        self.consecutive_errors += 1;
        self.last_activity = Instant::now();

        let task = self.current_task.take();
        if let Some(ref t) = task {
            self.failed_tasks.push(t.id);
        }
        self.processing_since = None;
        task
    }

    /// Close the tab. Returns the in-flight task, if any.
    pub fn close(&mut self) -> Option<PoTask> {
        let task = self.current_task.take();
        if let Some(ref t) = task {
            self.failed_tasks.push(t.id);
        }
        self.status = TabStatus::Closed;
        self.processing_since = None;
        task
    }

    /// How long the tab has been idle.
    pub fn idle_time(&self) -> Duration {
        if self.status == TabStatus::Processing {
            return Duration::ZERO;
        }
        self.last_activity.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tab() -> Tab {
        Tab::new(Uuid::new_v4())
    }

    #[test]
    fn test_assign_complete_roundtrip() {
        let mut tab = tab();
        let task = PoTask::new("PO-1");
        let task_id = task.id;

        tab.assign(task).unwrap();
        assert_eq!(tab.status, TabStatus::Processing);
        assert!(tab.current_task.is_some());
        assert!(!tab.is_available());

        let done = tab.complete(true).unwrap();
        assert_eq!(done.id, task_id);
        assert_eq!(tab.status, TabStatus::Ready);
        assert!(tab.current_task.is_none());
        assert_eq!(tab.completed_tasks, vec![task_id]);
    }

    #[test]
    fn test_double_assign_rejected() {
        let mut tab = tab();
        tab.assign(PoTask::new("PO-1")).unwrap();
        assert!(matches!(
            tab.assign(PoTask::new("PO-2")),
            Err(SessionError::TabBusy(_))
        ));
    }

    #[test]
    fn test_failure_sets_error_state() {
        let mut tab = tab();
        tab.assign(PoTask::new("PO-1")).unwrap();
        tab.complete(false);

        assert_eq!(tab.status, TabStatus::Error);
        assert_eq!(tab.error_count, 1);
        assert_eq!(tab.consecutive_errors, 1);
        // Error tabs remain usable.
        assert!(tab.is_available());
    }

    #[test]
    fn test_crash_fails_current_task() {
        let mut tab = tab();
        let task = PoTask::new("PO-1");
        let task_id = task.id;
        tab.assign(task).unwrap();

        let failed = tab.crash().unwrap();
        assert_eq!(failed.id, task_id);
        assert_eq!(tab.status, TabStatus::Crashed);
        assert!(tab.failed_tasks.contains(&task_id));
        assert!(!tab.is_available());
    }

    #[test]
    fn test_processing_tab_reports_zero_idle() {
        let mut tab = tab();
        tab.assign(PoTask::new("PO-1")).unwrap();
        assert_eq!(tab.idle_time(), Duration::ZERO);
    }
}
