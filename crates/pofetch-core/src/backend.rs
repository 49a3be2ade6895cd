//! Boundary traits: browser automation and status persistence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;
use crate::task::{PoTask, TaskStatusCode};

/// Result of processing one task inside a tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessOutcome {
    /// Overall success flag.
    pub success: bool,
    /// Attachments discovered on the PO page.
    pub attachments_found: u32,
    /// Attachments actually downloaded.
    pub attachments_downloaded: u32,
    /// Human-readable summary.
    pub message: String,
    /// Individual errors encountered along the way.
    pub errors: Vec<String>,
    /// Terminal status for the task.
    pub status_code: TaskStatusCode,
}

impl ProcessOutcome {
    /// A fully successful outcome.
    pub fn completed(found: u32, downloaded: u32) -> Self {
        Self {
            success: true,
            attachments_found: found,
            attachments_downloaded: downloaded,
            message: format!("downloaded {downloaded}/{found} attachments"),
            errors: Vec::new(),
            status_code: TaskStatusCode::Completed,
        }
    }

    /// A failed outcome with a reason.
    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            success: false,
            attachments_found: 0,
            attachments_downloaded: 0,
            errors: vec![message.clone()],
            message,
            status_code: TaskStatusCode::Failed,
        }
    }
}

/// The browser-automation seam. One call drives one task to completion
/// inside a tab of the given worker's session.
///
/// Implementations live outside this workspace's scope; tests use
/// hand-rolled doubles.
#[async_trait]
pub trait AutomationBackend: Send + Sync {
    /// Process a task inside the given worker's browser session.
    async fn process(&self, worker_id: u32, task: &PoTask) -> Result<ProcessOutcome, TaskError>;
}

/// Launches and terminates browser processes for worker sessions.
///
/// Separated from [`AutomationBackend`] so the pool can relaunch a
/// crashed browser without touching page-driving logic.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Launch a browser over the given profile directory. Returns the
    /// OS process id.
    async fn launch(
        &self,
        worker_id: u32,
        profile_path: &std::path::Path,
        headless: bool,
    ) -> Result<u32, TaskError>;

    /// Terminate a browser process. Best-effort.
    async fn terminate(&self, pid: u32);
}

/// The status-persistence seam. Fired after every settlement: success,
/// terminal failure, or retry exhaustion.
#[async_trait]
pub trait SettlementHook: Send + Sync {
    /// A task settled with the given status.
    async fn on_task_settled(
        &self,
        task_id: Uuid,
        status: TaskStatusCode,
        message: &str,
        worker_id: Option<u32>,
    );
}
