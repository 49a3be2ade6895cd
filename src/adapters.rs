//! Concrete implementations of the pool's boundary traits for the CLI:
//! process-based browser launching, a stand-in page driver, and a
//! JSON-lines settlement writer.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::process::{Child, Command};
use uuid::Uuid;

use pofetch_core::{
    AutomationBackend, BrowserLauncher, PoTask, ProcessOutcome, SettlementHook, TaskError,
    TaskStatusCode,
};

/// Launches a real browser binary per worker, one process per profile
/// directory.
pub(crate) struct CommandLauncher {
    command: String,
    args: Vec<String>,
    children: Mutex<HashMap<u32, Child>>,
}

impl CommandLauncher {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            children: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl BrowserLauncher for CommandLauncher {
    async fn launch(
        &self,
        worker_id: u32,
        profile_path: &Path,
        headless: bool,
    ) -> Result<u32, TaskError> {
        let mut cmd = Command::new(&self.command);
        cmd.arg(format!("--user-data-dir={}", profile_path.display()));
        if headless {
            cmd.arg("--headless=new");
        }
        cmd.args(&self.args);
        cmd.kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| TaskError::Other(format!("spawning {}: {e}", self.command)))?;
        let pid = child
            .id()
            .ok_or_else(|| TaskError::Crash("browser exited before pid was read".into()))?;

        tracing::info!(worker_id, pid, "launched browser process");
        let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        children.insert(pid, child);
        Ok(pid)
    }

    async fn terminate(&self, pid: u32) {
        let child = {
            let mut children = self.children.lock().unwrap_or_else(|e| e.into_inner());
            children.remove(&pid)
        };
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                tracing::warn!(pid, error = %e, "failed to kill browser process");
            }
            let _ = child.wait().await;
        }
    }
}

/// Hands out synthetic pids without spawning anything. Used when no
/// browser command is configured, so the pipeline can run end to end
/// against the stand-in driver.
pub(crate) struct NullLauncher {
    next_pid: std::sync::atomic::AtomicU32,
}

impl NullLauncher {
    pub fn new() -> Self {
        Self {
            next_pid: std::sync::atomic::AtomicU32::new(100_000),
        }
    }
}

#[async_trait]
impl BrowserLauncher for NullLauncher {
    async fn launch(
        &self,
        worker_id: u32,
        _profile_path: &Path,
        _headless: bool,
    ) -> Result<u32, TaskError> {
        let pid = self
            .next_pid
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tracing::debug!(worker_id, pid, "assigned synthetic session pid");
        Ok(pid)
    }

    async fn terminate(&self, _pid: u32) {}
}

/// Stand-in page driver: settles every PO without touching a portal.
/// A real deployment swaps this for a driver that logs in, searches
/// the PO, and pulls its attachments.
pub(crate) struct StandInDriver;

#[async_trait]
impl AutomationBackend for StandInDriver {
    async fn process(&self, worker_id: u32, task: &PoTask) -> Result<ProcessOutcome, TaskError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracing::info!(worker_id, po_number = %task.po_number, "processed (stand-in driver)");
        Ok(ProcessOutcome::completed(0, 0))
    }
}

/// Appends one JSON line per settled task to a results file.
pub(crate) struct JsonlSettlement {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl JsonlSettlement {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl SettlementHook for JsonlSettlement {
    async fn on_task_settled(
        &self,
        task_id: Uuid,
        status: TaskStatusCode,
        message: &str,
        worker_id: Option<u32>,
    ) {
        let line = json!({
            "task_id": task_id,
            "status": status.to_string(),
            "message": message,
            "worker_id": worker_id,
            "settled_at": Utc::now().to_rfc3339(),
        });
        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = writeln!(file, "{line}") {
            tracing::error!(path = %self.path.display(), error = %e, "failed to write result line");
        }
    }
}
