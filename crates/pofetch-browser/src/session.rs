//! Browser session: one browser process, one profile, many tabs.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pofetch_core::{PoTask, WorkerConfig, WorkerErrorKind};

use crate::error::SessionError;
use crate::tab::{Tab, TabStatus};

/// Bounded error history per session.
const ERROR_HISTORY_CAP: usize = 50;

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    /// Browser process launching.
    Starting,
    /// Accepting and processing tasks.
    Active,
    /// The browser process died.
    Crashed,
    /// Shut down; all tabs closed.
    Closed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Starting => write!(f, "starting"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Crashed => write!(f, "crashed"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

/// Last observed resource usage of the session's process.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Resident memory in bytes.
    pub memory_bytes: u64,
    /// CPU usage percent.
    pub cpu_percent: f32,
}

/// One recorded session error.
#[derive(Debug, Clone)]
pub struct SessionErrorRecord {
    /// When the error happened.
    pub at: DateTime<Utc>,
    /// Error category.
    pub kind: WorkerErrorKind,
    /// Error message.
    pub message: String,
}

/// A browser process hosting up to `max_tabs` tabs under one profile.
pub struct BrowserSession {
    /// Unique session ID.
    pub id: Uuid,
    /// The profile this session runs under.
    pub profile_id: Uuid,
    /// Set by the worker when the profile fails integrity checks.
    pub profile_corrupted: bool,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// OS process id of the browser, once launched.
    pub process_id: Option<u32>,
    /// Last resource sample.
    pub resources: ResourceSnapshot,
    tabs: HashMap<Uuid, Tab>,
    max_tabs: usize,
    error_history: VecDeque<SessionErrorRecord>,
    started_at: Instant,
    last_activity: Instant,
}

impl BrowserSession {
    /// Create a session bound to `profile_id`.
    pub fn new(profile_id: Uuid, max_tabs: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            profile_id,
            profile_corrupted: false,
            status: SessionStatus::Starting,
            process_id: None,
            resources: ResourceSnapshot::default(),
            tabs: HashMap::new(),
            max_tabs,
            error_history: VecDeque::new(),
            started_at: Instant::now(),
            last_activity: Instant::now(),
        }
    }

    /// The browser process is up; the session can take work.
    pub fn start(&mut self, process_id: u32) {
        self.process_id = Some(process_id);
        self.status = SessionStatus::Active;
        self.started_at = Instant::now();
        self.last_activity = Instant::now();
        info!("Session {} active (pid {})", self.id, process_id);
    }

    /// Open a new tab.
    pub fn create_tab(&mut self) -> Result<Uuid, SessionError> {
        if self.status != SessionStatus::Active {
            return Err(SessionError::NotActive(self.status.to_string()));
        }
        let open = self
            .tabs
            .values()
            .filter(|t| t.status != TabStatus::Closed)
            .count();
        if open >= self.max_tabs {
            return Err(SessionError::CapacityExceeded {
                max_tabs: self.max_tabs,
            });
        }

        let tab = Tab::new(self.id);
        let id = tab.id;
        self.tabs.insert(id, tab);
        debug!("Session {} opened tab {}", self.id, id);
        Ok(id)
    }

    /// Close a tab. Returns its in-flight task, if any.
    pub fn close_tab(&mut self, tab_id: Uuid) -> Result<Option<PoTask>, SessionError> {
        let tab = self
            .tabs
            .get_mut(&tab_id)
            .ok_or(SessionError::TabNotFound(tab_id))?;
        let orphan = tab.close();
        self.tabs.remove(&tab_id);
        Ok(orphan)
    }

    /// Assign a task to a specific tab, or to any available one.
    /// Opens a tab if none are free and there is capacity.
    pub fn assign_task_to_tab(
        &mut self,
        task: PoTask,
        tab_id: Option<Uuid>,
    ) -> Result<Uuid, SessionError> {
        if self.status != SessionStatus::Active {
            return Err(SessionError::NotActive(self.status.to_string()));
        }

        let target = match tab_id {
            Some(id) => {
                if !self.tabs.contains_key(&id) {
                    return Err(SessionError::TabNotFound(id));
                }
                id
            }
            None => match self.tabs.values().find(|t| t.is_available()).map(|t| t.id) {
                Some(id) => id,
                None => self.create_tab().map_err(|e| match e {
                    SessionError::CapacityExceeded { .. } => SessionError::NoAvailableTab,
                    other => other,
                })?,
            },
        };

        let tab = self
            .tabs
            .get_mut(&target)
            .ok_or(SessionError::TabNotFound(target))?;
        tab.assign(task)?;
        self.last_activity = Instant::now();
        Ok(target)
    }

    /// Complete the task running on `tab_id`.
    pub fn complete_task(
        &mut self,
        tab_id: Uuid,
        success: bool,
    ) -> Result<Option<PoTask>, SessionError> {
        let tab = self
            .tabs
            .get_mut(&tab_id)
            .ok_or(SessionError::TabNotFound(tab_id))?;
        let task = tab.complete(success);
        self.last_activity = Instant::now();
        Ok(task)
    }

    /// Close tabs idle longer than `max_idle`. Never touches processing
    /// tabs. Returns how many were closed.
    pub fn cleanup_idle_tabs(&mut self, max_idle: Duration) -> usize {
        let stale: Vec<Uuid> = self
            .tabs
            .values()
            .filter(|t| t.status != TabStatus::Processing && t.idle_time() > max_idle)
            .map(|t| t.id)
            .collect();

        for id in &stale {
            self.tabs.remove(id);
            debug!("Session {} closed idle tab {}", self.id, id);
        }
        stale.len()
    }

    /// Record an error against the session.
    pub fn record_error(&mut self, kind: WorkerErrorKind, message: impl Into<String>) {
        let message = message.into();
        warn!("Session {} error [{}]: {}", self.id, kind, message);
        if self.error_history.len() >= ERROR_HISTORY_CAP {
            self.error_history.pop_front();
        }
        self.error_history.push_back(SessionErrorRecord {
            at: Utc::now(),
            kind,
            message,
        });
    }

    /// The browser process died. Fails every in-flight task; the caller
    /// re-queues them.
    pub fn mark_crashed(&mut self) -> Vec<PoTask> {
        self.status = SessionStatus::Crashed;
        self.record_error(WorkerErrorKind::Crash, "browser process lost");
        self.tabs.values_mut().filter_map(Tab::crash).collect()
    }

    /// Close the session and all tabs. Returns orphaned in-flight tasks.
    pub fn close(&mut self) -> Vec<PoTask> {
        let orphans: Vec<PoTask> = self.tabs.values_mut().filter_map(Tab::close).collect();
        self.tabs.clear();
        self.status = SessionStatus::Closed;
        info!("Session {} closed", self.id);
        orphans
    }

    /// Whether this session should be torn down and replaced.
    ///
    /// `process_alive` comes from the caller's process probe.
    pub fn should_restart(&self, config: &WorkerConfig, process_alive: bool) -> bool {
        if self.status == SessionStatus::Crashed {
            return true;
        }
        if !process_alive && self.process_id.is_some() {
            return true;
        }
        if self.profile_corrupted {
            return true;
        }
        if self.error_history.len() as u32 >= config.max_errors {
            return true;
        }
        if self.started_at.elapsed() > config.max_uptime() {
            return true;
        }
        if self.processing_count() == 0 && self.last_activity.elapsed() > config.max_idle() {
            return true;
        }
        false
    }

    /// Tabs currently running a task.
    pub fn processing_count(&self) -> usize {
        self.tabs
            .values()
            .filter(|t| t.status == TabStatus::Processing)
            .count()
    }

    /// Tabs that can take a task right now.
    pub fn available_tab_count(&self) -> usize {
        self.tabs.values().filter(|t| t.is_available()).count()
    }

    /// Whether a task could be assigned (free tab or room to open one).
    pub fn has_capacity(&self) -> bool {
        if self.status != SessionStatus::Active {
            return false;
        }
        let open = self
            .tabs
            .values()
            .filter(|t| t.status != TabStatus::Closed)
            .count();
        self.available_tab_count() > 0 || open < self.max_tabs
    }

    /// Open tab count.
    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    /// Recorded errors, oldest first.
    pub fn error_history(&self) -> impl Iterator<Item = &SessionErrorRecord> {
        self.error_history.iter()
    }
}
