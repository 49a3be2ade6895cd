//! One worker: one profile, one browser session, pulled tasks.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use pofetch_browser::{BrowserSession, SessionStatus};
use pofetch_core::{PoTask, WorkerConfig, WorkerErrorKind};
use pofetch_profile::Profile;
use pofetch_queue::TaskSink;

use crate::error::PoolError;

/// Bounded error log per worker.
const ERROR_LOG_CAP: usize = 50;

/// Worker lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WorkerStatus {
    /// Instantiated, no session yet.
    Created,
    /// Browser launching.
    Starting,
    /// Session up, no tasks yet.
    Ready,
    /// At least one task in flight.
    Processing,
    /// Session up, between tasks.
    Idle,
    /// Last operation errored.
    Error,
    /// Browser process lost.
    Crashed,
    /// Mid-restart.
    Restarting,
    /// Stopped; session and profile released.
    Stopped,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Created => "created",
            WorkerStatus::Starting => "starting",
            WorkerStatus::Ready => "ready",
            WorkerStatus::Processing => "processing",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Error => "error",
            WorkerStatus::Crashed => "crashed",
            WorkerStatus::Restarting => "restarting",
            WorkerStatus::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// One recorded worker error.
#[derive(Debug, Clone)]
pub struct WorkerErrorRecord {
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Category.
    pub kind: WorkerErrorKind,
    /// Message.
    pub message: String,
}

/// A long-lived worker owning at most one profile and one session.
pub struct Worker {
    /// Stable worker ID. Unchanged across restarts.
    pub id: u32,
    config: WorkerConfig,
    /// Lifecycle status.
    pub status: WorkerStatus,
    profile: Option<Profile>,
    profile_corrupted: bool,
    session: Option<BrowserSession>,
    active_tasks: HashMap<Uuid, PoTask>,
    task_tabs: HashMap<Uuid, Uuid>,
    error_log: VecDeque<WorkerErrorRecord>,
    /// Errors recorded since the last restart.
    pub error_count: u32,
    /// Completed restarts.
    pub restart_count: u32,
    /// Successfully processed tasks.
    pub processed_count: u64,
    /// Failed task attempts.
    pub failed_count: u64,
    total_task_time: Duration,
    last_activity: Instant,
}

impl Worker {
    /// Create a worker. It cannot take tasks until a profile is
    /// attached and `start` is called.
    pub fn new(id: u32, config: WorkerConfig) -> Self {
        Self {
            id,
            config,
            status: WorkerStatus::Created,
            profile: None,
            profile_corrupted: false,
            session: None,
            active_tasks: HashMap::new(),
            task_tabs: HashMap::new(),
            error_log: VecDeque::new(),
            error_count: 0,
            restart_count: 0,
            processed_count: 0,
            failed_count: 0,
            total_task_time: Duration::ZERO,
            last_activity: Instant::now(),
        }
    }

    /// Give the worker its profile. Replaces any previous one; the
    /// caller is responsible for returning the old profile.
    pub fn attach_profile(&mut self, profile: Profile) {
        self.profile_corrupted = false;
        self.profile = Some(profile);
    }

    /// The attached profile, if any.
    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    /// Whether the worker's profile has been flagged corrupted.
    pub fn profile_corrupted(&self) -> bool {
        self.profile_corrupted
    }

    /// Flag the profile as corrupted. Drives `should_restart` and
    /// profile replacement on the next restart.
    pub fn mark_profile_corrupted(&mut self) {
        self.profile_corrupted = true;
        if let Some(session) = self.session.as_mut() {
            session.profile_corrupted = true;
        }
    }

    /// Bring the worker up over a launched browser process.
    pub fn start(&mut self, process_id: u32) -> Result<(), PoolError> {
        let profile = self
            .profile
            .as_ref()
            .ok_or(PoolError::WorkerUnavailable(self.id))?;

        self.status = WorkerStatus::Starting;
        let mut session = BrowserSession::new(profile.id, self.config.max_tabs);
        session.start(process_id);
        self.session = Some(session);
        self.status = WorkerStatus::Ready;
        self.error_count = 0;
        self.last_activity = Instant::now();
        info!("Worker {} ready (pid {})", self.id, process_id);
        Ok(())
    }

    /// The browser process id, if the session is up.
    pub fn process_id(&self) -> Option<u32> {
        self.session.as_ref().and_then(|s| s.process_id)
    }

    /// Whether the worker can accept a task: active status, active
    /// session, and at least one free tab slot.
    pub fn is_available_for_tasks(&self) -> bool {
        let status_ok = matches!(
            self.status,
            WorkerStatus::Ready | WorkerStatus::Idle | WorkerStatus::Processing
        );
        status_ok
            && self
                .session
                .as_ref()
                .map(|s| s.status == SessionStatus::Active && s.has_capacity())
                .unwrap_or(false)
    }

    /// Assign a task to a tab in this worker's session.
    pub fn assign_task(&mut self, task: PoTask) -> Result<(), PoolError> {
        self.try_assign(task)
            .map_err(|_| PoolError::WorkerUnavailable(self.id))
    }

    /// Settle an in-flight task. Returns the task.
    pub fn complete_task(
        &mut self,
        task_id: Uuid,
        success: bool,
        duration: Duration,
    ) -> Result<PoTask, PoolError> {
        let tab_id = self
            .task_tabs
            .remove(&task_id)
            .ok_or(PoolError::WorkerUnavailable(self.id))?;
        let task = self.active_tasks.remove(&task_id);

        if let Some(session) = self.session.as_mut() {
            let _ = session.complete_task(tab_id, success)?;
        }

        if success {
            self.processed_count += 1;
        } else {
            self.failed_count += 1;
        }
        self.total_task_time += duration;
        self.last_activity = Instant::now();

        if self.active_tasks.is_empty() && self.status == WorkerStatus::Processing {
            self.status = WorkerStatus::Idle;
        }

        task.ok_or(PoolError::WorkerUnavailable(self.id))
    }

    /// Record an error against the worker and its session. The worker
    /// only flips to `Error` once the error budget is spent; isolated
    /// task failures do not take it down.
    pub fn record_error(&mut self, kind: WorkerErrorKind, message: impl Into<String>) {
        let message = message.into();
        warn!("Worker {} error [{}]: {}", self.id, kind, message);
        if self.error_log.len() >= ERROR_LOG_CAP {
            self.error_log.pop_front();
        }
        self.error_log.push_back(WorkerErrorRecord {
            at: Utc::now(),
            kind,
            message: message.clone(),
        });
        self.error_count += 1;
        if let Some(session) = self.session.as_mut() {
            session.record_error(kind, message);
        }
        if self.error_count >= self.config.max_errors {
            self.status = WorkerStatus::Error;
        }
    }

    /// Close session tabs idle past the configured ceiling.
    pub fn cleanup_idle_tabs(&mut self) -> usize {
        let max_idle = self.config.max_idle();
        self.session
            .as_mut()
            .map(|s| s.cleanup_idle_tabs(max_idle))
            .unwrap_or(0)
    }

    /// The browser died. Fails every in-flight task; returns them.
    pub fn mark_crashed(&mut self) -> Vec<PoTask> {
        self.status = WorkerStatus::Crashed;
        let mut orphans = Vec::new();
        if let Some(session) = self.session.as_mut() {
            orphans = session.mark_crashed();
        }
        self.active_tasks.clear();
        self.task_tabs.clear();
        orphans
    }

    /// Whether the supervisor should restart this worker.
    ///
    /// `process_alive` and `memory_bytes` come from the process probe.
    pub fn should_restart(&self, process_alive: bool, memory_bytes: u64) -> bool {
        if matches!(self.status, WorkerStatus::Error | WorkerStatus::Crashed) {
            return true;
        }
        if matches!(
            self.status,
            WorkerStatus::Created | WorkerStatus::Starting | WorkerStatus::Restarting | WorkerStatus::Stopped
        ) {
            return false;
        }
        if self.process_id().is_some() && !process_alive {
            return true;
        }
        if self.error_count >= self.config.max_errors {
            return true;
        }
        if memory_bytes > self.config.memory_limit_bytes {
            return true;
        }
        if self.profile_corrupted {
            return true;
        }
        if self.active_tasks.is_empty() && self.last_activity.elapsed() > self.config.max_idle() {
            return true;
        }
        if let Some(session) = self.session.as_ref() {
            if session.should_restart(&self.config, process_alive) {
                return true;
            }
        }
        false
    }

    /// Begin a restart: bump the counter and mark the status.
    pub fn begin_restart(&mut self) {
        self.restart_count += 1;
        self.status = WorkerStatus::Restarting;
    }

    /// Stop the worker: fail in-flight tasks, release the session and
    /// profile. Returns `(orphaned tasks, profile, old pid)`.
    pub fn stop(&mut self) -> (Vec<PoTask>, Option<Profile>, Option<u32>) {
        let pid = self.process_id();
        let mut orphans: Vec<PoTask> = self.active_tasks.drain().map(|(_, t)| t).collect();
        self.task_tabs.clear();

        if let Some(mut session) = self.session.take() {
            // Session-side copies of the same tasks; keep the worker's.
            let _ = session.close();
        }
        orphans.sort_by_key(|t| t.created_at);

        let profile = self.profile.take();
        self.status = WorkerStatus::Stopped;
        info!("Worker {} stopped", self.id);
        (orphans, profile, pid)
    }

    /// In-flight task count.
    pub fn active_task_count(&self) -> usize {
        self.active_tasks.len()
    }

    /// Mean task duration over everything this worker has settled.
    pub fn avg_task_time(&self) -> Duration {
        let settled = self.processed_count + self.failed_count;
        if settled == 0 {
            return Duration::ZERO;
        }
        self.total_task_time / settled as u32
    }

    /// Recorded errors, oldest first.
    pub fn error_log(&self) -> impl Iterator<Item = &WorkerErrorRecord> {
        self.error_log.iter()
    }

    /// Worker configuration.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }
}

impl TaskSink for Worker {
    fn sink_id(&self) -> u32 {
        self.id
    }

    fn is_available(&self) -> bool {
        self.is_available_for_tasks()
    }

    fn load(&self) -> usize {
        self.active_tasks.len()
    }

    fn try_assign(&mut self, task: PoTask) -> Result<(), PoTask> {
        if !self.is_available_for_tasks() {
            return Err(task);
        }
        let Some(session) = self.session.as_mut() else {
            return Err(task);
        };

        match session.assign_task_to_tab(task.clone(), None) {
            Ok(tab_id) => {
                let task_id = task.id;
                self.active_tasks.insert(task_id, task);
                self.task_tabs.insert(task_id, tab_id);
                self.status = WorkerStatus::Processing;
                self.last_activity = Instant::now();
                debug!("Worker {} took task {}", self.id, task_id);
                Ok(())
            }
            Err(_) => Err(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_worker() -> Worker {
        let mut worker = Worker::new(1, WorkerConfig::default());
        worker.attach_profile(Profile::new(std::path::PathBuf::from("/tmp/p1")));
        worker.start(4242).unwrap();
        worker
    }

    #[test]
    fn test_start_requires_profile() {
        let mut worker = Worker::new(1, WorkerConfig::default());
        assert!(worker.start(4242).is_err());
        assert!(!worker.is_available_for_tasks());
    }

    #[test]
    fn test_lifecycle_ready_processing_idle() {
        let mut worker = ready_worker();
        assert_eq!(worker.status, WorkerStatus::Ready);
        assert!(worker.is_available_for_tasks());

        let task = PoTask::new("PO-1");
        let task_id = task.id;
        worker.assign_task(task).unwrap();
        assert_eq!(worker.status, WorkerStatus::Processing);
        assert_eq!(worker.active_task_count(), 1);

        let done = worker
            .complete_task(task_id, true, Duration::from_secs(2))
            .unwrap();
        assert_eq!(done.id, task_id);
        assert_eq!(worker.status, WorkerStatus::Idle);
        assert_eq!(worker.processed_count, 1);
        assert_eq!(worker.active_task_count(), 0);
    }

    #[test]
    fn test_assign_unavailable_rejected() {
        let mut worker = Worker::new(1, WorkerConfig::default());
        assert!(matches!(
            worker.assign_task(PoTask::new("PO-1")),
            Err(PoolError::WorkerUnavailable(1))
        ));
    }

    #[test]
    fn test_tab_cap_limits_assignments() {
        let mut worker = Worker::new(
            1,
            WorkerConfig {
                max_tabs: 2,
                ..Default::default()
            },
        );
        worker.attach_profile(Profile::new(std::path::PathBuf::from("/tmp/p1")));
        worker.start(4242).unwrap();

        worker.assign_task(PoTask::new("PO-1")).unwrap();
        worker.assign_task(PoTask::new("PO-2")).unwrap();
        assert!(!worker.is_available_for_tasks());
        assert!(worker.assign_task(PoTask::new("PO-3")).is_err());
    }

    #[test]
    fn test_error_budget_drives_restart() {
        let mut worker = ready_worker();
        assert!(!worker.should_restart(true, 0));

        worker.record_error(WorkerErrorKind::Navigation, "page hung");
        assert_ne!(worker.status, WorkerStatus::Error);
        assert!(!worker.should_restart(true, 0));

        for i in 1..worker.config().max_errors {
            worker.record_error(WorkerErrorKind::Navigation, format!("page hung {i}"));
        }
        assert_eq!(worker.status, WorkerStatus::Error);
        assert!(worker.should_restart(true, 0));
    }

    #[test]
    fn test_dead_process_drives_restart() {
        let worker = ready_worker();
        assert!(worker.should_restart(false, 0));
    }

    #[test]
    fn test_memory_ceiling_drives_restart() {
        let mut worker = Worker::new(
            1,
            WorkerConfig {
                memory_limit_bytes: 1024,
                ..Default::default()
            },
        );
        worker.attach_profile(Profile::new(std::path::PathBuf::from("/tmp/p1")));
        worker.start(4242).unwrap();
        assert!(!worker.should_restart(true, 512));
        assert!(worker.should_restart(true, 4096));
    }

    #[test]
    fn test_corrupted_profile_drives_restart() {
        let mut worker = ready_worker();
        worker.mark_profile_corrupted();
        assert!(worker.should_restart(true, 0));
    }

    #[test]
    fn test_crash_fails_in_flight() {
        let mut worker = ready_worker();
        worker.assign_task(PoTask::new("PO-1")).unwrap();
        worker.assign_task(PoTask::new("PO-2")).unwrap();

        let orphans = worker.mark_crashed();
        assert_eq!(orphans.len(), 2);
        assert_eq!(worker.status, WorkerStatus::Crashed);
        assert_eq!(worker.active_task_count(), 0);
    }

    #[test]
    fn test_stop_releases_everything() {
        let mut worker = ready_worker();
        worker.assign_task(PoTask::new("PO-1")).unwrap();

        let (orphans, profile, pid) = worker.stop();
        assert_eq!(orphans.len(), 1);
        assert!(profile.is_some());
        assert_eq!(pid, Some(4242));
        assert_eq!(worker.status, WorkerStatus::Stopped);
        assert!(!worker.is_available_for_tasks());
    }

    #[test]
    fn test_restart_keeps_id() {
        let mut worker = ready_worker();
        worker.begin_restart();
        let (_, profile, _) = worker.stop();

        worker.attach_profile(profile.unwrap());
        worker.start(5555).unwrap();
        assert_eq!(worker.id, 1);
        assert_eq!(worker.restart_count, 1);
        assert_eq!(worker.process_id(), Some(5555));
        assert!(worker.is_available_for_tasks());
    }

    #[test]
    fn test_sink_load_tracks_tasks() {
        let mut worker = ready_worker();
        assert_eq!(worker.load(), 0);
        worker.try_assign(PoTask::new("PO-1")).unwrap();
        assert_eq!(worker.load(), 1);
    }
}
