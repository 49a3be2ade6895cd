//! The orchestrator: owns the workers, queue, profiles, and monitors.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use pofetch_core::{
    AutomationBackend, BrowserLauncher, PoTask, PoolConfig, SettlementHook, TaskStatusCode,
    WorkerErrorKind,
};
use pofetch_monitor::{MemoryAction, MemoryMonitor, MonitorConfig, ProcessProbe, SystemProbe};
use pofetch_profile::{Profile, ProfileManager, ProfileManagerConfig};
use pofetch_queue::{QueueConfig, TaskDisposition, TaskQueue, TaskSink};

use crate::error::PoolError;
use crate::shutdown::{run_phase, PhaseResult, ShutdownPhase, ShutdownReport};
use crate::signal::SignalHandler;
use crate::status::{PoolStatusReport, WorkerStatusReport};
use crate::worker::{Worker, WorkerStatus};

/// In-place restart attempts per recovery incident. Past this the
/// worker is written off and its tasks redistributed.
const MAX_RESTART_ATTEMPTS: u32 = 3;

/// Bounded pool-level error log.
const ERROR_LOG_CAP: usize = 50;

/// Window for the restart-rate counter.
const RESTART_WINDOW: Duration = Duration::from_secs(300);

/// Pool lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PoolStatus {
    /// Constructed, not yet initialized.
    Creating,
    /// Provisioning profiles and workers.
    Initializing,
    /// Launching browsers.
    Starting,
    /// Every worker up, no work yet.
    Ready,
    /// Running with fewer workers than configured.
    Degraded,
    /// Tasks outstanding.
    Active,
    /// Started, queue drained.
    Idle,
    /// Graceful shutdown in progress.
    Stopping,
    /// Shut down cleanly.
    Stopped,
    /// Unrecoverable: no healthy worker, or shutdown failed.
    Error,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PoolStatus::Creating => "creating",
            PoolStatus::Initializing => "initializing",
            PoolStatus::Starting => "starting",
            PoolStatus::Ready => "ready",
            PoolStatus::Degraded => "degraded",
            PoolStatus::Active => "active",
            PoolStatus::Idle => "idle",
            PoolStatus::Stopping => "stopping",
            PoolStatus::Stopped => "stopped",
            PoolStatus::Error => "error",
        };
        write!(f, "{s}")
    }
}

struct PoolCore {
    status: PoolStatus,
    workers: HashMap<u32, Worker>,
    errors: VecDeque<String>,
    restarts: VecDeque<Instant>,
}

/// A fixed set of long-lived browser workers fed from a shared
/// priority queue, supervised by monitor and maintenance loops.
///
/// Workers survive across tasks; a worker that crashes or degrades is
/// restarted in place with the same id, its in-flight tasks reclaimed
/// and redistributed. Only when restarts are exhausted and no healthy
/// worker remains does pending work fail, with a recorded reason.
pub struct PersistentWorkerPool {
    /// Pool instance ID.
    pub id: Uuid,
    config: PoolConfig,
    core: Mutex<PoolCore>,
    accepting: AtomicBool,
    profiles: Arc<ProfileManager>,
    queue: Arc<TaskQueue>,
    monitor: Arc<MemoryMonitor>,
    signals: SignalHandler,
    backend: Arc<dyn AutomationBackend>,
    launcher: Arc<dyn BrowserLauncher>,
    settlement: Option<Arc<dyn SettlementHook>>,
    cancel: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl PersistentWorkerPool {
    /// Create a pool over the real system probe and no settlement
    /// hook. Validates the configuration.
    pub async fn new(
        config: PoolConfig,
        backend: Arc<dyn AutomationBackend>,
        launcher: Arc<dyn BrowserLauncher>,
    ) -> Result<Arc<Self>, PoolError> {
        Self::with_collaborators(config, backend, launcher, None, Arc::new(SystemProbe::new()))
            .await
    }

    /// Create a pool with explicit collaborators.
    pub async fn with_collaborators(
        config: PoolConfig,
        backend: Arc<dyn AutomationBackend>,
        launcher: Arc<dyn BrowserLauncher>,
        settlement: Option<Arc<dyn SettlementHook>>,
        probe: Arc<dyn ProcessProbe>,
    ) -> Result<Arc<Self>, PoolError> {
        config.validate()?;

        let profiles = Arc::new(
            ProfileManager::new(config.profile_dir.clone(), ProfileManagerConfig::default())
                .await?,
        );
        let queue = Arc::new(TaskQueue::new(QueueConfig {
            max_queue_size: config.max_queue_size,
            retry_delay_secs: config.retry_delay_secs,
            max_archive_size: config.max_archive_size,
        }));
        let monitor = Arc::new(MemoryMonitor::new(
            probe,
            MonitorConfig {
                warn_fraction: config.memory_warn_fraction,
                restart_worker_fraction: config.memory_restart_worker_fraction,
                restart_pool_fraction: config.memory_restart_pool_fraction,
                ..MonitorConfig::default()
            },
        ));

        Ok(Arc::new(Self {
            id: Uuid::new_v4(),
            config,
            core: Mutex::new(PoolCore {
                status: PoolStatus::Creating,
                workers: HashMap::new(),
                errors: VecDeque::new(),
                restarts: VecDeque::new(),
            }),
            accepting: AtomicBool::new(false),
            profiles,
            queue,
            monitor,
            signals: SignalHandler::new(),
            backend,
            launcher,
            settlement,
            cancel: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        }))
    }

    /// Provision one profile per worker and spawn the supervision
    /// loops. Browsers are not launched until `start`.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), PoolError> {
        info!(
            "Initializing pool {} ({} workers)",
            self.id, self.config.worker_count
        );
        self.set_status(PoolStatus::Initializing).await;

        for worker_id in 0..self.config.worker_count {
            let profile = match self.profiles.get_available().await {
                Ok(p) => p,
                Err(e) => {
                    self.set_status(PoolStatus::Error).await;
                    return Err(e.into());
                }
            };
            let mut worker = Worker::new(worker_id, self.config.worker.clone());
            worker.attach_profile(profile);
            self.core.lock().await.workers.insert(worker_id, worker);
        }

        self.spawn_loops().await;
        Ok(())
    }

    /// Launch a browser for every worker. The pool comes up as long as
    /// at least one worker starts; fewer than configured means
    /// `Degraded`.
    pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        self.set_status(PoolStatus::Starting).await;

        let mut worker_ids: Vec<u32> = self.core.lock().await.workers.keys().copied().collect();
        worker_ids.sort_unstable();

        let mut started = 0u32;
        for worker_id in worker_ids {
            match self.start_worker(worker_id).await {
                Ok(()) => started += 1,
                Err(e) => {
                    self.record_pool_error(format!("worker {worker_id} failed to start: {e}"))
                        .await;
                }
            }
        }

        if started == 0 {
            self.set_status(PoolStatus::Error).await;
            return Err(PoolError::AllWorkersFailed {
                count: self.config.worker_count,
            });
        }

        let status = if started == self.config.worker_count {
            PoolStatus::Ready
        } else {
            PoolStatus::Degraded
        };
        self.set_status(status).await;
        self.accepting.store(true, Ordering::SeqCst);
        info!(
            "Pool {} started ({}/{} workers up)",
            self.id, started, self.config.worker_count
        );
        Ok(())
    }

    /// Submit one task. Rejected once shutdown has begun or when the
    /// queue is at capacity.
    pub async fn add_task(&self, task: PoTask) -> Result<(), PoolError> {
        if !self.accepting.load(Ordering::SeqCst) {
            let status = self.core.lock().await.status;
            return Err(PoolError::NotAccepting {
                status: status.to_string(),
            });
        }
        self.queue.add_task(task).await?;
        self.refresh_status().await;
        Ok(())
    }

    /// Submit a batch. Returns how many were accepted.
    pub async fn add_tasks(&self, tasks: Vec<PoTask>) -> Result<usize, PoolError> {
        if !self.accepting.load(Ordering::SeqCst) {
            let status = self.core.lock().await.status;
            return Err(PoolError::NotAccepting {
                status: status.to_string(),
            });
        }
        let accepted = self.queue.add_tasks(tasks).await;
        self.refresh_status().await;
        Ok(accepted)
    }

    /// Snapshot the pool, its workers, and the queue.
    pub async fn get_status(&self) -> PoolStatusReport {
        let stats = self.queue.stats().await;
        let core = self.core.lock().await;

        let mut workers: Vec<WorkerStatusReport> = core
            .workers
            .values()
            .map(|w| {
                let sample = self.monitor.worker_sample(w.id);
                WorkerStatusReport {
                    id: w.id,
                    status: w.status.to_string(),
                    process_id: w.process_id(),
                    memory_bytes: sample.map(|s| s.memory_bytes).unwrap_or(0),
                    current_task_count: w.active_task_count(),
                    processed_count: w.processed_count,
                    failed_count: w.failed_count,
                    error_count: w.error_count,
                    restart_count: w.restart_count,
                    available: w.is_available_for_tasks(),
                }
            })
            .collect();
        workers.sort_by_key(|w| w.id);

        PoolStatusReport {
            pool_id: self.id,
            status: core.status.to_string(),
            workers,
            pending_tasks: stats.pending + stats.retry_pending,
            active_tasks: stats.active,
            completed_tasks: stats.completed,
            failed_tasks: stats.failed,
            total_submitted: stats.total_submitted,
            system_memory_fraction: self
                .monitor
                .system_history()
                .last()
                .copied()
                .unwrap_or(0.0),
            avg_queue_wait_ms: stats.avg_wait_ms,
            profile_corruption_rate: self.profiles.corruption_rate(),
            restarts_last_5m: core.restarts.len(),
            recent_errors: core.errors.iter().cloned().collect(),
        }
    }

    /// Restart one worker in place: same id, fresh browser process,
    /// fresh session, and a replacement profile if the old one was
    /// flagged corrupted. In-flight tasks are reclaimed by the queue.
    pub async fn restart_worker(&self, worker_id: u32) -> Result<(), PoolError> {
        let (profile, old_pid, corrupted, headless) = {
            let mut core = self.core.lock().await;
            let worker = core
                .workers
                .get_mut(&worker_id)
                .ok_or(PoolError::WorkerNotFound(worker_id))?;
            let corrupted = worker.profile_corrupted();
            let headless = worker.config().headless;
            worker.begin_restart();
            let (_orphans, profile, old_pid) = worker.stop();
            (profile, old_pid, corrupted, headless)
        };

        if let Some(pid) = old_pid {
            self.launcher.terminate(pid).await;
        }

        let (_requeued, failed) = self.queue.unregister_worker(worker_id).await;
        for task_id in failed {
            self.settle(
                task_id,
                TaskStatusCode::Failed,
                &format!("worker {worker_id} lost and retries exhausted"),
                Some(worker_id),
            )
            .await;
        }

        let profile = match profile {
            Some(p) if !corrupted => p,
            Some(p) => {
                self.profiles.return_profile(p, true).await;
                self.profiles.get_available().await?
            }
            None => self.profiles.get_available().await?,
        };

        let pid = match self
            .launcher
            .launch(worker_id, &profile.path, headless)
            .await
        {
            Ok(pid) => pid,
            Err(e) => {
                self.profiles.return_profile(profile, false).await;
                return Err(PoolError::LaunchFailed {
                    worker_id,
                    reason: e.to_string(),
                });
            }
        };

        {
            let mut core = self.core.lock().await;
            let worker = core
                .workers
                .get_mut(&worker_id)
                .ok_or(PoolError::WorkerNotFound(worker_id))?;
            worker.attach_profile(profile);
            worker.start(pid)?;

            let now = Instant::now();
            core.restarts.push_back(now);
            while core
                .restarts
                .front()
                .is_some_and(|t| now.duration_since(*t) > RESTART_WINDOW)
            {
                core.restarts.pop_front();
            }
        }
        self.monitor.register_worker(worker_id, pid);
        info!("Worker {} restarted (pid {})", worker_id, pid);
        Ok(())
    }

    /// Graceful, phase-ordered shutdown. `timeout` overrides the
    /// configured overall budget. A required phase that fails aborts
    /// the remaining phases unless an emergency has been signalled.
    pub async fn shutdown(&self, timeout: Option<Duration>) -> ShutdownReport {
        let overall = timeout.unwrap_or_else(|| self.config.shutdown_timeout());
        let started = Instant::now();
        let deadline = started + overall;
        info!("Pool {} shutting down (budget {:?})", self.id, overall);

        self.set_status(PoolStatus::Stopping).await;
        self.accepting.store(false, Ordering::SeqCst);

        let mut phases: Vec<PhaseResult> = Vec::with_capacity(ShutdownPhase::ALL.len());
        for phase in ShutdownPhase::ALL {
            let remaining = deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1));

            let result = match phase {
                // Intake was cut above; the phase records that fact.
                ShutdownPhase::StopIntake => run_phase(phase, remaining, async { Ok(()) }).await,
                ShutdownPhase::AwaitTasks => {
                    let wait = self.config.task_completion_timeout().min(remaining);
                    run_phase(phase, remaining, self.await_tasks(wait)).await
                }
                ShutdownPhase::StopWorkers => {
                    run_phase(phase, remaining, self.stop_all_workers()).await
                }
                ShutdownPhase::CleanProfiles => {
                    run_phase(phase, remaining, async {
                        self.profiles.cleanup_all().await.map_err(|e| e.to_string())
                    })
                    .await
                }
                ShutdownPhase::StopMonitors => {
                    run_phase(phase, remaining, self.stop_loops()).await
                }
            };

            let abort = !result.success && phase.required() && !self.signals.is_emergency();
            phases.push(result);
            if abort {
                error!(
                    "Required shutdown phase '{}' failed, aborting remaining phases",
                    phase.name()
                );
                break;
            }
        }

        // The loops must not outlive shutdown even on an aborted run.
        self.cancel.cancel();

        let success = phases.len() == ShutdownPhase::ALL.len()
            && phases.iter().all(|p| p.success || !p.phase.required());
        self.set_status(if success {
            PoolStatus::Stopped
        } else {
            PoolStatus::Error
        })
        .await;

        let report = ShutdownReport {
            phases,
            success,
            emergency: self.signals.is_emergency(),
            duration: started.elapsed(),
        };
        info!(
            "Pool {} shutdown finished in {:?} (success: {})",
            self.id, report.duration, report.success
        );
        report
    }

    /// The pool's signal handler, for wiring OS signals and hooks.
    pub fn signals(&self) -> &SignalHandler {
        &self.signals
    }

    /// The shared task queue.
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    async fn start_worker(&self, worker_id: u32) -> Result<(), PoolError> {
        let (path, headless) = {
            let core = self.core.lock().await;
            let worker = core
                .workers
                .get(&worker_id)
                .ok_or(PoolError::WorkerNotFound(worker_id))?;
            let profile = worker
                .profile()
                .ok_or(PoolError::WorkerUnavailable(worker_id))?;
            (profile.path.clone(), worker.config().headless)
        };

        let pid = self
            .launcher
            .launch(worker_id, &path, headless)
            .await
            .map_err(|e| PoolError::LaunchFailed {
                worker_id,
                reason: e.to_string(),
            })?;

        {
            let mut core = self.core.lock().await;
            let worker = core
                .workers
                .get_mut(&worker_id)
                .ok_or(PoolError::WorkerNotFound(worker_id))?;
            worker.start(pid)?;
        }
        self.monitor.register_worker(worker_id, pid);
        Ok(())
    }

    async fn spawn_loops(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let monitor_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.monitor_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = pool.cancel.cancelled() => break,
                    _ = ticker.tick() => pool.monitor_cycle().await,
                }
            }
            debug!("Monitor loop stopped");
        });

        let pool = Arc::clone(self);
        let maintenance_loop = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.maintenance_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = pool.cancel.cancelled() => break,
                    _ = ticker.tick() => pool.maintenance_cycle().await,
                }
            }
            debug!("Maintenance loop stopped");
        });

        let mut loops = self.loops.lock().await;
        loops.push(monitor_loop);
        loops.push(maintenance_loop);
    }

    /// One supervision cycle: memory tiers, worker health, retry
    /// sweep, and task distribution.
    async fn monitor_cycle(self: &Arc<Self>) {
        let stopping = {
            let core = self.core.lock().await;
            matches!(
                core.status,
                PoolStatus::Stopping | PoolStatus::Stopped | PoolStatus::Error
            )
        };

        let report = self.monitor.sample();

        if !stopping {
            match report.action {
                None | Some(MemoryAction::Warn) => {}
                Some(MemoryAction::RestartWorstWorker) => {
                    if let Some(worker_id) = self.monitor.get_highest_memory_worker() {
                        self.recover_worker(worker_id, "memory pressure").await;
                    }
                }
                Some(MemoryAction::RestartPool) => {
                    warn!("Critical memory pressure, restarting every worker");
                    let mut ids: Vec<u32> =
                        self.core.lock().await.workers.keys().copied().collect();
                    ids.sort_unstable();
                    for worker_id in ids {
                        self.recover_worker(worker_id, "critical memory pressure")
                            .await;
                    }
                }
            }

            let unhealthy: Vec<u32> = {
                let core = self.core.lock().await;
                core.workers
                    .iter()
                    .filter_map(|(id, worker)| {
                        // A pid mismatch means the worker was restarted
                        // after this cycle's sample; probe it fresh.
                        let (alive, memory) = match report.workers.get(id) {
                            Some(s) if worker.process_id() == Some(s.pid) => {
                                (s.alive, s.memory_bytes)
                            }
                            _ => match worker.process_id() {
                                Some(pid) => (self.monitor.probe().process_alive(pid), 0),
                                None => (true, 0),
                            },
                        };
                        worker.should_restart(alive, memory).then_some(*id)
                    })
                    .collect()
            };
            for worker_id in unhealthy {
                self.recover_worker(worker_id, "failed health check").await;
            }
        }

        self.queue.sweep_retries().await;

        let assigned = {
            let mut core = self.core.lock().await;
            let mut sinks: Vec<&mut dyn TaskSink> = core
                .workers
                .values_mut()
                .map(|w| w as &mut dyn TaskSink)
                .collect();
            self.queue.distribute_tasks(&mut sinks).await
        };
        for (worker_id, task) in assigned {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.run_task(worker_id, task).await;
            });
        }

        self.refresh_status().await;
    }

    /// Housekeeping: archive trimming, idle tab cleanup, restart
    /// window pruning.
    async fn maintenance_cycle(&self) {
        self.queue.trim_archives().await;

        let mut core = self.core.lock().await;
        let now = Instant::now();
        while core
            .restarts
            .front()
            .is_some_and(|t| now.duration_since(*t) > RESTART_WINDOW)
        {
            core.restarts.pop_front();
        }
        for worker in core.workers.values_mut() {
            worker.cleanup_idle_tabs();
        }
    }

    /// Drive one assigned task through the backend and settle it.
    async fn run_task(self: Arc<Self>, worker_id: u32, task: PoTask) {
        let started = Instant::now();
        let result = self.backend.process(worker_id, &task).await;
        let duration = started.elapsed();

        let (success, message, status_code) = match result {
            Ok(outcome) => (outcome.success, outcome.message, outcome.status_code),
            Err(e) => {
                let kind = e.kind();
                let message = e.to_string();
                let mut core = self.core.lock().await;
                if let Some(worker) = core.workers.get_mut(&worker_id) {
                    if kind == WorkerErrorKind::Crash {
                        worker.record_error(kind, message.clone());
                        // Queue reclamation happens in the recovery
                        // cascade; the orphans here are stale copies.
                        let _ = worker.mark_crashed();
                    } else {
                        worker.record_error(kind, message.clone());
                    }
                }
                (false, message, TaskStatusCode::Failed)
            }
        };

        {
            let mut core = self.core.lock().await;
            if let Some(worker) = core.workers.get_mut(&worker_id) {
                // A missing entry means the worker was restarted and
                // the queue already reclaimed this task.
                let _ = worker.complete_task(task.id, success, duration);
            }
        }

        let disposition = match self
            .queue
            .complete_task(task.id, worker_id, success, duration, &message)
            .await
        {
            Ok(d) => d,
            Err(_) => {
                debug!("Stale completion for task {} ignored", task.id);
                return;
            }
        };

        match disposition {
            TaskDisposition::Completed | TaskDisposition::FailedTerminal => {
                self.settle(task.id, status_code, &message, Some(worker_id))
                    .await;
            }
            TaskDisposition::RetryScheduled => {}
        }
    }

    /// The recovery cascade: bounded in-place restarts, then write the
    /// worker off and redistribute, and only with no healthy worker
    /// left fail pending work with a reason.
    async fn recover_worker(self: &Arc<Self>, worker_id: u32, reason: &str) {
        info!("Recovering worker {} ({})", worker_id, reason);

        for attempt in 1..=MAX_RESTART_ATTEMPTS {
            match self.restart_worker(worker_id).await {
                Ok(()) => {
                    info!("Worker {} recovered on attempt {}", worker_id, attempt);
                    return;
                }
                Err(e) => {
                    self.record_pool_error(format!(
                        "worker {worker_id} restart attempt {attempt}/{MAX_RESTART_ATTEMPTS} failed: {e}"
                    ))
                    .await;
                }
            }
        }

        error!(
            "Worker {} written off after {} restart attempts",
            worker_id, MAX_RESTART_ATTEMPTS
        );
        let (requeued, failed) = self.queue.unregister_worker(worker_id).await;
        if requeued > 0 {
            info!(
                "Redistributed {} tasks from dead worker {}",
                requeued, worker_id
            );
        }
        for task_id in failed {
            self.settle(
                task_id,
                TaskStatusCode::Failed,
                &format!("worker {worker_id} lost and retries exhausted"),
                Some(worker_id),
            )
            .await;
        }
        self.monitor.unregister_worker(worker_id);

        let any_available = {
            let core = self.core.lock().await;
            core.workers.values().any(|w| w.is_available_for_tasks())
        };
        if !any_available {
            let reason = "no healthy worker available";
            let ids = self.queue.fail_all_pending(reason).await;
            for task_id in ids {
                self.settle(task_id, TaskStatusCode::Failed, reason, None)
                    .await;
            }
            self.record_pool_error(reason.to_string()).await;
            self.set_status(PoolStatus::Error).await;
        } else {
            self.refresh_status().await;
        }
    }

    async fn await_tasks(&self, budget: Duration) -> Result<(), String> {
        if !self.signals.is_emergency() {
            let drained = async {
                while self.queue.outstanding().await > 0 {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            };
            if tokio::time::timeout(budget, drained).await.is_ok() {
                return Ok(());
            }
        }

        let active = self.queue.fail_active("shutdown deadline reached").await;
        let pending = self
            .queue
            .fail_all_pending("pool shut down before dispatch")
            .await;
        for task_id in &active {
            self.settle(*task_id, TaskStatusCode::Failed, "shutdown deadline reached", None)
                .await;
        }
        for task_id in &pending {
            self.settle(
                *task_id,
                TaskStatusCode::Failed,
                "pool shut down before dispatch",
                None,
            )
            .await;
        }
        if !active.is_empty() || !pending.is_empty() {
            warn!(
                "Force-failed {} in-flight and {} pending tasks at shutdown",
                active.len(),
                pending.len()
            );
        }
        Ok(())
    }

    async fn stop_all_workers(&self) -> Result<(), String> {
        let stopped: Vec<(u32, Option<Profile>, Option<u32>, bool)> = {
            let mut core = self.core.lock().await;
            core.workers
                .values_mut()
                .map(|worker| {
                    let corrupted = worker.profile_corrupted();
                    let (_orphans, profile, pid) = worker.stop();
                    (worker.id, profile, pid, corrupted)
                })
                .collect()
        };

        for (worker_id, profile, pid, corrupted) in stopped {
            if let Some(pid) = pid {
                self.launcher.terminate(pid).await;
                if self.signals.is_emergency() {
                    crate::signal::kill_process(pid);
                }
            }
            if let Some(profile) = profile {
                self.profiles.return_profile(profile, corrupted).await;
            }
            self.monitor.unregister_worker(worker_id);
        }

        // Catch-all for anything the drain phase missed.
        let reason = "worker stopped at shutdown";
        let ids = self.queue.fail_active(reason).await;
        for task_id in ids {
            self.settle(task_id, TaskStatusCode::Failed, reason, None)
                .await;
        }
        Ok(())
    }

    async fn stop_loops(&self) -> Result<(), String> {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.loops.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    return Err(format!("supervision loop failed: {e}"));
                }
            }
        }
        Ok(())
    }

    async fn settle(
        &self,
        task_id: Uuid,
        status: TaskStatusCode,
        message: &str,
        worker_id: Option<u32>,
    ) {
        if let Some(hook) = self.settlement.as_ref() {
            hook.on_task_settled(task_id, status, message, worker_id)
                .await;
        }
    }

    async fn set_status(&self, status: PoolStatus) {
        self.core.lock().await.status = status;
    }

    /// Recompute the derived working status (`Active`/`Idle`/
    /// `Degraded`). Lifecycle states are left alone.
    async fn refresh_status(&self) {
        let stats = self.queue.stats().await;
        let outstanding = stats.pending + stats.active + stats.retry_pending;

        let mut core = self.core.lock().await;
        if !matches!(
            core.status,
            PoolStatus::Ready | PoolStatus::Degraded | PoolStatus::Active | PoolStatus::Idle
        ) {
            return;
        }

        let healthy = core
            .workers
            .values()
            .filter(|w| {
                matches!(
                    w.status,
                    WorkerStatus::Ready | WorkerStatus::Idle | WorkerStatus::Processing
                )
            })
            .count() as u32;
        core.status = if outstanding > 0 {
            PoolStatus::Active
        } else if healthy < self.config.worker_count {
            PoolStatus::Degraded
        } else if stats.total_submitted > 0 {
            PoolStatus::Idle
        } else {
            PoolStatus::Ready
        };
    }

    async fn record_pool_error(&self, message: String) {
        warn!("{message}");
        let mut core = self.core.lock().await;
        if core.errors.len() >= ERROR_LOG_CAP {
            core.errors.pop_front();
        }
        core.errors.push_back(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use parking_lot::RwLock;

    use pofetch_core::{ProcessOutcome, TaskError};

    /// Per-PO behavior for the fake backend.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Behavior {
        Succeed,
        Fail,
        Hang,
    }

    struct FakeBackend {
        behaviors: RwLock<HashMap<String, Behavior>>,
        calls: AtomicU32,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                behaviors: RwLock::new(HashMap::new()),
                calls: AtomicU32::new(0),
            }
        }

        fn set_behavior(&self, po_number: &str, behavior: Behavior) {
            self.behaviors
                .write()
                .insert(po_number.to_string(), behavior);
        }
    }

    #[async_trait]
    impl AutomationBackend for FakeBackend {
        async fn process(
            &self,
            _worker_id: u32,
            task: &PoTask,
        ) -> Result<ProcessOutcome, TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let behavior = self
                .behaviors
                .read()
                .get(&task.po_number)
                .copied()
                .unwrap_or(Behavior::Succeed);
            match behavior {
                Behavior::Succeed => Ok(ProcessOutcome::completed(2, 2)),
                Behavior::Fail => Err(TaskError::Navigation("portal unreachable".into())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(ProcessOutcome::completed(0, 0))
                }
            }
        }
    }

    struct FakeLauncher {
        next_pid: AtomicU32,
        launched: RwLock<Vec<(u32, u32)>>,
        refuse: RwLock<HashSet<u32>>,
        probe: Arc<FakeProbe>,
    }

    impl FakeLauncher {
        fn new(probe: Arc<FakeProbe>) -> Self {
            Self {
                next_pid: AtomicU32::new(1000),
                launched: RwLock::new(Vec::new()),
                refuse: RwLock::new(HashSet::new()),
                probe,
            }
        }

        fn refuse_worker(&self, worker_id: u32) {
            self.refuse.write().insert(worker_id);
        }

        fn launch_count(&self) -> usize {
            self.launched.read().len()
        }
    }

    #[async_trait]
    impl BrowserLauncher for FakeLauncher {
        async fn launch(
            &self,
            worker_id: u32,
            _profile_path: &std::path::Path,
            _headless: bool,
        ) -> Result<u32, TaskError> {
            if self.refuse.read().contains(&worker_id) {
                return Err(TaskError::Other("browser binary missing".into()));
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            self.probe.spawn(pid);
            self.launched.write().push((worker_id, pid));
            Ok(pid)
        }

        async fn terminate(&self, pid: u32) {
            self.probe.kill(pid);
        }
    }

    struct FakeProbe {
        fraction: RwLock<f64>,
        memories: RwLock<HashMap<u32, u64>>,
    }

    impl FakeProbe {
        fn new() -> Self {
            Self {
                fraction: RwLock::new(0.10),
                memories: RwLock::new(HashMap::new()),
            }
        }

        fn spawn(&self, pid: u32) {
            self.memories.write().insert(pid, 100 * 1024 * 1024);
        }

        fn kill(&self, pid: u32) {
            self.memories.write().remove(&pid);
        }

        fn set_fraction(&self, fraction: f64) {
            *self.fraction.write() = fraction;
        }

        fn set_memory(&self, pid: u32, bytes: u64) {
            self.memories.write().insert(pid, bytes);
        }
    }

    impl ProcessProbe for FakeProbe {
        fn refresh(&self) {}
        fn system_memory_fraction(&self) -> f64 {
            *self.fraction.read()
        }
        fn process_alive(&self, pid: u32) -> bool {
            self.memories.read().contains_key(&pid)
        }
        fn process_memory_bytes(&self, pid: u32) -> Option<u64> {
            self.memories.read().get(&pid).copied()
        }
        fn process_cpu_percent(&self, pid: u32) -> Option<f32> {
            self.memories.read().get(&pid).map(|_| 1.0)
        }
    }

    struct FakeHook {
        settled: RwLock<Vec<(Uuid, TaskStatusCode, Option<u32>)>>,
    }

    impl FakeHook {
        fn new() -> Self {
            Self {
                settled: RwLock::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SettlementHook for FakeHook {
        async fn on_task_settled(
            &self,
            task_id: Uuid,
            status: TaskStatusCode,
            _message: &str,
            worker_id: Option<u32>,
        ) {
            self.settled.write().push((task_id, status, worker_id));
        }
    }

    struct Rig {
        pool: Arc<PersistentWorkerPool>,
        backend: Arc<FakeBackend>,
        launcher: Arc<FakeLauncher>,
        probe: Arc<FakeProbe>,
        hook: Arc<FakeHook>,
        _tmp: tempfile::TempDir,
    }

    async fn rig_with(config: PoolConfig) -> Rig {
        let tmp = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            profile_dir: tmp.path().join("profiles"),
            retry_delay_secs: 0,
            ..config
        };

        let backend = Arc::new(FakeBackend::new());
        let probe = Arc::new(FakeProbe::new());
        let launcher = Arc::new(FakeLauncher::new(probe.clone()));
        let hook = Arc::new(FakeHook::new());

        let pool = PersistentWorkerPool::with_collaborators(
            config,
            backend.clone(),
            launcher.clone(),
            Some(hook.clone()),
            probe.clone(),
        )
        .await
        .unwrap();

        Rig {
            pool,
            backend,
            launcher,
            probe,
            hook,
            _tmp: tmp,
        }
    }

    async fn rig(worker_count: u32) -> Rig {
        rig_with(PoolConfig {
            worker_count,
            ..Default::default()
        })
        .await
    }

    /// Drive cycles until the queue is fully settled or the bound runs
    /// out.
    async fn drain(pool: &Arc<PersistentWorkerPool>) {
        for _ in 0..100 {
            pool.monitor_cycle().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            if pool.queue().outstanding().await == 0 {
                // One more pass so the derived status settles.
                pool.monitor_cycle().await;
                return;
            }
        }
        panic!("queue never drained");
    }

    #[tokio::test]
    async fn test_initialize_and_start_brings_all_workers_up() {
        let rig = rig(3).await;
        rig.pool.initialize().await.unwrap();
        rig.pool.start().await.unwrap();

        let status = rig.pool.get_status().await;
        assert_eq!(status.status, "ready");
        assert_eq!(status.workers.len(), 3);
        assert!(status.workers.iter().all(|w| w.available));
        assert_eq!(rig.launcher.launch_count(), 3);
        rig.pool.shutdown(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_all_launches_failing_is_fatal() {
        let rig = rig(2).await;
        rig.launcher.refuse_worker(0);
        rig.launcher.refuse_worker(1);
        rig.pool.initialize().await.unwrap();

        assert!(matches!(
            rig.pool.start().await,
            Err(PoolError::AllWorkersFailed { count: 2 })
        ));
        assert_eq!(rig.pool.get_status().await.status, "error");
    }

    #[tokio::test]
    async fn test_partial_start_is_degraded() {
        let rig = rig(2).await;
        rig.launcher.refuse_worker(1);
        rig.pool.initialize().await.unwrap();
        rig.pool.start().await.unwrap();

        let status = rig.pool.get_status().await;
        assert_eq!(status.status, "degraded");
        assert!(!status.recent_errors.is_empty());
        rig.pool.shutdown(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_tasks_processed_across_workers() {
        let rig = rig(3).await;
        rig.pool.initialize().await.unwrap();
        rig.pool.start().await.unwrap();

        let tasks: Vec<PoTask> = (0..5).map(|i| PoTask::new(format!("PO-{i}"))).collect();
        let accepted = rig.pool.add_tasks(tasks).await.unwrap();
        assert_eq!(accepted, 5);

        drain(&rig.pool).await;

        let status = rig.pool.get_status().await;
        assert_eq!(status.completed_tasks, 5);
        assert_eq!(status.failed_tasks, 0);
        assert_eq!(rig.hook.settled.read().len(), 5);
        assert!(rig
            .hook
            .settled
            .read()
            .iter()
            .all(|(_, s, _)| *s == TaskStatusCode::Completed));
        rig.pool.shutdown(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_load_balanced_across_workers() {
        let rig = rig(3).await;
        rig.pool.initialize().await.unwrap();
        rig.pool.start().await.unwrap();

        for i in 0..9 {
            rig.pool.add_task(PoTask::new(format!("PO-{i}"))).await.unwrap();
        }
        drain(&rig.pool).await;

        let status = rig.pool.get_status().await;
        let counts: Vec<u64> = status.workers.iter().map(|w| w.processed_count).collect();
        assert_eq!(counts.iter().sum::<u64>(), 9);
        // No worker hogs the queue while others sit idle.
        assert!(counts.iter().all(|&c| c > 0));
        rig.pool.shutdown(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_failing_task_retried_then_terminal() {
        let rig = rig(2).await;
        rig.backend.set_behavior("PO-bad", Behavior::Fail);
        rig.pool.initialize().await.unwrap();
        rig.pool.start().await.unwrap();

        let task = PoTask::new("PO-bad").with_max_retries(2);
        let task_id = task.id;
        rig.pool.add_task(task).await.unwrap();
        drain(&rig.pool).await;

        let status = rig.pool.get_status().await;
        assert_eq!(status.completed_tasks, 0);
        assert_eq!(status.failed_tasks, 1);
        // Original attempt plus two retries.
        assert_eq!(rig.backend.calls.load(Ordering::SeqCst), 3);

        let failed = rig.pool.queue().failed_tasks().await;
        assert_eq!(failed[0].task.id, task_id);
        assert!(!failed[0].reason.is_empty());

        let settled = rig.hook.settled.read();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].1, TaskStatusCode::Failed);
        rig.pool.shutdown(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_dead_worker_restarted_in_place() {
        let rig = rig(2).await;
        rig.pool.initialize().await.unwrap();
        rig.pool.start().await.unwrap();

        let victim_pid = rig.pool.get_status().await.workers[0].process_id.unwrap();
        rig.probe.kill(victim_pid);

        rig.pool.monitor_cycle().await;

        let status = rig.pool.get_status().await;
        let worker = &status.workers[0];
        assert_eq!(worker.restart_count, 1);
        assert_ne!(worker.process_id, Some(victim_pid));
        assert!(worker.available);
        assert_eq!(status.restarts_last_5m, 1);
        rig.pool.shutdown(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_unrecoverable_worker_work_redistributed() {
        let rig = rig(2).await;
        rig.backend.set_behavior("PO-hang", Behavior::Hang);
        rig.pool.initialize().await.unwrap();
        rig.pool.start().await.unwrap();

        let task = PoTask::new("PO-hang");
        let task_id = task.id;
        rig.pool.add_task(task).await.unwrap();
        rig.pool.monitor_cycle().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rig.pool.queue().active_count().await, 1);

        // Kill the assigned worker's browser and refuse to relaunch it.
        let status = rig.pool.get_status().await;
        let victim = status
            .workers
            .iter()
            .find(|w| w.current_task_count == 1)
            .unwrap();
        rig.probe.kill(victim.process_id.unwrap());
        rig.launcher.refuse_worker(victim.id);
        // The reassignment must complete.
        rig.backend.set_behavior("PO-hang", Behavior::Succeed);

        drain(&rig.pool).await;

        let status = rig.pool.get_status().await;
        assert_eq!(status.completed_tasks, 1);
        let done = rig.pool.queue().completed_tasks().await;
        assert_eq!(done[0].id, task_id);
        assert_eq!(done[0].retry_count, 1);
        // The survivor keeps the pool degraded but working.
        assert_eq!(status.status, "degraded");
        rig.pool.shutdown(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_no_healthy_worker_fails_pending_with_reason() {
        let rig = rig(1).await;
        rig.backend.set_behavior("PO-1", Behavior::Hang);
        rig.pool.initialize().await.unwrap();
        rig.pool.start().await.unwrap();

        rig.pool.add_task(PoTask::new("PO-1")).await.unwrap();
        rig.pool.add_task(PoTask::new("PO-2")).await.unwrap();
        rig.pool.monitor_cycle().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let pid = rig.pool.get_status().await.workers[0].process_id.unwrap();
        rig.probe.kill(pid);
        rig.launcher.refuse_worker(0);

        rig.pool.monitor_cycle().await;
        // Second pass: the reclaimed-at-urgent task has no worker left.
        rig.pool.monitor_cycle().await;

        let status = rig.pool.get_status().await;
        assert_eq!(status.status, "error");
        assert_eq!(status.pending_tasks, 0);
        let failed = rig.pool.queue().failed_tasks().await;
        assert!(failed
            .iter()
            .any(|f| f.reason.contains("no healthy worker")));
        assert!(status
            .recent_errors
            .iter()
            .any(|e| e.contains("no healthy worker")));
    }

    #[tokio::test]
    async fn test_memory_pressure_restarts_worst_worker() {
        let rig = rig(3).await;
        rig.pool.initialize().await.unwrap();
        rig.pool.start().await.unwrap();

        let status = rig.pool.get_status().await;
        let glutton = &status.workers[1];
        rig.probe
            .set_memory(glutton.process_id.unwrap(), 8 * 1024 * 1024 * 1024);
        rig.probe.set_fraction(0.90);

        rig.pool.monitor_cycle().await;

        let status = rig.pool.get_status().await;
        let restarted = status.workers.iter().find(|w| w.id == glutton.id).unwrap();
        assert_eq!(restarted.restart_count, 1);
        assert!(status
            .workers
            .iter()
            .filter(|w| w.id != glutton.id)
            .all(|w| w.restart_count == 0));
        rig.pool.shutdown(Some(Duration::from_secs(5))).await;
    }

    #[tokio::test]
    async fn test_graceful_shutdown_runs_all_phases() {
        let rig = rig(2).await;
        rig.pool.initialize().await.unwrap();
        rig.pool.start().await.unwrap();

        let report = rig.pool.shutdown(Some(Duration::from_secs(5))).await;
        assert!(report.success);
        assert!(!report.emergency);
        assert_eq!(report.phases.len(), 5);
        assert!(report.phases.iter().all(|p| p.success));
        assert_eq!(rig.pool.get_status().await.status, "stopped");

        // Submission after shutdown is rejected.
        assert!(matches!(
            rig.pool.add_task(PoTask::new("PO-late")).await,
            Err(PoolError::NotAccepting { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_force_fails_stragglers() {
        let rig = rig_with(PoolConfig {
            worker_count: 1,
            task_completion_timeout_secs: 0,
            ..Default::default()
        })
        .await;
        rig.backend.set_behavior("PO-stuck", Behavior::Hang);
        rig.pool.initialize().await.unwrap();
        rig.pool.start().await.unwrap();

        rig.pool.add_task(PoTask::new("PO-stuck")).await.unwrap();
        rig.pool.monitor_cycle().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(rig.pool.queue().active_count().await, 1);

        let report = rig.pool.shutdown(Some(Duration::from_secs(5))).await;
        assert!(report.success);

        let failed = rig.pool.queue().failed_tasks().await;
        assert_eq!(failed.len(), 1);
        assert!(failed[0].reason.contains("shutdown deadline"));
        let settled = rig.hook.settled.read();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].1, TaskStatusCode::Failed);
    }

    #[tokio::test]
    async fn test_task_conservation_under_mixed_outcomes() {
        let rig = rig(2).await;
        rig.backend.set_behavior("PO-3", Behavior::Fail);
        rig.backend.set_behavior("PO-7", Behavior::Fail);
        rig.pool.initialize().await.unwrap();
        rig.pool.start().await.unwrap();

        let tasks: Vec<PoTask> = (0..10)
            .map(|i| PoTask::new(format!("PO-{i}")).with_max_retries(1))
            .collect();
        rig.pool.add_tasks(tasks).await.unwrap();
        drain(&rig.pool).await;

        let status = rig.pool.get_status().await;
        assert_eq!(status.completed_tasks + status.failed_tasks, 10);
        assert_eq!(status.completed_tasks, 8);
        assert_eq!(status.failed_tasks, 2);
        assert_eq!(status.pending_tasks + status.active_tasks, 0);
        rig.pool.shutdown(Some(Duration::from_secs(5))).await;
    }
}
