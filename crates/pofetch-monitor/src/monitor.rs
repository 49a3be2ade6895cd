//! Tiered memory monitoring with per-tier cooldowns.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::probe::ProcessProbe;

/// Monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// System memory fraction that logs a warning.
    #[serde(default = "default_warn")]
    pub warn_fraction: f64,

    /// System memory fraction that restarts the worst worker.
    #[serde(default = "default_restart_worker")]
    pub restart_worker_fraction: f64,

    /// System memory fraction that restarts the pool.
    #[serde(default = "default_restart_pool")]
    pub restart_pool_fraction: f64,

    /// Cooldown for the warn tier (seconds).
    #[serde(default = "default_warn_cooldown")]
    pub warn_cooldown_secs: u64,

    /// Cooldown for the restart-worker tier (seconds).
    #[serde(default = "default_restart_worker_cooldown")]
    pub restart_worker_cooldown_secs: u64,

    /// Cooldown for the restart-pool tier (seconds).
    #[serde(default = "default_restart_pool_cooldown")]
    pub restart_pool_cooldown_secs: u64,

    /// Samples retained per history.
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
}

fn default_warn() -> f64 {
    0.75
}

fn default_restart_worker() -> f64 {
    0.85
}

fn default_restart_pool() -> f64 {
    0.95
}

fn default_warn_cooldown() -> u64 {
    30
}

fn default_restart_worker_cooldown() -> u64 {
    60
}

fn default_restart_pool_cooldown() -> u64 {
    300
}

fn default_history_cap() -> usize {
    120
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warn_fraction: default_warn(),
            restart_worker_fraction: default_restart_worker(),
            restart_pool_fraction: default_restart_pool(),
            warn_cooldown_secs: default_warn_cooldown(),
            restart_worker_cooldown_secs: default_restart_worker_cooldown(),
            restart_pool_cooldown_secs: default_restart_pool_cooldown(),
            history_cap: default_history_cap(),
        }
    }
}

/// Action a memory tier maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAction {
    /// Log and carry on.
    Warn,
    /// Restart the worker using the most memory.
    RestartWorstWorker,
    /// Restart the whole pool.
    RestartPool,
}

/// One worker's reading from a monitor cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WorkerSample {
    /// Worker's browser process id.
    pub pid: u32,
    /// Whether the process exists.
    pub alive: bool,
    /// Resident memory (bytes); zero when dead.
    pub memory_bytes: u64,
    /// CPU percent; zero when dead.
    pub cpu_percent: f32,
}

/// Result of one monitor cycle.
#[derive(Debug, Clone)]
pub struct MemoryReport {
    /// System-wide memory fraction.
    pub system_fraction: f64,
    /// Per-registered-worker readings.
    pub workers: HashMap<u32, WorkerSample>,
    /// Action the tier evaluation selected, if any.
    pub action: Option<MemoryAction>,
}

struct TierState {
    threshold: f64,
    action: MemoryAction,
    cooldown: Duration,
    last_fired: Option<Instant>,
}

struct WorkerTrack {
    pid: u32,
    history: VecDeque<(Instant, u64)>,
    last: Option<WorkerSample>,
}

struct MonitorState {
    workers: HashMap<u32, WorkerTrack>,
    system_history: VecDeque<(Instant, f64)>,
    tiers: [TierState; 3],
}

/// Samples system and per-worker memory and maps threshold violations
/// to tiered actions.
pub struct MemoryMonitor {
    probe: Arc<dyn ProcessProbe>,
    config: MonitorConfig,
    state: Mutex<MonitorState>,
}

impl MemoryMonitor {
    /// Create a monitor over the given probe.
    pub fn new(probe: Arc<dyn ProcessProbe>, config: MonitorConfig) -> Self {
        // Ordered highest first so evaluation picks the most severe
        // exceeded tier.
        let tiers = [
            TierState {
                threshold: config.restart_pool_fraction,
                action: MemoryAction::RestartPool,
                cooldown: Duration::from_secs(config.restart_pool_cooldown_secs),
                last_fired: None,
            },
            TierState {
                threshold: config.restart_worker_fraction,
                action: MemoryAction::RestartWorstWorker,
                cooldown: Duration::from_secs(config.restart_worker_cooldown_secs),
                last_fired: None,
            },
            TierState {
                threshold: config.warn_fraction,
                action: MemoryAction::Warn,
                cooldown: Duration::from_secs(config.warn_cooldown_secs),
                last_fired: None,
            },
        ];

        Self {
            probe,
            config,
            state: Mutex::new(MonitorState {
                workers: HashMap::new(),
                system_history: VecDeque::new(),
                tiers,
            }),
        }
    }

    /// Track a worker's browser process.
    pub fn register_worker(&self, worker_id: u32, pid: u32) {
        let mut state = self.state.lock();
        state.workers.insert(
            worker_id,
            WorkerTrack {
                pid,
                history: VecDeque::new(),
                last: None,
            },
        );
        debug!("Monitoring worker {} (pid {})", worker_id, pid);
    }

    /// Stop tracking a worker.
    pub fn unregister_worker(&self, worker_id: u32) {
        self.state.lock().workers.remove(&worker_id);
    }

    /// Point a worker at a new process after a restart.
    pub fn update_worker_pid(&self, worker_id: u32, pid: u32) {
        if let Some(track) = self.state.lock().workers.get_mut(&worker_id) {
            track.pid = pid;
        }
    }

    /// Run one monitor cycle: refresh the probe, record histories,
    /// and evaluate the tiers.
    pub fn sample(&self) -> MemoryReport {
        self.probe.refresh();
        let system_fraction = self.probe.system_memory_fraction();
        let now = Instant::now();

        let mut state = self.state.lock();
        let cap = self.config.history_cap;

        if state.system_history.len() >= cap {
            state.system_history.pop_front();
        }
        state.system_history.push_back((now, system_fraction));

        let mut workers = HashMap::new();
        for (id, track) in state.workers.iter_mut() {
            let alive = self.probe.process_alive(track.pid);
            let memory_bytes = self.probe.process_memory_bytes(track.pid).unwrap_or(0);
            let sample = WorkerSample {
                pid: track.pid,
                alive,
                memory_bytes,
                cpu_percent: self.probe.process_cpu_percent(track.pid).unwrap_or(0.0),
            };
            if track.history.len() >= cap {
                track.history.pop_front();
            }
            track.history.push_back((now, memory_bytes));
            track.last = Some(sample);
            workers.insert(*id, sample);
        }

        let action = Self::evaluate(&mut state.tiers, system_fraction, now);
        if let Some(a) = action {
            warn!(
                "Memory at {:.1}% triggered {:?}",
                system_fraction * 100.0,
                a
            );
        }

        MemoryReport {
            system_fraction,
            workers,
            action,
        }
    }

    /// Worker with the highest memory in the last cycle.
    pub fn get_highest_memory_worker(&self) -> Option<u32> {
        let state = self.state.lock();
        state
            .workers
            .iter()
            .filter_map(|(id, t)| t.last.map(|s| (*id, s.memory_bytes)))
            .max_by_key(|(_, mem)| *mem)
            .map(|(id, _)| id)
    }

    /// Last reading for one worker.
    pub fn worker_sample(&self, worker_id: u32) -> Option<WorkerSample> {
        self.state.lock().workers.get(&worker_id).and_then(|t| t.last)
    }

    /// System memory history, oldest first.
    pub fn system_history(&self) -> Vec<f64> {
        self.state
            .lock()
            .system_history
            .iter()
            .map(|(_, f)| *f)
            .collect()
    }

    /// One worker's memory history, oldest first.
    pub fn worker_history(&self, worker_id: u32) -> Vec<u64> {
        self.state
            .lock()
            .workers
            .get(&worker_id)
            .map(|t| t.history.iter().map(|(_, m)| *m).collect())
            .unwrap_or_default()
    }

    /// The probe, for callers that need liveness checks directly.
    pub fn probe(&self) -> &Arc<dyn ProcessProbe> {
        &self.probe
    }

    /// Pick the most severe exceeded tier; fire it only if its own
    /// cooldown has elapsed.
    fn evaluate(tiers: &mut [TierState; 3], fraction: f64, now: Instant) -> Option<MemoryAction> {
        let tier = tiers.iter_mut().find(|t| fraction >= t.threshold)?;
        match tier.last_fired {
            Some(at) if now.duration_since(at) < tier.cooldown => None,
            _ => {
                tier.last_fired = Some(now);
                Some(tier.action)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;

    struct FakeProbe {
        fraction: RwLock<f64>,
        memories: RwLock<HashMap<u32, u64>>,
    }

    impl FakeProbe {
        fn new(fraction: f64) -> Self {
            Self {
                fraction: RwLock::new(fraction),
                memories: RwLock::new(HashMap::new()),
            }
        }

        fn set_fraction(&self, f: f64) {
            *self.fraction.write() = f;
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

    fn monitor_with(fraction: f64) -> (Arc<FakeProbe>, MemoryMonitor) {
        let probe = Arc::new(FakeProbe::new(fraction));
        let monitor = MemoryMonitor::new(probe.clone(), MonitorConfig::default());
        (probe, monitor)
    }

    #[test]
    fn test_no_action_below_warn() {
        let (_, monitor) = monitor_with(0.50);
        assert_eq!(monitor.sample().action, None);
    }

    #[test]
    fn test_warn_tier_fires() {
        let (_, monitor) = monitor_with(0.80);
        assert_eq!(monitor.sample().action, Some(MemoryAction::Warn));
    }

    #[test]
    fn test_middle_tier_selects_restart_worker() {
        // 0.90 is above the 0.85 tier but below 0.95.
        let (_, monitor) = monitor_with(0.90);
        assert_eq!(
            monitor.sample().action,
            Some(MemoryAction::RestartWorstWorker)
        );
    }

    #[test]
    fn test_top_tier_restarts_pool() {
        let (_, monitor) = monitor_with(0.97);
        assert_eq!(monitor.sample().action, Some(MemoryAction::RestartPool));
    }

    #[test]
    fn test_cooldown_suppresses_refire() {
        let (_, monitor) = monitor_with(0.90);
        assert_eq!(
            monitor.sample().action,
            Some(MemoryAction::RestartWorstWorker)
        );
        // Condition persists, cooldown has not elapsed.
        assert_eq!(monitor.sample().action, None);
        assert_eq!(monitor.sample().action, None);
    }

    #[test]
    fn test_highest_memory_worker() {
        let (probe, monitor) = monitor_with(0.90);
        probe.set_memory(100, 512);
        probe.set_memory(200, 4096);
        probe.set_memory(300, 1024);
        monitor.register_worker(1, 100);
        monitor.register_worker(2, 200);
        monitor.register_worker(3, 300);

        monitor.sample();
        assert_eq!(monitor.get_highest_memory_worker(), Some(2));
    }

    #[test]
    fn test_dead_worker_sample() {
        let (probe, monitor) = monitor_with(0.50);
        probe.set_memory(100, 512);
        monitor.register_worker(1, 100);
        monitor.register_worker(2, 999);

        let report = monitor.sample();
        assert!(report.workers[&1].alive);
        assert!(!report.workers[&2].alive);
        assert_eq!(report.workers[&2].memory_bytes, 0);
    }

    #[test]
    fn test_history_bounded() {
        let probe = Arc::new(FakeProbe::new(0.10));
        let monitor = MemoryMonitor::new(
            probe.clone(),
            MonitorConfig {
                history_cap: 5,
                ..Default::default()
            },
        );
        probe.set_memory(100, 64);
        monitor.register_worker(1, 100);

        for i in 0..10 {
            probe.set_fraction(i as f64 / 100.0);
            monitor.sample();
        }
        assert_eq!(monitor.system_history().len(), 5);
        assert_eq!(monitor.worker_history(1).len(), 5);
    }

    #[test]
    fn test_escalation_is_independent_per_tier() {
        let (probe, monitor) = monitor_with(0.90);
        assert_eq!(
            monitor.sample().action,
            Some(MemoryAction::RestartWorstWorker)
        );

        // Climbing into the top tier fires it even though the middle
        // tier is still cooling down.
        probe.set_fraction(0.97);
        assert_eq!(monitor.sample().action, Some(MemoryAction::RestartPool));
    }
}
