//! Process and system inspection seam.

use parking_lot::Mutex;
use sysinfo::{Pid, System};

/// Access to process liveness and resource usage.
///
/// The pool only ever talks to this trait; production uses
/// [`SystemProbe`], tests substitute a fake.
pub trait ProcessProbe: Send + Sync {
    /// Refresh cached readings. Called once per monitor cycle.
    fn refresh(&self);

    /// System-wide memory usage as a fraction of total (0.0..=1.0).
    fn system_memory_fraction(&self) -> f64;

    /// Whether a process exists.
    fn process_alive(&self, pid: u32) -> bool;

    /// Resident memory of a process, if it exists.
    fn process_memory_bytes(&self, pid: u32) -> Option<u64>;

    /// CPU usage percent of a process, if it exists.
    fn process_cpu_percent(&self, pid: u32) -> Option<f32>;
}

/// `sysinfo`-backed probe.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    /// Create a probe with an initial full refresh.
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_processes();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe for SystemProbe {
    fn refresh(&self) {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_processes();
    }

    fn system_memory_fraction(&self) -> f64 {
        let system = self.system.lock();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 / total as f64
    }

    fn process_alive(&self, pid: u32) -> bool {
        self.system.lock().process(Pid::from_u32(pid)).is_some()
    }

    fn process_memory_bytes(&self, pid: u32) -> Option<u64> {
        self.system
            .lock()
            .process(Pid::from_u32(pid))
            .map(|p| p.memory())
    }

    fn process_cpu_percent(&self, pid: u32) -> Option<f32> {
        self.system
            .lock()
            .process(Pid::from_u32(pid))
            .map(|p| p.cpu_usage())
    }
}
