//! Pool and worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Minimum supported worker count.
pub const MIN_WORKERS: u32 = 1;
/// Maximum supported worker count.
pub const MAX_WORKERS: u32 = 8;

/// Pool-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers (1..=8).
    #[serde(default = "default_worker_count")]
    pub worker_count: u32,

    /// Maximum queued tasks before submissions are rejected.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// System memory fraction that triggers a warning.
    #[serde(default = "default_memory_warn")]
    pub memory_warn_fraction: f64,

    /// System memory fraction that restarts the worst worker.
    #[serde(default = "default_memory_restart_worker")]
    pub memory_restart_worker_fraction: f64,

    /// System memory fraction that restarts the whole pool.
    #[serde(default = "default_memory_restart_pool")]
    pub memory_restart_pool_fraction: f64,

    /// Overall graceful shutdown budget (seconds).
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// How long shutdown waits for in-flight tasks (seconds).
    #[serde(default = "default_task_completion_timeout")]
    pub task_completion_timeout_secs: u64,

    /// Delay before a failed task is eligible for retry (seconds).
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Health/memory monitor cycle interval (seconds). Bounds the
    /// dead-worker detection latency.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Maintenance cycle interval (seconds).
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    /// Cap on the completed and failed task archives.
    #[serde(default = "default_max_archive_size")]
    pub max_archive_size: usize,

    /// Base directory for browser profiles.
    #[serde(default = "default_profile_dir")]
    pub profile_dir: PathBuf,

    /// Per-worker settings.
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Per-worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Run the browser headless.
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Maximum concurrent tabs per session.
    #[serde(default = "default_max_tabs")]
    pub max_tabs: usize,

    /// Error count at which the worker should restart.
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,

    /// Idle seconds (no processing) at which the worker should restart.
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,

    /// Session uptime ceiling (seconds).
    #[serde(default = "default_max_uptime")]
    pub max_uptime_secs: u64,

    /// Per-worker resident memory ceiling (bytes).
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: u64,
}

fn default_worker_count() -> u32 {
    3
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_memory_warn() -> f64 {
    0.75
}

fn default_memory_restart_worker() -> f64 {
    0.85
}

fn default_memory_restart_pool() -> f64 {
    0.95
}

fn default_shutdown_timeout() -> u64 {
    60
}

fn default_task_completion_timeout() -> u64 {
    30
}

fn default_retry_delay() -> u64 {
    5
}

fn default_monitor_interval() -> u64 {
    2
}

fn default_maintenance_interval() -> u64 {
    30
}

fn default_max_archive_size() -> usize {
    1000
}

fn default_profile_dir() -> PathBuf {
    PathBuf::from(".pofetch/profiles")
}

fn default_headless() -> bool {
    true
}

fn default_max_tabs() -> usize {
    3
}

fn default_max_errors() -> u32 {
    5
}

fn default_max_idle() -> u64 {
    300
}

fn default_max_uptime() -> u64 {
    3600
}

fn default_memory_limit() -> u64 {
    2 * 1024 * 1024 * 1024
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_queue_size: default_max_queue_size(),
            memory_warn_fraction: default_memory_warn(),
            memory_restart_worker_fraction: default_memory_restart_worker(),
            memory_restart_pool_fraction: default_memory_restart_pool(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            task_completion_timeout_secs: default_task_completion_timeout(),
            retry_delay_secs: default_retry_delay(),
            monitor_interval_secs: default_monitor_interval(),
            maintenance_interval_secs: default_maintenance_interval(),
            max_archive_size: default_max_archive_size(),
            profile_dir: default_profile_dir(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            max_tabs: default_max_tabs(),
            max_errors: default_max_errors(),
            max_idle_secs: default_max_idle(),
            max_uptime_secs: default_max_uptime(),
            memory_limit_bytes: default_memory_limit(),
        }
    }
}

impl PoolConfig {
    /// Validate the configuration. Called once at pool initialize.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count < MIN_WORKERS || self.worker_count > MAX_WORKERS {
            return Err(ConfigError::InvalidWorkerCount {
                got: self.worker_count,
                min: MIN_WORKERS,
                max: MAX_WORKERS,
            });
        }

        let w = self.memory_warn_fraction;
        let r = self.memory_restart_worker_fraction;
        let p = self.memory_restart_pool_fraction;
        if !(w > 0.0 && w < r && r < p && p <= 1.0) {
            return Err(ConfigError::InvalidMemoryThresholds {
                warn: w,
                restart_worker: r,
                restart_pool: p,
            });
        }

        if self.profile_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingProfileDir);
        }

        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }

        if self.monitor_interval_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "monitor_interval_secs",
            });
        }
        if self.shutdown_timeout_secs == 0 {
            return Err(ConfigError::ZeroDuration {
                field: "shutdown_timeout_secs",
            });
        }

        Ok(())
    }

    /// Overall shutdown budget.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// In-flight task wait budget during shutdown.
    pub fn task_completion_timeout(&self) -> Duration {
        Duration::from_secs(self.task_completion_timeout_secs)
    }

    /// Retry delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Monitor cycle interval.
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    /// Maintenance cycle interval.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

impl WorkerConfig {
    /// Idle ceiling.
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    /// Uptime ceiling.
    pub fn max_uptime(&self) -> Duration {
        Duration::from_secs(self.max_uptime_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_worker_count_bounds() {
        let mut config = PoolConfig::default();
        config.worker_count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWorkerCount { .. })
        ));

        config.worker_count = 9;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidWorkerCount { .. })
        ));

        config.worker_count = 8;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_memory_thresholds_must_be_ordered() {
        let mut config = PoolConfig::default();
        config.memory_warn_fraction = 0.9;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMemoryThresholds { .. })
        ));
    }

    #[test]
    fn test_zero_queue_capacity_rejected() {
        let mut config = PoolConfig::default();
        config.max_queue_size = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroQueueCapacity)
        ));
    }
}
