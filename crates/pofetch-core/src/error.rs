//! Core error types.

use thiserror::Error;

/// Configuration validation errors. All fatal at initialize time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Worker count outside the supported range.
    #[error("invalid worker count {got} (must be {min}..={max})")]
    InvalidWorkerCount { got: u32, min: u32, max: u32 },

    /// Memory thresholds must be strictly ordered and within (0, 1].
    #[error("invalid memory thresholds: warn={warn}, restart_worker={restart_worker}, restart_pool={restart_pool}")]
    InvalidMemoryThresholds {
        warn: f64,
        restart_worker: f64,
        restart_pool: f64,
    },

    /// Base profile directory missing or empty.
    #[error("profile base directory is not set")]
    MissingProfileDir,

    /// A duration field was zero where a positive value is required.
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    /// Queue capacity of zero would reject every task.
    #[error("max_queue_size must be greater than zero")]
    ZeroQueueCapacity,
}

/// Error categories recorded against a worker or tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerErrorKind {
    /// Page navigation failed.
    Navigation,
    /// An operation timed out.
    Timeout,
    /// In-page JavaScript failed.
    Javascript,
    /// Element interaction (click/type) failed.
    Interaction,
    /// Attachment download failed.
    Download,
    /// Portal authentication failed.
    Auth,
    /// The browser process crashed.
    Crash,
    /// Anything else.
    Other,
}

impl std::fmt::Display for WorkerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerErrorKind::Navigation => write!(f, "navigation"),
            WorkerErrorKind::Timeout => write!(f, "timeout"),
            WorkerErrorKind::Javascript => write!(f, "javascript"),
            WorkerErrorKind::Interaction => write!(f, "interaction"),
            WorkerErrorKind::Download => write!(f, "download"),
            WorkerErrorKind::Auth => write!(f, "auth"),
            WorkerErrorKind::Crash => write!(f, "crash"),
            WorkerErrorKind::Other => write!(f, "other"),
        }
    }
}

/// Error returned by the automation backend for a single task attempt.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Navigation to the PO page failed.
    #[error("navigation failed: {0}")]
    Navigation(String),

    /// The backend hit a timeout.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Authentication against the portal failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The browser died mid-task.
    #[error("browser crashed: {0}")]
    Crash(String),

    /// Attachment download failed.
    #[error("download failed: {0}")]
    Download(String),

    /// Generic backend error.
    #[error("{0}")]
    Other(String),
}

impl TaskError {
    /// Map to the error category recorded on the worker.
    pub fn kind(&self) -> WorkerErrorKind {
        match self {
            TaskError::Navigation(_) => WorkerErrorKind::Navigation,
            TaskError::Timeout(_) => WorkerErrorKind::Timeout,
            TaskError::Auth(_) => WorkerErrorKind::Auth,
            TaskError::Crash(_) => WorkerErrorKind::Crash,
            TaskError::Download(_) => WorkerErrorKind::Download,
            TaskError::Other(_) => WorkerErrorKind::Other,
        }
    }
}
