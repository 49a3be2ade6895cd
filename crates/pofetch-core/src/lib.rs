//! # pofetch Core
//!
//! Shared task model, configuration, and boundary traits for the
//! persistent browser worker pool.
//!
//! ## Contents
//!
//! - `PoTask` and priority/status types
//! - `AutomationBackend` — the seam to the browser automation that
//!   actually drives a tab
//! - `SettlementHook` — the seam to external status persistence
//! - Pool and worker configuration with validation

pub mod backend;
pub mod config;
pub mod error;
pub mod task;

pub use backend::{AutomationBackend, BrowserLauncher, ProcessOutcome, SettlementHook};
pub use config::{PoolConfig, WorkerConfig, MAX_WORKERS, MIN_WORKERS};
pub use error::{ConfigError, TaskError, WorkerErrorKind};
pub use task::{PoTask, TaskPriority, TaskStatusCode};
