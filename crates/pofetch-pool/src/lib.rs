//! # pofetch Pool
//!
//! The persistent worker pool: a supervisor owning a fixed set of
//! long-lived browser workers, each with its own isolated profile and
//! session, plus the machinery that keeps them healthy.
//!
//! ## Pieces
//!
//! - `Worker` — one profile + one session, pulling tasks
//! - `SignalHandler` — OS signal capture with emergency escalation
//! - shutdown phase machinery — five ordered, time-boxed phases
//! - `PersistentWorkerPool` — the orchestrator: monitor and
//!   maintenance loops, task distribution, and the crash-recovery
//!   cascade (restart, redistribute, fail with reason)

pub mod error;
pub mod pool;
pub mod shutdown;
pub mod signal;
pub mod status;
pub mod worker;

pub use error::PoolError;
pub use pool::{PersistentWorkerPool, PoolStatus};
pub use shutdown::{PhaseResult, ShutdownPhase, ShutdownReport};
pub use signal::{PoolSignal, SignalHandler};
pub use status::{PoolStatusReport, WorkerStatusReport};
pub use worker::{Worker, WorkerStatus};
