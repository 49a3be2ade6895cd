//! # pofetch Monitor
//!
//! Memory and process-liveness monitoring.
//!
//! A `ProcessProbe` abstracts `sysinfo` so tests can fake the system;
//! `MemoryMonitor` samples the system and every registered worker,
//! keeps bounded rolling histories, and maps three ordered memory
//! tiers to actions with independent cooldowns.

pub mod monitor;
pub mod probe;

pub use monitor::{MemoryAction, MemoryMonitor, MemoryReport, MonitorConfig, WorkerSample};
pub use probe::{ProcessProbe, SystemProbe};
