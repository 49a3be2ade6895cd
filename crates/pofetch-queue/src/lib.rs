//! # pofetch Queue
//!
//! Bounded priority+retry queue feeding the worker pool.
//!
//! Tasks are served lowest-priority-value first, FIFO within a
//! priority. Failed tasks re-enter at elevated priority after a retry
//! delay, up to `max_retries`; after that failure is terminal and the
//! task lands in the bounded failed archive with a reason.

pub mod error;
pub mod queue;
pub mod sink;

pub use error::QueueError;
pub use queue::{FailedTask, QueueConfig, QueueStats, TaskDisposition, TaskQueue};
pub use sink::TaskSink;
