//! Assignment seam between the queue and whatever executes tasks.

use pofetch_core::PoTask;

/// A destination that can accept tasks during distribution.
///
/// Implemented by the pool's workers; tests use plain structs.
pub trait TaskSink: Send {
    /// Stable identifier of the sink.
    fn sink_id(&self) -> u32;

    /// Whether the sink can take a task right now.
    fn is_available(&self) -> bool;

    /// Current in-flight task count, used for least-loaded ordering.
    fn load(&self) -> usize;

    /// Accept a task. On refusal the task is handed back unchanged.
    fn try_assign(&mut self, task: PoTask) -> Result<(), PoTask>;
}
