//! Session errors.

use thiserror::Error;
use uuid::Uuid;

/// Errors from session/tab operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session already hosts `max_tabs` tabs.
    #[error("session at tab capacity ({max_tabs})")]
    CapacityExceeded { max_tabs: usize },

    /// No tab with that ID.
    #[error("tab not found: {0}")]
    TabNotFound(Uuid),

    /// Every tab is busy.
    #[error("no tab available for assignment")]
    NoAvailableTab,

    /// The tab already has a task.
    #[error("tab {0} is already processing a task")]
    TabBusy(Uuid),

    /// The session is not in a state that accepts work.
    #[error("session is not active (status: {0})")]
    NotActive(String),
}
