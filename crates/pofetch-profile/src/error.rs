//! Profile errors.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from profile creation and management.
#[derive(Debug, Error)]
pub enum ProfileError {
    /// Could not allocate a new profile directory.
    #[error("failed to create profile at {path}: {reason}")]
    CreationFailed { path: PathBuf, reason: String },

    /// No valid profile could be produced within the retry bound.
    #[error("no valid profile available after {attempts} attempts")]
    NoValidProfile { attempts: u32 },

    /// The profile pool is exhausted.
    #[error("profile limit reached ({limit})")]
    LimitReached { limit: usize },

    /// Clone source failed validation.
    #[error("clone source profile {0} is not usable")]
    CloneSourceInvalid(uuid::Uuid),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
