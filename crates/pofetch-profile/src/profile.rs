//! Profile data model.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Profile lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileStatus {
    /// Validated and available for assignment.
    Ready,
    /// Exclusively owned by one worker.
    InUse,
    /// Failed an integrity check; will never be reused.
    Corrupted,
    /// Queued for disk removal.
    CleaningUp,
}

/// An isolated, disk-backed browser identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    /// Unique profile ID.
    pub id: Uuid,
    /// Root of the profile's directory tree.
    pub path: PathBuf,
    /// Lifecycle status.
    pub status: ProfileStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last assignment time.
    pub last_used_at: DateTime<Utc>,
    /// Number of times this profile has been assigned.
    pub use_count: u64,
    /// Integrity-check failures observed on this profile.
    pub corruption_count: u32,
    /// On-disk size at last measurement (bytes).
    pub size_bytes: u64,
    /// Free-form extension data.
    pub metadata: HashMap<String, String>,
}

impl Profile {
    /// Create a profile record rooted at `path`. Does not touch disk.
    pub fn new(path: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            path,
            status: ProfileStatus::Ready,
            created_at: now,
            last_used_at: now,
            use_count: 0,
            corruption_count: 0,
            size_bytes: 0,
            metadata: HashMap::new(),
        }
    }

    /// Mark the profile as assigned to a worker.
    pub fn mark_in_use(&mut self) {
        self.status = ProfileStatus::InUse;
        self.use_count += 1;
        self.last_used_at = Utc::now();
    }

    /// Mark the profile corrupted.
    pub fn mark_corrupted(&mut self) {
        self.status = ProfileStatus::Corrupted;
        self.corruption_count += 1;
    }

    /// Whether the profile may be handed to a worker.
    pub fn is_assignable(&self) -> bool {
        self.status == ProfileStatus::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_profile_is_assignable() {
        let profile = Profile::new(PathBuf::from("/tmp/p"));
        assert!(profile.is_assignable());
        assert_eq!(profile.use_count, 0);
    }

    #[test]
    fn test_mark_in_use() {
        let mut profile = Profile::new(PathBuf::from("/tmp/p"));
        profile.mark_in_use();
        assert_eq!(profile.status, ProfileStatus::InUse);
        assert_eq!(profile.use_count, 1);
        assert!(!profile.is_assignable());
    }

    #[test]
    fn test_mark_corrupted() {
        let mut profile = Profile::new(PathBuf::from("/tmp/p"));
        profile.mark_corrupted();
        assert_eq!(profile.status, ProfileStatus::Corrupted);
        assert_eq!(profile.corruption_count, 1);
        assert!(!profile.is_assignable());
    }
}
