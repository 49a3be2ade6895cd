//! Profile pool management.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ProfileError;
use crate::profile::{Profile, ProfileStatus};

/// How many candidates `get_available` will validate before giving up.
const MAX_VALIDATION_ATTEMPTS: u32 = 3;

/// Marker file written into every profile root.
const MARKER_FILE: &str = "profile.json";

/// Profile manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileManagerConfig {
    /// Maximum profiles the manager will keep on disk.
    #[serde(default = "default_max_profiles")]
    pub max_profiles: usize,

    /// On-disk size above which a returned profile is destroyed
    /// instead of recycled (bytes).
    #[serde(default = "default_cleanup_threshold")]
    pub cleanup_size_threshold_bytes: u64,
}

fn default_max_profiles() -> usize {
    16
}

fn default_cleanup_threshold() -> u64 {
    512 * 1024 * 1024
}

impl Default for ProfileManagerConfig {
    fn default() -> Self {
        Self {
            max_profiles: default_max_profiles(),
            cleanup_size_threshold_bytes: default_cleanup_threshold(),
        }
    }
}

struct ManagerState {
    available: Vec<Profile>,
    in_use: HashSet<Uuid>,
}

/// Creates, validates, recycles, and destroys browser profiles.
pub struct ProfileManager {
    base_dir: PathBuf,
    config: ProfileManagerConfig,
    state: Mutex<ManagerState>,
    created: AtomicU64,
    corrupted: AtomicU64,
}

impl ProfileManager {
    /// Create a manager rooted at `base_dir`. Creates the directory if
    /// it does not exist.
    pub async fn new(
        base_dir: impl Into<PathBuf>,
        config: ProfileManagerConfig,
    ) -> Result<Self, ProfileError> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;

        Ok(Self {
            base_dir,
            config,
            state: Mutex::new(ManagerState {
                available: Vec::new(),
                in_use: HashSet::new(),
            }),
            created: AtomicU64::new(0),
            corrupted: AtomicU64::new(0),
        })
    }

    /// Allocate a fresh profile directory tree.
    pub async fn create(&self) -> Result<Profile, ProfileError> {
        {
            let state = self.state.lock().await;
            let total = state.available.len() + state.in_use.len();
            if total >= self.config.max_profiles {
                return Err(ProfileError::LimitReached {
                    limit: self.config.max_profiles,
                });
            }
        }

        let mut profile = Profile::new(PathBuf::new());
        profile.path = self.base_dir.join(format!("profile-{}", profile.id));

        self.materialize(&profile).await.map_err(|e| {
            ProfileError::CreationFailed {
                path: profile.path.clone(),
                reason: e.to_string(),
            }
        })?;

        self.created.fetch_add(1, Ordering::SeqCst);
        debug!("Created profile {} at {}", profile.id, profile.path.display());
        Ok(profile)
    }

    /// Get a validated profile marked `InUse`, creating one if none are
    /// free. Bounded retry over invalid candidates.
    pub async fn get_available(&self) -> Result<Profile, ProfileError> {
        for _attempt in 0..MAX_VALIDATION_ATTEMPTS {
            let candidate = {
                let mut state = self.state.lock().await;
                state.available.pop()
            };

            let mut profile = match candidate {
                Some(p) => p,
                None => self.create().await?,
            };

            if !self.validate(&profile).await {
                warn!("Profile {} failed validation, discarding", profile.id);
                profile.mark_corrupted();
                self.corrupted.fetch_add(1, Ordering::SeqCst);
                self.queue_cleanup(profile);
                continue;
            }

            profile.mark_in_use();
            let mut state = self.state.lock().await;
            state.in_use.insert(profile.id);
            return Ok(profile);
        }

        Err(ProfileError::NoValidProfile {
            attempts: MAX_VALIDATION_ATTEMPTS,
        })
    }

    /// Release a profile back to the pool. Corrupted or oversized
    /// profiles are destroyed instead of recycled.
    pub async fn return_profile(&self, mut profile: Profile, corrupted: bool) {
        {
            let mut state = self.state.lock().await;
            state.in_use.remove(&profile.id);
        }

        if corrupted {
            profile.mark_corrupted();
            self.corrupted.fetch_add(1, Ordering::SeqCst);
            info!("Profile {} returned corrupted, destroying", profile.id);
            self.queue_cleanup(profile);
            return;
        }

        profile.size_bytes = dir_size(&profile.path);
        if profile.size_bytes > self.config.cleanup_size_threshold_bytes {
            info!(
                "Profile {} grew to {} bytes, destroying instead of recycling",
                profile.id, profile.size_bytes
            );
            self.queue_cleanup(profile);
            return;
        }

        profile.status = ProfileStatus::Ready;
        let mut state = self.state.lock().await;
        state.available.push(profile);
    }

    /// Duplicate another profile's on-disk state into a new profile.
    pub async fn clone_profile(&self, source: &Profile) -> Result<Profile, ProfileError> {
        if !self.validate(source).await {
            return Err(ProfileError::CloneSourceInvalid(source.id));
        }

        let clone = self.create().await?;
        copy_tree(&source.path, &clone.path)?;

        // The clone keeps its own marker, not the source's.
        self.write_marker(&clone).await?;
        debug!("Cloned profile {} from {}", clone.id, source.id);
        Ok(clone)
    }

    /// `corrupted / created`, for observability.
    pub fn corruption_rate(&self) -> f64 {
        let created = self.created.load(Ordering::SeqCst);
        if created == 0 {
            return 0.0;
        }
        self.corrupted.load(Ordering::SeqCst) as f64 / created as f64
    }

    /// Total profiles ever created.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    /// Number of profiles currently free.
    pub async fn available_count(&self) -> usize {
        self.state.lock().await.available.len()
    }

    /// Destroy every free profile. In-use profiles are untouched.
    pub async fn cleanup_all(&self) -> Result<(), ProfileError> {
        let drained: Vec<Profile> = {
            let mut state = self.state.lock().await;
            state.available.drain(..).collect()
        };

        for profile in drained {
            if let Err(e) = tokio::fs::remove_dir_all(&profile.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove profile {}: {}", profile.id, e);
                }
            }
        }
        Ok(())
    }

    /// Directory tree + marker write for a new profile.
    async fn materialize(&self, profile: &Profile) -> Result<(), ProfileError> {
        tokio::fs::create_dir_all(profile.path.join("cache")).await?;
        tokio::fs::create_dir_all(profile.path.join("storage")).await?;
        self.write_marker(profile).await?;
        Ok(())
    }

    async fn write_marker(&self, profile: &Profile) -> Result<(), ProfileError> {
        let marker = serde_json::json!({
            "id": profile.id,
            "created_at": profile.created_at,
        });
        tokio::fs::write(
            profile.path.join(MARKER_FILE),
            serde_json::to_vec_pretty(&marker).unwrap_or_default(),
        )
        .await?;
        Ok(())
    }

    /// Integrity check: directory present and marker readable.
    async fn validate(&self, profile: &Profile) -> bool {
        tokio::fs::metadata(profile.path.join(MARKER_FILE))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Remove a profile's disk state off the caller's path.
    fn queue_cleanup(&self, profile: Profile) {
        tokio::spawn(async move {
            if let Err(e) = tokio::fs::remove_dir_all(&profile.path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Async cleanup of profile {} failed: {}", profile.id, e);
                }
            }
        });
    }
}

/// Recursive on-disk size. Returns 0 for missing paths.
fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    let mut total = 0;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            total += dir_size(&entry.path());
        } else {
            total += meta.len();
        }
    }
    total
}

/// Recursive directory copy.
fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.metadata()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn manager(dir: &TempDir) -> ProfileManager {
        ProfileManager::new(dir.path(), ProfileManagerConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_writes_marker() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        let profile = mgr.create().await.unwrap();
        assert!(profile.path.join(MARKER_FILE).is_file());
        assert!(profile.path.join("cache").is_dir());
        assert_eq!(mgr.created_count(), 1);
    }

    #[tokio::test]
    async fn test_get_available_marks_in_use() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        let profile = mgr.get_available().await.unwrap();
        assert_eq!(profile.status, ProfileStatus::InUse);
        assert_eq!(profile.use_count, 1);
    }

    #[tokio::test]
    async fn test_return_and_reuse() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        let profile = mgr.get_available().await.unwrap();
        let id = profile.id;
        mgr.return_profile(profile, false).await;
        assert_eq!(mgr.available_count().await, 1);

        let again = mgr.get_available().await.unwrap();
        assert_eq!(again.id, id);
        assert_eq!(again.use_count, 2);
    }

    #[tokio::test]
    async fn test_corrupted_profile_never_reused() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        let profile = mgr.get_available().await.unwrap();
        let id = profile.id;
        mgr.return_profile(profile, true).await;
        assert_eq!(mgr.available_count().await, 0);

        let next = mgr.get_available().await.unwrap();
        assert_ne!(next.id, id);
        assert!(mgr.corruption_rate() > 0.0);
    }

    #[tokio::test]
    async fn test_invalid_candidate_skipped() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        let profile = mgr.get_available().await.unwrap();
        let broken_id = profile.id;
        // Break it on disk, then hand it back as if it were healthy.
        std::fs::remove_file(profile.path.join(MARKER_FILE)).unwrap();
        mgr.return_profile(profile, false).await;

        let next = mgr.get_available().await.unwrap();
        assert_ne!(next.id, broken_id);
    }

    #[tokio::test]
    async fn test_profile_limit() {
        let dir = TempDir::new().unwrap();
        let mgr = ProfileManager::new(
            dir.path(),
            ProfileManagerConfig {
                max_profiles: 1,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let _held = mgr.get_available().await.unwrap();
        let result = mgr.get_available().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_clone_copies_tree() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        let source = mgr.create().await.unwrap();
        std::fs::write(source.path.join("cache").join("seed.txt"), b"cookies").unwrap();

        let clone = mgr.clone_profile(&source).await.unwrap();
        assert_ne!(clone.id, source.id);
        assert!(clone.path.join("cache").join("seed.txt").is_file());
    }

    #[tokio::test]
    async fn test_cleanup_all_removes_free_profiles() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir).await;

        let profile = mgr.get_available().await.unwrap();
        let path = profile.path.clone();
        mgr.return_profile(profile, false).await;

        mgr.cleanup_all().await.unwrap();
        assert!(!path.exists());
        assert_eq!(mgr.available_count().await, 0);
    }
}
