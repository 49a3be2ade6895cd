//! # pofetch Profile
//!
//! Disk-backed isolated browser identities.
//!
//! Each worker owns exactly one profile while it runs; the manager
//! hands profiles out, validates them on the way out, and destroys
//! corrupted or oversized ones on the way back in.

pub mod error;
pub mod manager;
pub mod profile;

pub use error::ProfileError;
pub use manager::{ProfileManager, ProfileManagerConfig};
pub use profile::{Profile, ProfileStatus};
