//! # pofetch Browser
//!
//! Session and tab lifecycle for one worker's browser process.
//!
//! A `BrowserSession` hosts a bounded set of `Tab`s under a single
//! profile. Tabs run one task at a time; the session tracks errors,
//! idle time, and uptime, and decides when it should be restarted.

pub mod error;
pub mod session;
pub mod tab;

pub use error::SessionError;
pub use session::{BrowserSession, ResourceSnapshot, SessionStatus};
pub use tab::{Tab, TabStatus};
