//! Binary configuration: pool settings plus launcher and output knobs.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use pofetch_core::PoolConfig;

/// Top-level configuration file layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct Settings {
    /// Pool and worker settings.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Browser binary to launch per worker. Empty means no real
    /// browser is spawned and workers run against synthetic sessions.
    #[serde(default)]
    pub browser_command: String,

    /// Extra arguments passed to the browser binary.
    #[serde(default)]
    pub browser_args: Vec<String>,

    /// Default results file (JSON lines). The CLI `--output` flag
    /// overrides this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_file: Option<PathBuf>,

    /// Directory for rotated log files. Unset logs to console only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

impl Settings {
    /// Load settings from a TOML file, or defaults when `path` is
    /// `None`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let settings: Settings = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(settings)
    }
}
