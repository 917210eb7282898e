//! Relaunch configuration.
//!
//! Resolution order (lowest to highest):
//! 1. Built-in defaults
//! 2. Optional JSON file (`RelaunchConfig::from_json_file`)
//! 3. Environment variables (`RelaunchConfig::with_env_overrides`)
//! 4. CLI arguments (applied by the binary)
//!
//! The resolved value is passed explicitly into the launcher; no component
//! below the decision point reads the environment on its own.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::env::EnvAccessor;
use crate::error::{Error, Result};

pub const LAUNCH_MODE_ENV: &str = "BUNDLERUN_LAUNCH_MODE";
pub const TERMINATE_GRACE_ENV: &str = "BUNDLERUN_TERMINATE_GRACE";
pub const DISABLE_ENV: &str = "BUNDLERUN_DISABLE";
pub const PIPE_DIR_ENV: &str = "BUNDLERUN_PIPE_DIR";

/// How the bundled executable gets started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Spawn the executable inside the bundle as a direct child with
    /// inherited stdio.
    #[default]
    Direct,
    /// Go through the system `open` tool so LaunchServices starts the app;
    /// stdio crosses the boundary over named pipes.
    Indirect,
}

impl FromStr for LaunchMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "indirect" | "open" => Ok(Self::Indirect),
            other => Err(Error::Config(format!("Unknown launch mode: {other}"))),
        }
    }
}

/// Complete relaunch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaunchConfig {
    /// Master switch; when false the decision is always `RelaunchDisabled`.
    pub enabled: bool,
    pub mode: LaunchMode,
    /// Launch-indirection tool used by [`LaunchMode::Indirect`].
    pub open_program: PathBuf,
    /// Prefix for named pipe file names.
    pub pipe_prefix: String,
    /// Directory for named pipes. `None` means the system temp dir.
    pub pipe_dir: Option<PathBuf>,
    /// Seconds to wait after forwarding a termination signal before the
    /// child's process group is killed.
    pub terminate_grace_secs: u64,
    pub forward_signals: bool,
    /// Pass `-n` to the open tool so every relaunch gets a fresh instance.
    pub new_instance: bool,
}

impl Default for RelaunchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: LaunchMode::default(),
            open_program: PathBuf::from("/usr/bin/open"),
            pipe_prefix: "bundlerun".to_string(),
            pipe_dir: None,
            terminate_grace_secs: 5,
            forward_signals: true,
            new_instance: true,
        }
    }
}

impl RelaunchConfig {
    /// Load a config file. Missing keys keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Apply `BUNDLERUN_*` overrides. Unparseable values are logged and
    /// ignored.
    #[must_use]
    pub fn with_env_overrides(mut self, env: &dyn EnvAccessor) -> Self {
        if let Some(val) = env.var(LAUNCH_MODE_ENV) {
            match val.parse() {
                Ok(mode) => self.mode = mode,
                Err(e) => tracing::warn!(error = %e, "Ignoring {LAUNCH_MODE_ENV}"),
            }
        }
        if let Some(val) = env.var(TERMINATE_GRACE_ENV) {
            match val.trim().parse() {
                Ok(secs) => self.terminate_grace_secs = secs,
                Err(_) => tracing::warn!(value = %val, "Ignoring {TERMINATE_GRACE_ENV}"),
            }
        }
        if env.flag(DISABLE_ENV) {
            self.enabled = false;
        }
        if let Some(val) = env.var(PIPE_DIR_ENV).filter(|v| !v.is_empty()) {
            self.pipe_dir = Some(PathBuf::from(val));
        }
        self
    }

    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }

    /// Directory where named pipes are created.
    pub fn pipe_dir(&self) -> PathBuf {
        self.pipe_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}
