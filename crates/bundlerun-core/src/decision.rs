//! Relaunch decision.
//!
//! Decides, from the environment and the current executable path, whether
//! this process must be re-executed from inside an application bundle.
//! The function is pure: callers gather the inputs once at startup.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use crate::config::RelaunchConfig;
use crate::env::{EnvAccessor, NO_RELAUNCH_ENV};

/// Outcome of [`should_relaunch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The executable already lives in `<X>.app/Contents/MacOS/`.
    AlreadyBundled,
    /// Relaunching is suppressed (marker set, disabled in config, or the
    /// inputs could not be determined).
    RelaunchDisabled,
    /// The process must be relaunched through the bundle.
    NeedsRelaunch,
}

/// Facts about the running process the decision depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    /// `None` when the executable path could not be determined.
    pub executable: Option<PathBuf>,
}

impl ProcessInfo {
    pub fn current() -> Self {
        let executable = match std::env::current_exe() {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "Could not determine current executable");
                None
            }
        };
        Self { executable }
    }

    pub fn with_executable(path: impl Into<PathBuf>) -> Self {
        Self {
            executable: Some(path.into()),
        }
    }
}

/// Decide whether to relaunch.
///
/// A truthy [`NO_RELAUNCH_ENV`] marker never yields `NeedsRelaunch`, which is
/// what keeps a relaunched child from relaunching again. Any missing input
/// also resolves to not relaunching.
pub fn should_relaunch(
    env: &dyn EnvAccessor,
    info: &ProcessInfo,
    config: &RelaunchConfig,
) -> Decision {
    if info.executable.as_deref().is_some_and(is_bundled) {
        return Decision::AlreadyBundled;
    }
    if env.flag(NO_RELAUNCH_ENV) || !config.enabled {
        return Decision::RelaunchDisabled;
    }
    if info.executable.is_none() {
        return Decision::RelaunchDisabled;
    }
    Decision::NeedsRelaunch
}

/// Whether `executable` sits directly in a bundle's `Contents/MacOS`.
pub fn is_bundled(executable: &Path) -> bool {
    bundle_root(executable).is_some()
}

/// The `.app` directory containing `executable`, if it is laid out as
/// `<X>.app/Contents/MacOS/<executable>`.
pub fn bundle_root(executable: &Path) -> Option<&Path> {
    let macos = executable.parent()?;
    if macos.file_name() != Some(OsStr::new("MacOS")) {
        return None;
    }
    let contents = macos.parent()?;
    if contents.file_name() != Some(OsStr::new("Contents")) {
        return None;
    }
    let app = contents.parent()?;
    let is_app = app
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("app"));
    is_app.then_some(app)
}
