//! Startup entry point.
//!
//! Call [`ensure_bundled`] first thing in `main`. When the process is not
//! running from its bundle it is relaunched from there and this process exits
//! with the child's exit code; otherwise the decision is returned and the
//! program carries on.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use bundlerun_core::{
    Decision, EnvAccessor, Error, LaunchMode, ProcessInfo, RelaunchConfig, should_relaunch,
};
use tracing::{debug, warn};

use crate::launcher::Launcher;

/// Where to relaunch: the `.app` directory and the executable inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleTarget {
    pub app_path: PathBuf,
    pub executable: PathBuf,
}

impl BundleTarget {
    /// Target using the conventional `Contents/MacOS/<app name>` executable.
    pub fn from_app(app_path: impl Into<PathBuf>) -> Self {
        let app_path = app_path.into();
        let name = app_path.file_stem().map(ToOwned::to_owned).unwrap_or_default();
        let executable = app_path.join("Contents").join("MacOS").join(name);
        Self {
            app_path,
            executable,
        }
    }
}

/// Supplies the bundle to relaunch into. Building and signing bundles is
/// left to the implementor.
pub trait BundleProvider {
    fn bundle(&self, own_executable: &Path) -> bundlerun_core::Result<BundleTarget>;
}

/// A bundle that already exists on disk and contains a copy of (or link
/// to) the running executable under the same file name.
#[derive(Debug, Clone)]
pub struct PrebuiltBundle {
    app_path: PathBuf,
}

impl PrebuiltBundle {
    pub fn new(app_path: impl Into<PathBuf>) -> Self {
        Self {
            app_path: app_path.into(),
        }
    }
}

impl BundleProvider for PrebuiltBundle {
    fn bundle(&self, own_executable: &Path) -> bundlerun_core::Result<BundleTarget> {
        let name = own_executable.file_name().ok_or_else(|| {
            Error::Bundle(format!(
                "Executable path has no file name: {}",
                own_executable.display()
            ))
        })?;
        let executable = self.app_path.join("Contents").join("MacOS").join(name);
        if !executable.is_file() {
            return Err(Error::Bundle(format!(
                "{} does not contain {}",
                self.app_path.display(),
                executable.display()
            )));
        }
        Ok(BundleTarget {
            app_path: self.app_path.clone(),
            executable,
        })
    }
}

/// Relaunch from the bundle if needed.
///
/// Returns the decision when the program should simply continue
/// (`AlreadyBundled` or `RelaunchDisabled`). On `NeedsRelaunch` this does
/// not return: the process exits with the relaunched child's exit code.
/// Failing to obtain a bundle downgrades to `RelaunchDisabled`.
pub fn ensure_bundled(
    config: &RelaunchConfig,
    env: &dyn EnvAccessor,
    provider: &dyn BundleProvider,
) -> Decision {
    let config = config.clone().with_env_overrides(env);
    let info = ProcessInfo::current();
    let decision = should_relaunch(env, &info, &config);
    debug!(?decision, executable = ?info.executable, "Relaunch decision");

    let (Decision::NeedsRelaunch, Some(own_executable)) = (decision, info.executable) else {
        return decision;
    };
    let target = match provider.bundle(&own_executable) {
        Ok(target) => target,
        Err(e) => {
            warn!(error = %e, "No bundle to relaunch into, continuing unbundled");
            return Decision::RelaunchDisabled;
        }
    };

    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    relaunch_into(&config, &target, &args)
}

/// Relaunch into `target` with `args` using the configured mode. Never
/// returns.
pub fn relaunch_into(config: &RelaunchConfig, target: &BundleTarget, args: &[OsString]) -> ! {
    let launcher = Launcher::new(config.clone());
    match config.mode {
        LaunchMode::Direct => launcher.launch_and_exit(&target.executable, args),
        LaunchMode::Indirect => launcher.relaunch(&target.app_path, &target.executable, args),
    }
}
