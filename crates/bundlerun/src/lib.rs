//! bundlerun Library
//!
//! Runtime half of the relaunch helper:
//! - Named pipe creation and cleanup
//! - Cancellable stdio forwarding over named pipes
//! - Signal relay from the outer process to the child's process group
//! - Child launching, waiting and exit code propagation
//! - Terminal job control for a child in its own process group
//! - The startup entry point that ties the decision to a relaunch

#[cfg(not(unix))]
compile_error!("bundlerun relies on POSIX named pipes and process groups");

pub mod forward;
pub mod job;
pub mod launcher;
pub mod pipe;
pub mod relaunch;
pub mod signal;

pub use launcher::{LaunchError, Launcher, StdioStreams};
pub use relaunch::{BundleProvider, BundleTarget, PrebuiltBundle, ensure_bundled, relaunch_into};
