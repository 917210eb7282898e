//! Environment access.
//!
//! The relaunch decision and the config overrides are the only places that
//! look at the environment, and they do it through [`EnvAccessor`] so tests
//! can hand in a plain map.

use std::collections::HashMap;

/// Marker set in the child's environment before every relaunch. While it is
/// truthy the process never relaunches itself again.
pub const NO_RELAUNCH_ENV: &str = "BUNDLERUN_NO_RELAUNCH";

/// Read-only view of environment variables.
pub trait EnvAccessor {
    fn var(&self, key: &str) -> Option<String>;

    /// Whether `key` is set to a truthy value (see [`is_truthy`]).
    fn flag(&self, key: &str) -> bool {
        self.var(key).is_some_and(|v| is_truthy(&v))
    }
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvAccessor for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvAccessor for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// `1`, `true`, `yes` and `on` (any case, surrounding whitespace ignored).
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
