//! Error types for `bundlerun` core library.

use thiserror::Error;

/// Result type alias using `bundlerun` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `bundlerun` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The bundle collaborator could not produce a launch target
    #[error("Bundle error: {0}")]
    Bundle(String),
}
