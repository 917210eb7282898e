//! `bundlerun` Core Library
//!
//! Shared functionality for the relaunch helper:
//! - Relaunch configuration and environment overrides
//! - The relaunch decision (already bundled, disabled, needs relaunch)
//! - Environment access that can be swapped out in tests
//! - Common error types and tracing setup

pub mod config;
pub mod decision;
pub mod env;
pub mod error;
pub mod tracing_init;

pub use config::{LaunchMode, RelaunchConfig};
pub use decision::{Decision, ProcessInfo, should_relaunch};
pub use env::{EnvAccessor, NO_RELAUNCH_ENV, ProcessEnv};
pub use error::{Error, Result};
