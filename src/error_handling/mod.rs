//! Error handling.
//!
//! Typed errors for the crate's boundaries:
//! - **InitializationError**: logger / provider client setup failures
//! - **DatabaseError**: pool creation and SQL execution failures
//! - **ConfigError**: rejected (never silently clamped) configuration values

mod types;

pub use types::{ConfigError, DatabaseError, InitializationError};
