//! Application configuration and constants.
//!
//! This module provides:
//! - Configuration constants (defaults, bounds, AIMD policy knobs)
//! - CLI option types and parsing
//! - Runtime `RateConfig` resolution from the config store

mod constants;
mod store;
mod types;

// Re-export all constants
pub use constants::*;
pub use store::load_rate_config;
pub use types::{Config, LogFormat, LogLevel, RateConfig};
