//! Error type definitions.
//!
//! This module defines the typed errors used at the crate's boundaries:
//! initialization, database access, and configuration validation.

use log::SetLoggerError;
use thiserror::Error;

/// Error types for initialization failures.
#[derive(Error, Debug)]
pub enum InitializationError {
    /// Error initializing the logger.
    #[error("Logger initialization error: {0}")]
    LoggerError(#[from] SetLoggerError),

    /// Error initializing the HTTP provider client.
    #[error("Provider client initialization error: {0}")]
    ProviderClientError(String),
}

/// Error types for database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Error creating the database file.
    #[error("Database file creation error: {0}")]
    FileCreationError(String),

    /// SQL execution error.
    #[error("SQL error: {0}")]
    SqlError(#[from] sqlx::Error),

    /// A persisted status value could not be decoded into the internal enum.
    ///
    /// This indicates row corruption or a schema/code mismatch, not a caller
    /// error -- persisted statuses are always written from the enum.
    #[error("Unrecognized persisted status value: {0}")]
    InvalidStatus(String),
}

/// Error types for configuration resolution and validation.
///
/// Out-of-bounds rate values are rejected at the boundary rather than
/// silently clamped, so callers can always detect a bad configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A rate or throttle parameter fell outside its allowed bounds.
    #[error("{field} = {value} is out of bounds [{min}, {max}]")]
    OutOfBounds {
        /// Name of the offending configuration field.
        field: &'static str,
        /// The rejected value.
        value: i64,
        /// Inclusive lower bound.
        min: i64,
        /// Inclusive upper bound.
        max: i64,
    },

    /// A config-store or environment value could not be parsed.
    #[error("Invalid setting {key}={value}")]
    InvalidSetting {
        /// Setting key (config-store key or environment variable name).
        key: String,
        /// The unparseable value.
        value: String,
    },

    /// `min_mps` must not exceed `max_mps`.
    #[error("min_mps ({min_mps}) exceeds max_mps ({max_mps})")]
    InvertedBounds {
        /// Configured minimum MPS.
        min_mps: u32,
        /// Configured maximum MPS.
        max_mps: u32,
    },
}
