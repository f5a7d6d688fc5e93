//! Configuration types and CLI options.
//!
//! This module defines the CLI configuration struct, logging enums, and the
//! runtime `RateConfig` that governs the throttle control loop.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::constants::{
    BATCH_SIZE_BOUNDS, COOLDOWN_BOUNDS, DB_PATH, DEFAULT_BATCH_SIZE, DEFAULT_COOLDOWN_SECS,
    DEFAULT_MAX_MPS, DEFAULT_MIN_INCREASE_GAP_SECS, DEFAULT_MIN_MPS, DEFAULT_SEND_CONCURRENCY,
    DEFAULT_SEND_FLOOR_DELAY_MS, DEFAULT_START_MPS, MPS_LOWER_BOUND, MPS_UPPER_BOUND,
    SEND_CONCURRENCY_BOUNDS, SEND_FLOOR_DELAY_BOUNDS,
};
use crate::error_handling::ConfigError;

/// Logging level for the application.
#[derive(Clone, Debug, ValueEnum)]
pub enum LogLevel {
    /// Only error messages
    Error,
    /// Error and warning messages
    Warn,
    /// Error, warning, and informational messages
    Info,
    /// All messages except trace
    Debug,
    /// All messages including trace
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(l: LogLevel) -> Self {
        match l {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

/// Log output format.
#[derive(Clone, Debug, ValueEnum)]
pub enum LogFormat {
    /// Human-readable format with colors (default)
    Plain,
    /// Structured JSON format for machine parsing
    Json,
}

/// Command-line configuration.
///
/// The binary either runs one dispatch batch for a campaign or, with
/// `--sweep`, a one-shot reconciliation pass over unapplied status events.
#[derive(Debug, Clone, Parser)]
#[command(name = "delivery_governor", about = "Adaptive dispatch pacing and delivery-status reconciliation")]
pub struct Config {
    /// Sender identity (outbound phone number id) to dispatch for
    #[arg(long, default_value = "default")]
    pub sender_id: String,

    /// Campaign to drain pending contacts from (all campaigns if omitted)
    #[arg(long)]
    pub campaign_id: Option<String>,

    /// Run a reconciliation sweep instead of dispatching
    #[arg(long)]
    pub sweep: bool,

    /// Database path (SQLite file)
    #[arg(long, default_value = DB_PATH)]
    pub db_path: PathBuf,

    /// Provider API base URL (falls back to PROVIDER_API_URL)
    #[arg(long)]
    pub provider_url: Option<String>,

    /// Provider API bearer token (falls back to PROVIDER_API_TOKEN)
    #[arg(long)]
    pub provider_token: Option<String>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Log format
    #[arg(long, value_enum, default_value = "plain")]
    pub log_format: LogFormat,
}

/// Runtime throttle configuration.
///
/// Resolved once per operation from the `settings` config store with
/// environment-variable fallback (see [`crate::config::load_rate_config`]),
/// and immutable for the duration of that operation.
#[derive(Debug, Clone)]
pub struct RateConfig {
    /// Master switch; when false the governor sends without pacing.
    pub enabled: bool,
    /// Number of concurrent dispatch workers (1-50).
    pub send_concurrency: usize,
    /// Maximum outbound messages drained per batch (1-200).
    pub batch_size: i64,
    /// Target rate seeded into fresh `rate_state` rows (1-1000).
    pub start_mps: u32,
    /// Ceiling for the adaptive target rate (1-1000).
    pub max_mps: u32,
    /// Floor for the adaptive target rate (1-1000).
    pub min_mps: u32,
    /// Cooldown after a throughput violation, seconds (1-600).
    pub cooldown_secs: u32,
    /// Minimum gap between two additive increases, seconds (1-600).
    pub min_increase_gap_secs: u32,
    /// Fixed delay after each send, milliseconds (0-5000).
    pub send_floor_delay_ms: u64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            send_concurrency: DEFAULT_SEND_CONCURRENCY,
            batch_size: DEFAULT_BATCH_SIZE,
            start_mps: DEFAULT_START_MPS,
            max_mps: DEFAULT_MAX_MPS,
            min_mps: DEFAULT_MIN_MPS,
            cooldown_secs: DEFAULT_COOLDOWN_SECS,
            min_increase_gap_secs: DEFAULT_MIN_INCREASE_GAP_SECS,
            send_floor_delay_ms: DEFAULT_SEND_FLOOR_DELAY_MS,
        }
    }
}

impl RateConfig {
    /// Validates every field against its bounds.
    ///
    /// Returns the first violation found. Values are never clamped here;
    /// rejecting keeps a bad configuration visible to the caller.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_bounds(
            "send_concurrency",
            self.send_concurrency as i64,
            SEND_CONCURRENCY_BOUNDS.0 as i64,
            SEND_CONCURRENCY_BOUNDS.1 as i64,
        )?;
        check_bounds(
            "batch_size",
            self.batch_size,
            BATCH_SIZE_BOUNDS.0,
            BATCH_SIZE_BOUNDS.1,
        )?;
        for (field, value) in [
            ("start_mps", self.start_mps),
            ("max_mps", self.max_mps),
            ("min_mps", self.min_mps),
        ] {
            check_bounds(
                field,
                value as i64,
                MPS_LOWER_BOUND as i64,
                MPS_UPPER_BOUND as i64,
            )?;
        }
        if self.min_mps > self.max_mps {
            return Err(ConfigError::InvertedBounds {
                min_mps: self.min_mps,
                max_mps: self.max_mps,
            });
        }
        if self.start_mps < self.min_mps || self.start_mps > self.max_mps {
            return Err(ConfigError::OutOfBounds {
                field: "start_mps",
                value: self.start_mps as i64,
                min: self.min_mps as i64,
                max: self.max_mps as i64,
            });
        }
        check_bounds(
            "cooldown_secs",
            self.cooldown_secs as i64,
            COOLDOWN_BOUNDS.0 as i64,
            COOLDOWN_BOUNDS.1 as i64,
        )?;
        check_bounds(
            "min_increase_gap_secs",
            self.min_increase_gap_secs as i64,
            COOLDOWN_BOUNDS.0 as i64,
            COOLDOWN_BOUNDS.1 as i64,
        )?;
        check_bounds(
            "send_floor_delay_ms",
            self.send_floor_delay_ms as i64,
            SEND_FLOOR_DELAY_BOUNDS.0 as i64,
            SEND_FLOOR_DELAY_BOUNDS.1 as i64,
        )?;
        Ok(())
    }
}

fn check_bounds(field: &'static str, value: i64, min: i64, max: i64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfBounds {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}
