//! Configuration constants.
//!
//! Defaults and bounds for the throttle control loop, the status-event
//! pipeline, and the dispatch governor.

use std::time::Duration;

/// Default SQLite database path.
pub const DB_PATH: &str = "./delivery_governor.db";

// Throttle bounds. Rates outside these are rejected at construction/update,
// never silently clamped.
/// Lowest permitted messages-per-second value.
pub const MPS_LOWER_BOUND: u32 = 1;
/// Highest permitted messages-per-second value.
pub const MPS_UPPER_BOUND: u32 = 1000;
/// Bounds for `send_concurrency`.
pub const SEND_CONCURRENCY_BOUNDS: (usize, usize) = (1, 50);
/// Bounds for `batch_size`.
pub const BATCH_SIZE_BOUNDS: (i64, i64) = (1, 200);
/// Bounds for `cooldown_secs` and `min_increase_gap_secs`.
pub const COOLDOWN_BOUNDS: (u32, u32) = (1, 600);
/// Bounds for `send_floor_delay_ms`.
pub const SEND_FLOOR_DELAY_BOUNDS: (u64, u64) = (0, 5000);

// Throttle defaults.
/// Default starting target rate for a sender with no persisted state.
pub const DEFAULT_START_MPS: u32 = 10;
/// Default ceiling for the adaptive target rate.
pub const DEFAULT_MAX_MPS: u32 = 80;
/// Default floor for the adaptive target rate.
pub const DEFAULT_MIN_MPS: u32 = 1;
/// Default number of concurrent dispatch workers.
pub const DEFAULT_SEND_CONCURRENCY: usize = 5;
/// Default dispatch batch size.
pub const DEFAULT_BATCH_SIZE: i64 = 50;
/// Default cooldown after a throughput violation, in seconds.
pub const DEFAULT_COOLDOWN_SECS: u32 = 30;
/// Default minimum gap between two additive increases, in seconds.
pub const DEFAULT_MIN_INCREASE_GAP_SECS: u32 = 10;
/// Default per-send floor delay, in milliseconds (0 = none).
pub const DEFAULT_SEND_FLOOR_DELAY_MS: u64 = 0;

// AIMD policy. Increases are slow and gated; decreases are fast and
// unconditional, so a violation always wins over a concurrent increase.
/// Additive-increase step as a fraction of the current target (5%).
pub const INCREASE_STEP_RATIO: f64 = 0.05;
/// Multiplicative-decrease factor applied on a throughput violation.
pub const DECREASE_RATIO: f64 = 0.6;

/// The provider error code that signals a throughput-limit rejection.
///
/// This is the sole trigger for the multiplicative-decrease path; every
/// other send failure is an ordinary error, not a control signal.
pub const THROUGHPUT_EXCEEDED_ERROR_CODE: i64 = 130_429;

// Token bucket refill.
/// Refill ticker interval. Fractional tokens accumulate between ticks so
/// low rates do not lose precision.
pub const REFILL_TICK: Duration = Duration::from_millis(100);

/// Dispatch progress is logged every this many completed sends.
pub const DISPATCH_PROGRESS_INTERVAL: usize = 10;

// Reconciliation.
/// Maximum events examined per sweep.
pub const SWEEP_LIMIT: i64 = 200;
/// Debounce window for coalescing reconcile nudges. A burst of unmatched
/// events inside one window produces one sweep, not one per event.
pub const RECONCILE_DEBOUNCE: Duration = Duration::from_secs(2);
