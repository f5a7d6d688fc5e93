//! Adaptive throughput control (the shared AIMD knob).
//!
//! The persisted counterpart to the in-process token bucket: per-sender
//! `rate_state` rows tuned by additive increase and multiplicative decrease,
//! driven by dispatch batch outcomes.

mod controller;
mod state;

pub use controller::ThroughputController;
pub use state::RateState;
