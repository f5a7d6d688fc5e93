//! Adaptive throughput controller.
//!
//! AIMD (Additive Increase / Multiplicative Decrease) over the persisted
//! per-sender [`RateState`]:
//!
//! - a batch with zero throughput rejections nudges the target up by 5%
//!   (at least 1 MPS), gated by the post-violation cooldown and a minimum
//!   gap between increases;
//! - a throughput rejection cuts the target to 60% unconditionally and
//!   starts the cooldown.
//!
//! Violations are expensive (the provider may penalize further), so the
//! decrease is fast and ignores all gating; headroom discovery is cheap, so
//! the increase is slow and suppressed after a violation. The asymmetry is
//! what keeps the loop from oscillating between overshoot and violation.

use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use sqlx::SqlitePool;

use crate::config::{RateConfig, DECREASE_RATIO, INCREASE_STEP_RATIO};
use crate::error_handling::DatabaseError;
use crate::throttle::state::{load_or_init, save};

/// Persisted AIMD controller for one sender identity.
///
/// State mutations are read-modify-write and deliberately not linearizable:
/// under concurrent callers a lost increase only delays ramp-up, and a lost
/// decrease is re-signalled by the next violation. The control loop is
/// self-correcting on the next cycle.
pub struct ThroughputController {
    pool: Arc<SqlitePool>,
    sender_id: String,
    config: RateConfig,
}

impl ThroughputController {
    /// Creates a controller for `sender_id` using an already-validated
    /// [`RateConfig`].
    pub fn new(pool: Arc<SqlitePool>, sender_id: impl Into<String>, config: RateConfig) -> Self {
        ThroughputController {
            pool,
            sender_id: sender_id.into(),
            config,
        }
    }

    /// Returns the current target MPS, lazily creating the state row.
    pub async fn current_target(&self) -> Result<u32, DatabaseError> {
        let state = load_or_init(
            &self.pool,
            &self.sender_id,
            self.config.start_mps,
            Utc::now().timestamp_millis(),
        )
        .await?;
        Ok(state.target_mps as u32)
    }

    /// Records a dispatch batch that completed with zero throughput
    /// rejections. Returns the (possibly unchanged) target.
    pub async fn record_stable_batch(&self) -> Result<u32, DatabaseError> {
        self.record_stable_batch_at(Utc::now().timestamp_millis())
            .await
    }

    /// Records a provider throughput-limit rejection. Returns the new target.
    pub async fn record_throughput_exceeded(&self) -> Result<u32, DatabaseError> {
        self.record_throughput_exceeded_at(Utc::now().timestamp_millis())
            .await
    }

    /// Clock-injectable form of [`Self::record_stable_batch`].
    ///
    /// The additive-increase half: no-op during cooldown and within the
    /// minimum inter-increase gap, otherwise +max(1, 5% of target), clamped.
    pub async fn record_stable_batch_at(&self, now_ms: i64) -> Result<u32, DatabaseError> {
        let mut state = load_or_init(
            &self.pool,
            &self.sender_id,
            self.config.start_mps,
            now_ms,
        )
        .await?;

        if let Some(cooldown_until) = state.cooldown_until_ms {
            if now_ms < cooldown_until {
                debug!(
                    "Throttle [{}]: in cooldown for another {}ms, holding target at {} MPS",
                    self.sender_id,
                    cooldown_until - now_ms,
                    state.target_mps
                );
                return Ok(state.target_mps as u32);
            }
        }

        let gap_ms = self.config.min_increase_gap_secs as i64 * 1000;
        if let Some(last_increase) = state.last_increase_at_ms {
            if now_ms - last_increase < gap_ms {
                debug!(
                    "Throttle [{}]: last increase {}ms ago (< {}ms gap), holding target at {} MPS",
                    self.sender_id,
                    now_ms - last_increase,
                    gap_ms,
                    state.target_mps
                );
                return Ok(state.target_mps as u32);
            }
        }

        let step = ((state.target_mps as f64 * INCREASE_STEP_RATIO).round() as i64).max(1);
        let new_target = clamp(
            state.target_mps + step,
            self.config.min_mps,
            self.config.max_mps,
        );
        if new_target != state.target_mps {
            info!(
                "Throttle [{}]: stable batch, raising target {} -> {} MPS",
                self.sender_id, state.target_mps, new_target
            );
        }
        state.target_mps = new_target;
        state.last_increase_at_ms = Some(now_ms);
        state.updated_at_ms = now_ms;
        save(&self.pool, &state).await?;
        Ok(state.target_mps as u32)
    }

    /// Clock-injectable form of [`Self::record_throughput_exceeded`].
    ///
    /// The multiplicative-decrease half: unconditional, ignores cooldown and
    /// gap gating, so it always wins over a concurrent increase attempt.
    pub async fn record_throughput_exceeded_at(&self, now_ms: i64) -> Result<u32, DatabaseError> {
        let mut state = load_or_init(
            &self.pool,
            &self.sender_id,
            self.config.start_mps,
            now_ms,
        )
        .await?;

        let new_target = clamp(
            (state.target_mps as f64 * DECREASE_RATIO).floor() as i64,
            self.config.min_mps,
            self.config.max_mps,
        );
        let cooldown_until = now_ms + self.config.cooldown_secs as i64 * 1000;
        warn!(
            "Throttle [{}]: throughput exceeded, cutting target {} -> {} MPS (cooldown {}s)",
            self.sender_id, state.target_mps, new_target, self.config.cooldown_secs
        );

        state.target_mps = new_target;
        state.cooldown_until_ms = Some(cooldown_until);
        state.last_decrease_at_ms = Some(now_ms);
        state.updated_at_ms = now_ms;
        save(&self.pool, &state).await?;
        Ok(state.target_mps as u32)
    }
}

fn clamp(value: i64, min_mps: u32, max_mps: u32) -> i64 {
    value.max(min_mps as i64).min(max_mps as i64)
}
