//! Persisted per-sender rate state.

use log::debug;
use sqlx::{Row, SqlitePool};

use crate::error_handling::DatabaseError;

/// One `rate_state` row: the shared, cross-process throttle state for a
/// single sender identity.
///
/// Created lazily on first read, mutated only by the throttle controller,
/// never deleted. After any mutation `min_mps <= target_mps <= max_mps`
/// holds.
#[derive(Debug, Clone)]
pub struct RateState {
    /// Sender identity (outbound phone number id) this state belongs to.
    pub sender_id: String,
    /// The current target send rate in messages per second.
    pub target_mps: i64,
    /// End of the post-violation cooldown window, epoch millis.
    pub cooldown_until_ms: Option<i64>,
    /// When the target was last raised, epoch millis.
    pub last_increase_at_ms: Option<i64>,
    /// When the target was last cut, epoch millis.
    pub last_decrease_at_ms: Option<i64>,
    /// Last mutation time, epoch millis.
    pub updated_at_ms: i64,
}

/// Loads the rate state for a sender, creating it with `start_mps` if absent.
///
/// The insert ignores conflicts so two racing first reads both end up with
/// the same persisted row.
pub async fn load_or_init(
    pool: &SqlitePool,
    sender_id: &str,
    start_mps: u32,
    now_ms: i64,
) -> Result<RateState, DatabaseError> {
    if let Some(state) = fetch(pool, sender_id).await? {
        return Ok(state);
    }

    debug!("Creating rate state for sender {sender_id} at {start_mps} MPS");
    sqlx::query(
        "INSERT INTO rate_state (sender_id, target_mps, updated_at_ms)
         VALUES (?, ?, ?)
         ON CONFLICT(sender_id) DO NOTHING",
    )
    .bind(sender_id)
    .bind(start_mps as i64)
    .bind(now_ms)
    .execute(pool)
    .await?;

    fetch(pool, sender_id)
        .await?
        .ok_or_else(|| DatabaseError::SqlError(sqlx::Error::RowNotFound))
}

async fn fetch(pool: &SqlitePool, sender_id: &str) -> Result<Option<RateState>, DatabaseError> {
    let row = sqlx::query(
        "SELECT sender_id, target_mps, cooldown_until_ms, last_increase_at_ms,
                last_decrease_at_ms, updated_at_ms
         FROM rate_state WHERE sender_id = ?",
    )
    .bind(sender_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| RateState {
        sender_id: row.get(0),
        target_mps: row.get(1),
        cooldown_until_ms: row.get(2),
        last_increase_at_ms: row.get(3),
        last_decrease_at_ms: row.get(4),
        updated_at_ms: row.get(5),
    }))
}

/// Persists a mutated rate state.
///
/// Plain read-modify-write: the control loop tolerates a lost increase (the
/// next stable batch retries it) and the decrease path is re-signalled by
/// the next violation, so no conditional write is needed here.
pub async fn save(pool: &SqlitePool, state: &RateState) -> Result<(), DatabaseError> {
    sqlx::query(
        "UPDATE rate_state
         SET target_mps = ?, cooldown_until_ms = ?, last_increase_at_ms = ?,
             last_decrease_at_ms = ?, updated_at_ms = ?
         WHERE sender_id = ?",
    )
    .bind(state.target_mps)
    .bind(state.cooldown_until_ms)
    .bind(state.last_increase_at_ms)
    .bind(state.last_decrease_at_ms)
    .bind(state.updated_at_ms)
    .bind(&state.sender_id)
    .execute(pool)
    .await?;
    Ok(())
}
