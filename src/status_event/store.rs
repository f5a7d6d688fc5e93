//! Persistent, idempotent status event journal.
//!
//! Every accepted callback is journaled before it is applied, keyed by a
//! deduplication key derived from the event itself. Replays land on the
//! existing row via `ON CONFLICT` and only touch bookkeeping columns, so
//! recording the same event twice can never produce two apply attempts'
//! worth of side effects.

use std::sync::Arc;

use log::debug;
use sqlx::{Row, SqlitePool};
use tokio::sync::OnceCell;

use crate::error_handling::DatabaseError;
use crate::status_event::types::{now_ms, ApplyState, StatusUpdate};

/// Result of journaling one event.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub id: i64,
    /// Apply state the row held when the insert/replay resolved. `Applied`
    /// here means a replay of an already settled event.
    pub apply_state: ApplyState,
}

/// Journal over the `status_events` table.
///
/// The schema probe result is cached for the lifetime of the store, so the
/// per-event fast path never hits `sqlite_master`.
pub struct StatusEventStore {
    pool: Arc<SqlitePool>,
    schema_ready: OnceCell<bool>,
}

impl StatusEventStore {
    pub fn new(pool: Arc<SqlitePool>) -> Self {
        Self {
            pool,
            schema_ready: OnceCell::new(),
        }
    }

    /// Whether the journal table exists in this database. Deployments that
    /// predate the journal migration degrade to direct apply.
    pub async fn schema_ready(&self) -> bool {
        *self
            .schema_ready
            .get_or_init(|| async {
                let probe = sqlx::query(
                    "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'status_events'",
                )
                .fetch_optional(self.pool.as_ref())
                .await;
                match probe {
                    Ok(row) => row.is_some(),
                    Err(e) => {
                        debug!("Status event schema probe failed: {e}");
                        false
                    }
                }
            })
            .await
    }

    /// Journals one event, replay-safe.
    ///
    /// A replay bumps `attempts` and `last_received_at_ms` on the existing
    /// row and leaves everything else untouched.
    pub async fn record(&self, update: &StatusUpdate) -> Result<RecordedEvent, DatabaseError> {
        let received_at = now_ms();
        let errors = update.errors.as_ref().map(|e| e.to_string());
        let row = sqlx::query(
            "INSERT INTO status_events
                 (message_id, status, event_timestamp_ms, event_timestamp_raw, dedupe_key,
                  recipient_id, errors, apply_state, applied, attempts, last_received_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', 0, 1, ?)
             ON CONFLICT(dedupe_key) DO UPDATE SET
                 last_received_at_ms = excluded.last_received_at_ms,
                 attempts = status_events.attempts + 1
             RETURNING id, apply_state",
        )
        .bind(&update.message_id)
        .bind(update.status.to_string())
        .bind(update.event_timestamp_ms)
        .bind(&update.timestamp_raw)
        .bind(update.dedupe_key())
        .bind(&update.recipient_id)
        .bind(errors)
        .bind(received_at)
        .fetch_one(self.pool.as_ref())
        .await?;

        let id: i64 = row.get(0);
        let state_raw: String = row.get(1);
        let apply_state = state_raw
            .parse()
            .map_err(|_| DatabaseError::InvalidStatus(state_raw))?;
        Ok(RecordedEvent { id, apply_state })
    }
}

/// Marks an event settled. Used both for real applies and for stale
/// duplicates that correctly changed nothing.
pub async fn mark_applied(pool: &SqlitePool, event_id: i64) -> Result<(), DatabaseError> {
    sqlx::query(
        "UPDATE status_events
         SET apply_state = 'applied', applied = 1, applied_at_ms = ?, apply_error = NULL,
             last_attempt_at_ms = ?
         WHERE id = ?",
    )
    .bind(now_ms())
    .bind(now_ms())
    .bind(event_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Marks an event as having no matching delivery record yet.
pub async fn mark_unmatched(pool: &SqlitePool, event_id: i64) -> Result<(), DatabaseError> {
    sqlx::query(
        "UPDATE status_events
         SET apply_state = 'unmatched', last_attempt_at_ms = ?
         WHERE id = ?",
    )
    .bind(now_ms())
    .bind(event_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Marks an event's apply attempt as failed, keeping the error text for
/// operators.
pub async fn mark_error(
    pool: &SqlitePool,
    event_id: i64,
    message: &str,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "UPDATE status_events
         SET apply_state = 'error', apply_error = ?, last_attempt_at_ms = ?
         WHERE id = ?",
    )
    .bind(message)
    .bind(now_ms())
    .bind(event_id)
    .execute(pool)
    .await?;
    Ok(())
}
