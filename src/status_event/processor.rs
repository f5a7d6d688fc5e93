//! Webhook batch processing for delivery status callbacks.
//!
//! Record first, then apply: every accepted event is journaled before the
//! delivery record is touched, and each event settles independently so one
//! malformed or failing entry never blocks the rest of the batch.

use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use sqlx::SqlitePool;

use crate::apply::{apply_status, ApplyOutcome};
use crate::error_handling::DatabaseError;
use crate::status_event::store::{mark_applied, mark_error, mark_unmatched, StatusEventStore};
use crate::status_event::types::{extract_status_objects, ApplyState, StatusUpdate};
use crate::sweeper::ReconcileTrigger;

/// Per-batch accounting, reported to the caller and logged.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessedBatch {
    /// Events journaled (including replays of already seen events).
    pub accepted: usize,
    /// Entries dropped during normalization (unknown status, missing id).
    pub discarded: usize,
}

/// Drives status updates through the journal-then-apply pipeline.
pub struct StatusEventProcessor {
    pool: Arc<SqlitePool>,
    store: StatusEventStore,
    reconcile: Option<ReconcileTrigger>,
}

impl StatusEventProcessor {
    pub fn new(pool: Arc<SqlitePool>, reconcile: Option<ReconcileTrigger>) -> Self {
        let store = StatusEventStore::new(pool.clone());
        Self {
            pool,
            store,
            reconcile,
        }
    }

    /// Normalizes and processes every status object in a webhook payload.
    pub async fn process_webhook_payload(
        &self,
        payload: &Value,
    ) -> Result<ProcessedBatch, DatabaseError> {
        let mut batch = ProcessedBatch::default();
        for object in extract_status_objects(payload) {
            match StatusUpdate::parse(object) {
                Some(update) => {
                    self.process_update(&update).await?;
                    batch.accepted += 1;
                }
                None => {
                    batch.discarded += 1;
                }
            }
        }
        if batch.discarded > 0 {
            warn!(
                "Discarded {} malformed status entr{} in webhook batch",
                batch.discarded,
                if batch.discarded == 1 { "y" } else { "ies" }
            );
        }
        Ok(batch)
    }

    /// Processes one normalized update end to end.
    ///
    /// Databases without the journal table, and journal writes that fail at
    /// runtime, fall back to applying directly, losing replay protection but
    /// never dropping the callback.
    pub async fn process_update(&self, update: &StatusUpdate) -> Result<(), DatabaseError> {
        if !self.store.schema_ready().await {
            warn!(
                "Status event journal unavailable, applying {} for {} directly",
                update.status, update.message_id
            );
            return self.apply_directly(update).await;
        }

        let recorded = match self.store.record(update).await {
            Ok(recorded) => recorded,
            Err(e) => {
                warn!(
                    "Journaling {} for {} failed: {e}, applying directly",
                    update.status, update.message_id
                );
                return self.apply_directly(update).await;
            }
        };
        if recorded.apply_state == ApplyState::Applied {
            debug!(
                "Replay of settled event {} ({} for {}), skipping apply",
                recorded.id, update.status, update.message_id
            );
            return Ok(());
        }

        let result = apply_status(
            &self.pool,
            &update.message_id,
            update.status,
            update.event_timestamp_ms,
            update.errors.as_ref(),
        )
        .await;

        match result {
            Ok(ApplyOutcome::Applied) | Ok(ApplyOutcome::Noop) => {
                mark_applied(&self.pool, recorded.id).await?;
            }
            Ok(ApplyOutcome::Unmatched) => {
                debug!(
                    "No delivery record yet for {}, deferring event {} to reconciliation",
                    update.message_id, recorded.id
                );
                mark_unmatched(&self.pool, recorded.id).await?;
                self.nudge_reconciler();
            }
            Err(e) => {
                warn!(
                    "Applying {} for {} failed: {e}",
                    update.status, update.message_id
                );
                mark_error(&self.pool, recorded.id, &e.to_string()).await?;
                self.nudge_reconciler();
            }
        }
        Ok(())
    }

    async fn apply_directly(&self, update: &StatusUpdate) -> Result<(), DatabaseError> {
        apply_status(
            &self.pool,
            &update.message_id,
            update.status,
            update.event_timestamp_ms,
            update.errors.as_ref(),
        )
        .await?;
        Ok(())
    }

    fn nudge_reconciler(&self) {
        if let Some(trigger) = &self.reconcile {
            trigger.nudge();
        }
    }
}
