//! Reconciliation sweeper for unsettled status events.
//!
//! Events that arrived before their delivery record existed (or whose apply
//! attempt failed transiently) are parked in the journal; the sweeper
//! re-drives them through the same applier until they settle. A debounced
//! background worker collapses bursts of nudges into one sweep per window.

use log::{debug, info, warn};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::apply::{apply_status, ApplyOutcome};
use crate::config::{RECONCILE_DEBOUNCE, SWEEP_LIMIT};
use crate::error_handling::DatabaseError;
use crate::status_event::{mark_applied, mark_error, mark_unmatched, DeliveryStatus};

/// Accounting for one sweep pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub applied: usize,
    pub unmatched: usize,
    pub errored: usize,
}

/// Retries unsettled journal entries, newest first.
///
/// Entries still `pending` for sent or failed statuses are excluded: those
/// were attempted synchronously at ingestion and carry no counter side
/// effects worth re-driving. Unmatched and errored entries of any status
/// are retried.
pub async fn run_sweep(pool: &SqlitePool, limit: i64) -> Result<SweepReport, DatabaseError> {
    let rows = sqlx::query(
        "SELECT id, message_id, status, event_timestamp_ms, errors
         FROM status_events
         WHERE apply_state != 'applied'
           AND NOT (apply_state = 'pending' AND status IN ('sent', 'failed'))
         ORDER BY last_received_at_ms DESC
         LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut report = SweepReport::default();
    for row in rows {
        report.scanned += 1;
        let event_id: i64 = row.get(0);
        let message_id: String = row.get(1);
        let status_raw: String = row.get(2);
        let event_timestamp_ms: i64 = row.get(3);
        let errors: Option<String> = row.get(4);

        let status: DeliveryStatus = match status_raw.parse() {
            Ok(status) => status,
            Err(_) => {
                warn!("Journal entry {event_id} has unknown status '{status_raw}', parking it");
                mark_error(pool, event_id, "unknown status").await?;
                report.errored += 1;
                continue;
            }
        };
        let errors = errors.and_then(|raw| serde_json::from_str(&raw).ok());

        match apply_status(pool, &message_id, status, event_timestamp_ms, errors.as_ref()).await {
            Ok(ApplyOutcome::Applied) | Ok(ApplyOutcome::Noop) => {
                mark_applied(pool, event_id).await?;
                report.applied += 1;
            }
            Ok(ApplyOutcome::Unmatched) => {
                mark_unmatched(pool, event_id).await?;
                report.unmatched += 1;
            }
            Err(e) => {
                debug!("Sweep apply for event {event_id} failed: {e}");
                mark_error(pool, event_id, &e.to_string()).await?;
                report.errored += 1;
            }
        }
    }

    if report.scanned > 0 {
        info!(
            "Reconciliation sweep: {} scanned, {} applied, {} still unmatched, {} errored",
            report.scanned, report.applied, report.unmatched, report.errored
        );
    }
    Ok(report)
}

/// Handle for requesting a reconciliation sweep.
///
/// Nudges are fire-and-forget; a full queue means a sweep is already
/// scheduled, which is exactly what the caller wanted.
#[derive(Clone)]
pub struct ReconcileTrigger {
    tx: mpsc::Sender<()>,
}

impl ReconcileTrigger {
    pub fn nudge(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Spawns the debounced reconciliation worker.
///
/// After the first nudge the worker waits out the debounce window, drains
/// any further nudges that accumulated, and runs a single sweep. Cancel the
/// returned token to stop it.
pub fn start_reconcile_worker(pool: Arc<SqlitePool>) -> (ReconcileTrigger, CancellationToken) {
    start_reconcile_worker_with(pool, RECONCILE_DEBOUNCE, SWEEP_LIMIT)
}

pub fn start_reconcile_worker_with(
    pool: Arc<SqlitePool>,
    debounce: Duration,
    limit: i64,
) -> (ReconcileTrigger, CancellationToken) {
    let (tx, mut rx) = mpsc::channel::<()>(16);
    let shutdown = CancellationToken::new();
    let worker_shutdown = shutdown.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = worker_shutdown.cancelled() => break,
                received = rx.recv() => {
                    if received.is_none() {
                        break;
                    }
                }
            }

            tokio::select! {
                _ = worker_shutdown.cancelled() => break,
                _ = tokio::time::sleep(debounce) => {}
            }
            while rx.try_recv().is_ok() {}

            if let Err(e) = run_sweep(&pool, limit).await {
                warn!("Reconciliation sweep failed: {e}");
            }
        }
        debug!("Reconciliation worker stopped");
    });

    (ReconcileTrigger { tx }, shutdown)
}
