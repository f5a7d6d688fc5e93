//! Campaign contact state applier.
//!
//! Applies one normalized delivery status to one recipient's delivery record
//! under the monotonic status order `pending < sent < delivered < read`,
//! with `failed` as a terminal overlay reachable from any non-terminal
//! state. The write is a conditional update (compare-and-swap against the
//! set of statuses the new one may supersede); campaign aggregate counters
//! are incremented only when that CAS actually changed a row. This
//! CAS-then-increment sequencing is what keeps the counters exact when the
//! same callback is delivered twice or two statuses for one message race.

use log::warn;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use strum_macros::{Display, EnumString};

use crate::error_handling::DatabaseError;
use crate::status_event::DeliveryStatus;

/// Status of a campaign contact delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ContactStatus {
    /// Queued; no callback applied yet.
    Pending,
    /// Provider accepted the message.
    Sent,
    /// Delivered to the device.
    Delivered,
    /// Read receipt applied.
    Read,
    /// Terminal failure overlay.
    Failed,
}

/// Outcome of applying one status to one delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The record advanced and any aggregate counter was incremented.
    Applied,
    /// No delivery record exists for the message id yet. A race with the
    /// outbound send persist, not an error; the sweeper retries it.
    Unmatched,
    /// The record was already at or past this status (duplicate or
    /// out-of-order callback), or a concurrent writer won the CAS.
    Noop,
}

/// Whether `new` may supersede `current`.
///
/// Pure and persistence-free so the ordering policy is testable on its own.
/// `failed` overrides any non-terminal state but never an existing `read`
/// or `failed`.
pub fn supersedes(new: DeliveryStatus, current: ContactStatus) -> bool {
    superseded_statuses(new).contains(&current)
}

/// The set of current statuses `new` may overwrite. Also the CAS guard set
/// for the conditional update.
fn superseded_statuses(new: DeliveryStatus) -> &'static [ContactStatus] {
    match new {
        DeliveryStatus::Sent => &[ContactStatus::Pending],
        DeliveryStatus::Delivered => &[ContactStatus::Pending, ContactStatus::Sent],
        DeliveryStatus::Read => &[
            ContactStatus::Pending,
            ContactStatus::Sent,
            ContactStatus::Delivered,
        ],
        DeliveryStatus::Failed => &[
            ContactStatus::Pending,
            ContactStatus::Sent,
            ContactStatus::Delivered,
        ],
    }
}

/// Applies `status` to the delivery record identified by `message_id`.
///
/// Looks the record up, checks the supersede predicate, then performs the
/// conditional update. Zero rows affected means a concurrent writer already
/// advanced the record: that is a [`ApplyOutcome::Noop`], never an error.
/// Exactly one row affected increments the matching campaign counter.
pub async fn apply_status(
    pool: &SqlitePool,
    message_id: &str,
    status: DeliveryStatus,
    event_timestamp_ms: i64,
    errors: Option<&Value>,
) -> Result<ApplyOutcome, DatabaseError> {
    let row = sqlx::query(
        "SELECT campaign_id, status FROM campaign_contacts WHERE message_id = ?",
    )
    .bind(message_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(ApplyOutcome::Unmatched);
    };
    let campaign_id: String = row.get(0);
    let current_raw: String = row.get(1);
    let current: ContactStatus = current_raw
        .parse()
        .map_err(|_| DatabaseError::InvalidStatus(current_raw))?;

    if !supersedes(status, current) {
        return Ok(ApplyOutcome::Noop);
    }

    let rows_affected = match status {
        DeliveryStatus::Sent => conditional_update(
            pool,
            "UPDATE campaign_contacts SET status = 'sent' WHERE message_id = ?",
            message_id,
            status,
            event_timestamp_ms,
            None,
        )
        .await?,
        DeliveryStatus::Delivered => conditional_update(
            pool,
            "UPDATE campaign_contacts SET status = 'delivered', delivered_at_ms = ? WHERE message_id = ?",
            message_id,
            status,
            event_timestamp_ms,
            None,
        )
        .await?,
        DeliveryStatus::Read => conditional_update(
            pool,
            "UPDATE campaign_contacts SET status = 'read', read_at_ms = ? WHERE message_id = ?",
            message_id,
            status,
            event_timestamp_ms,
            None,
        )
        .await?,
        DeliveryStatus::Failed => {
            let failure = FailureFields::from_errors(errors);
            conditional_update(
                pool,
                "UPDATE campaign_contacts
                 SET status = 'failed', failed_at_ms = ?, failure_code = ?, failure_title = ?, failure_details = ?
                 WHERE message_id = ?",
                message_id,
                status,
                event_timestamp_ms,
                Some(&failure),
            )
            .await?
        }
    };

    if rows_affected == 0 {
        // A concurrent writer advanced the record between our read and the
        // CAS; their increment already happened.
        return Ok(ApplyOutcome::Noop);
    }

    match status {
        DeliveryStatus::Delivered => {
            increment_counter(pool, &campaign_id, Counter::Delivered).await?
        }
        DeliveryStatus::Read => {
            increment_counter(pool, &campaign_id, Counter::Read).await?;
            backfill_delivered(pool, message_id, &campaign_id, event_timestamp_ms).await?;
        }
        DeliveryStatus::Failed => increment_counter(pool, &campaign_id, Counter::Failed).await?,
        DeliveryStatus::Sent => {}
    }

    Ok(ApplyOutcome::Applied)
}

/// Runs the conditional update with the CAS guard appended.
///
/// The guard re-states the supersede set in SQL (`AND status IN (...)`), so
/// the row only changes if it is still in a state the new status may
/// legally overwrite.
async fn conditional_update(
    pool: &SqlitePool,
    base_sql: &str,
    message_id: &str,
    status: DeliveryStatus,
    event_timestamp_ms: i64,
    failure: Option<&FailureFields>,
) -> Result<u64, DatabaseError> {
    let guard = guard_clause(status);
    let sql = format!("{base_sql} AND status IN ({guard})");

    let mut query = sqlx::query(&sql);
    if !matches!(status, DeliveryStatus::Sent) {
        query = query.bind(event_timestamp_ms);
    }
    if let Some(failure) = failure {
        query = query
            .bind(&failure.code)
            .bind(&failure.title)
            .bind(&failure.details);
    }
    let result = query.bind(message_id).execute(pool).await?;
    Ok(result.rows_affected())
}

fn guard_clause(status: DeliveryStatus) -> String {
    superseded_statuses(status)
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Best-effort `delivered_at` backfill when a read receipt arrives first.
///
/// A message cannot be read without having been delivered; when the backfill
/// itself changes a row the `delivered` aggregate is incremented too, which
/// preserves `delivered_count >= read_count`.
async fn backfill_delivered(
    pool: &SqlitePool,
    message_id: &str,
    campaign_id: &str,
    event_timestamp_ms: i64,
) -> Result<(), DatabaseError> {
    let result = sqlx::query(
        "UPDATE campaign_contacts SET delivered_at_ms = ? WHERE message_id = ? AND delivered_at_ms IS NULL",
    )
    .bind(event_timestamp_ms)
    .bind(message_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 1 {
        increment_counter(pool, campaign_id, Counter::Delivered).await?;
    }
    Ok(())
}

/// Marks a contact failed at send time, before any provider message id
/// exists. Same CAS-then-increment shape as the callback path: the counter
/// only moves if the row was still `pending`.
pub async fn mark_send_failed(
    pool: &SqlitePool,
    contact_id: i64,
    campaign_id: &str,
    reason: &str,
    now_ms: i64,
) -> Result<(), DatabaseError> {
    let result = sqlx::query(
        "UPDATE campaign_contacts
         SET status = 'failed', failed_at_ms = ?, failure_details = ?
         WHERE id = ? AND status = 'pending'",
    )
    .bind(now_ms)
    .bind(reason)
    .bind(contact_id)
    .execute(pool)
    .await?;
    if result.rows_affected() == 1 {
        increment_counter(pool, campaign_id, Counter::Failed).await?;
    }
    Ok(())
}

enum Counter {
    Delivered,
    Read,
    Failed,
}

/// Atomic per-campaign counter increment, creating the stats row on first
/// use.
async fn increment_counter(
    pool: &SqlitePool,
    campaign_id: &str,
    counter: Counter,
) -> Result<(), DatabaseError> {
    let sql = match counter {
        Counter::Delivered => {
            "INSERT INTO campaign_stats (campaign_id, delivered_count) VALUES (?, 1)
             ON CONFLICT(campaign_id) DO UPDATE SET delivered_count = delivered_count + 1"
        }
        Counter::Read => {
            "INSERT INTO campaign_stats (campaign_id, read_count) VALUES (?, 1)
             ON CONFLICT(campaign_id) DO UPDATE SET read_count = read_count + 1"
        }
        Counter::Failed => {
            "INSERT INTO campaign_stats (campaign_id, failed_count) VALUES (?, 1)
             ON CONFLICT(campaign_id) DO UPDATE SET failed_count = failed_count + 1"
        }
    };
    sqlx::query(sql).bind(campaign_id).execute(pool).await?;
    Ok(())
}

struct FailureFields {
    code: Option<String>,
    title: Option<String>,
    details: Option<String>,
}

impl FailureFields {
    /// Pulls `{code, title, details}` out of the provider error payload
    /// (first element when it is an array).
    fn from_errors(errors: Option<&Value>) -> FailureFields {
        let first = errors.and_then(|e| match e {
            Value::Array(items) => items.first(),
            other => Some(other),
        });
        let Some(first) = first else {
            return FailureFields {
                code: None,
                title: None,
                details: None,
            };
        };
        if !first.is_object() {
            warn!("Unexpected provider error payload shape: {first}");
        }
        FailureFields {
            code: first.get("code").map(|c| match c {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            title: first
                .get("title")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            details: first
                .pointer("/error_data/details")
                .or_else(|| first.get("details"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_helpers::{
        campaign_counts, contact_status, create_test_pool, seed_contact,
    };
    use serde_json::json;

    const TS: i64 = 1_724_800_000_000;

    #[test]
    fn test_supersede_predicate_total_order() {
        use ContactStatus::*;
        use DeliveryStatus as D;

        assert!(supersedes(D::Sent, Pending));
        assert!(!supersedes(D::Sent, Sent));
        assert!(!supersedes(D::Sent, Delivered));

        assert!(supersedes(D::Delivered, Pending));
        assert!(supersedes(D::Delivered, Sent));
        assert!(!supersedes(D::Delivered, Delivered));
        assert!(!supersedes(D::Delivered, Read));

        assert!(supersedes(D::Read, Delivered));
        assert!(!supersedes(D::Read, Read));

        // failed overlays any non-terminal state, once
        assert!(supersedes(D::Failed, Pending));
        assert!(supersedes(D::Failed, Sent));
        assert!(supersedes(D::Failed, Delivered));
        assert!(!supersedes(D::Failed, Failed));
        assert!(!supersedes(D::Failed, Read));
    }

    #[tokio::test]
    async fn test_unmatched_when_no_record_exists() {
        let pool = create_test_pool().await;
        let outcome = apply_status(&pool, "wamid.none", DeliveryStatus::Delivered, TS, None)
            .await
            .expect("Apply failed");
        assert_eq!(outcome, ApplyOutcome::Unmatched);
    }

    #[tokio::test]
    async fn test_delivered_applies_once() {
        let pool = create_test_pool().await;
        seed_contact(&pool, "camp-1", Some("wamid.1"), "15550001", "sent").await;

        let first = apply_status(&pool, "wamid.1", DeliveryStatus::Delivered, TS, None)
            .await
            .expect("Apply failed");
        assert_eq!(first, ApplyOutcome::Applied);

        // Identical redelivery: noop, counter stays at 1
        let second = apply_status(&pool, "wamid.1", DeliveryStatus::Delivered, TS, None)
            .await
            .expect("Apply failed");
        assert_eq!(second, ApplyOutcome::Noop);

        assert_eq!(campaign_counts(&pool, "camp-1").await, (1, 0, 0));
        assert_eq!(contact_status(&pool, "wamid.1").await, "delivered");
    }

    #[tokio::test]
    async fn test_read_before_delivered_backfills_both_counters() {
        let pool = create_test_pool().await;
        seed_contact(&pool, "camp-1", Some("wamid.2"), "15550002", "sent").await;

        let outcome = apply_status(&pool, "wamid.2", DeliveryStatus::Read, TS, None)
            .await
            .expect("Apply failed");
        assert_eq!(outcome, ApplyOutcome::Applied);

        assert_eq!(campaign_counts(&pool, "camp-1").await, (1, 1, 0));
        assert_eq!(contact_status(&pool, "wamid.2").await, "read");

        // The late delivered callback is stale: no change, no counters
        let late = apply_status(&pool, "wamid.2", DeliveryStatus::Delivered, TS, None)
            .await
            .expect("Apply failed");
        assert_eq!(late, ApplyOutcome::Noop);
        assert_eq!(campaign_counts(&pool, "camp-1").await, (1, 1, 0));
        assert_eq!(contact_status(&pool, "wamid.2").await, "read");
    }

    #[tokio::test]
    async fn test_read_after_delivered_does_not_double_count_delivered() {
        let pool = create_test_pool().await;
        seed_contact(&pool, "camp-1", Some("wamid.3"), "15550003", "sent").await;

        apply_status(&pool, "wamid.3", DeliveryStatus::Delivered, TS, None)
            .await
            .expect("Apply failed");
        apply_status(&pool, "wamid.3", DeliveryStatus::Read, TS + 1000, None)
            .await
            .expect("Apply failed");

        assert_eq!(campaign_counts(&pool, "camp-1").await, (1, 1, 0));
    }

    #[tokio::test]
    async fn test_failed_applies_once_and_records_failure_fields() {
        let pool = create_test_pool().await;
        seed_contact(&pool, "camp-1", Some("wamid.4"), "15550004", "sent").await;

        let errors = json!([{
            "code": 131026,
            "title": "Message undeliverable",
            "error_data": { "details": "Recipient is not a valid user" }
        }]);

        for _ in 0..3 {
            apply_status(&pool, "wamid.4", DeliveryStatus::Failed, TS, Some(&errors))
                .await
                .expect("Apply failed");
        }

        assert_eq!(campaign_counts(&pool, "camp-1").await, (0, 0, 1));
        assert_eq!(contact_status(&pool, "wamid.4").await, "failed");

        let row = sqlx::query("SELECT failure_code, failure_title, failure_details FROM campaign_contacts WHERE message_id = ?")
            .bind("wamid.4")
            .fetch_one(&pool)
            .await
            .expect("Failed to query failure fields");
        assert_eq!(row.get::<Option<String>, _>(0).as_deref(), Some("131026"));
        assert_eq!(
            row.get::<Option<String>, _>(1).as_deref(),
            Some("Message undeliverable")
        );
        assert_eq!(
            row.get::<Option<String>, _>(2).as_deref(),
            Some("Recipient is not a valid user")
        );
    }

    #[tokio::test]
    async fn test_failed_does_not_overwrite_read() {
        let pool = create_test_pool().await;
        seed_contact(&pool, "camp-1", Some("wamid.5"), "15550005", "read").await;

        let outcome = apply_status(&pool, "wamid.5", DeliveryStatus::Failed, TS, None)
            .await
            .expect("Apply failed");
        assert_eq!(outcome, ApplyOutcome::Noop);
        assert_eq!(contact_status(&pool, "wamid.5").await, "read");
        assert_eq!(campaign_counts(&pool, "camp-1").await, (0, 0, 0));
    }

    #[tokio::test]
    async fn test_sent_advances_pending_without_counters() {
        let pool = create_test_pool().await;
        seed_contact(&pool, "camp-1", Some("wamid.6"), "15550006", "pending").await;

        let outcome = apply_status(&pool, "wamid.6", DeliveryStatus::Sent, TS, None)
            .await
            .expect("Apply failed");
        assert_eq!(outcome, ApplyOutcome::Applied);
        assert_eq!(contact_status(&pool, "wamid.6").await, "sent");
        assert_eq!(campaign_counts(&pool, "camp-1").await, (0, 0, 0));
    }

    #[test]
    fn test_failure_fields_tolerate_odd_payloads() {
        let fields = FailureFields::from_errors(None);
        assert!(fields.code.is_none());

        let fields = FailureFields::from_errors(Some(&json!([])));
        assert!(fields.code.is_none() && fields.title.is_none());

        let fields = FailureFields::from_errors(Some(&json!({ "code": "X1", "title": "Nope" })));
        assert_eq!(fields.code.as_deref(), Some("X1"));
        assert_eq!(fields.title.as_deref(), Some("Nope"));
    }
}
