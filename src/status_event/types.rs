//! Status event types and webhook payload parsing.

use chrono::Utc;
use log::debug;
use serde_json::Value;
use strum_macros::{Display, EnumIter, EnumString};

/// A delivery status reported by the provider.
///
/// Unrecognized provider status strings are rejected at the boundary and
/// never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
pub enum DeliveryStatus {
    /// Accepted by the provider for delivery.
    Sent,
    /// Delivered to the recipient's device.
    Delivered,
    /// Read receipt.
    Read,
    /// Delivery failed; the event carries the provider error payload.
    Failed,
}

/// Apply-state machine for a stored status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ApplyState {
    /// Stored, application not yet attempted or still in flight.
    Pending,
    /// Applied to the delivery record (or settled as a stale duplicate).
    Applied,
    /// No delivery record existed yet; the sweeper will retry.
    Unmatched,
    /// Application failed; the sweeper will retry.
    Error,
}

/// One normalized, validated status update from the provider.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    /// Provider message id the status refers to.
    pub message_id: String,
    /// Normalized status.
    pub status: DeliveryStatus,
    /// Event time parsed to epoch millis.
    pub event_timestamp_ms: i64,
    /// The provider's raw timestamp string. Part of the dedupe key: the
    /// provider's timestamp granularity is the only reliable disambiguator
    /// between a repeated callback and a fresh one.
    pub timestamp_raw: String,
    /// Provider recipient id, when present.
    pub recipient_id: Option<String>,
    /// Provider error payload, when present (usually on `failed`).
    pub errors: Option<Value>,
}

impl StatusUpdate {
    /// Parses a single provider status object.
    ///
    /// Returns `None` for anything missing or malformed; the caller discards
    /// that update and continues with the rest of the batch. Webhook input
    /// is provider-driven and untrusted, so this never errors loudly.
    pub fn parse(value: &Value) -> Option<StatusUpdate> {
        let message_id = value.get("id")?.as_str()?.to_string();
        if message_id.is_empty() {
            return None;
        }

        let status_raw = value.get("status")?.as_str()?;
        let status: DeliveryStatus = match status_raw.parse() {
            Ok(status) => status,
            Err(_) => {
                debug!("Discarding status update with unrecognized status '{status_raw}'");
                return None;
            }
        };

        // The provider sends epoch seconds as a string; tolerate a bare
        // number as well.
        let timestamp_field = value.get("timestamp")?;
        let timestamp_raw = match timestamp_field {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        let epoch_secs: i64 = match timestamp_raw.trim().parse() {
            Ok(secs) => secs,
            Err(_) => {
                debug!("Discarding status update with unparseable timestamp '{timestamp_raw}'");
                return None;
            }
        };
        let Some(event_timestamp_ms) = epoch_secs.checked_mul(1000) else {
            debug!("Discarding status update with out-of-range timestamp '{timestamp_raw}'");
            return None;
        };

        let recipient_id = value
            .get("recipient_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let errors = value.get("errors").filter(|v| !v.is_null()).cloned();

        Some(StatusUpdate {
            message_id,
            status,
            event_timestamp_ms,
            timestamp_raw,
            recipient_id,
            errors,
        })
    }

    /// The exactly-once storage key: `message_id:status:raw_timestamp`.
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}:{}", self.message_id, self.status, self.timestamp_raw)
    }

    /// Convenience constructor used by dispatch-side backfills and tests.
    pub fn new(message_id: impl Into<String>, status: DeliveryStatus, epoch_secs: i64) -> Self {
        StatusUpdate {
            message_id: message_id.into(),
            status,
            event_timestamp_ms: epoch_secs * 1000,
            timestamp_raw: epoch_secs.to_string(),
            recipient_id: None,
            errors: None,
        }
    }
}

/// Extracts the status objects from a webhook payload.
///
/// Accepts the provider's nested shape (`entry[].changes[].value.statuses`),
/// a flat `{ "statuses": [...] }`, or a bare array.
pub fn extract_status_objects(payload: &Value) -> Vec<&Value> {
    if let Some(array) = payload.as_array() {
        return array.iter().collect();
    }
    if let Some(array) = payload.get("statuses").and_then(|v| v.as_array()) {
        return array.iter().collect();
    }

    let mut statuses = Vec::new();
    if let Some(entries) = payload.get("entry").and_then(|v| v.as_array()) {
        for entry in entries {
            let Some(changes) = entry.get("changes").and_then(|v| v.as_array()) else {
                continue;
            };
            for change in changes {
                if let Some(array) = change
                    .pointer("/value/statuses")
                    .and_then(|v| v.as_array())
                {
                    statuses.extend(array.iter());
                }
            }
        }
    }
    statuses
}

/// Current epoch millis, the crate's persisted-time convention.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
