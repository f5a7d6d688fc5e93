//! Delivery status ingestion: normalization, journaling, and batch
//! processing of provider callbacks.

pub mod processor;
pub mod store;
pub mod types;

pub use processor::{ProcessedBatch, StatusEventProcessor};
pub use store::{mark_applied, mark_error, mark_unmatched, RecordedEvent, StatusEventStore};
pub use types::{extract_status_objects, now_ms, ApplyState, DeliveryStatus, StatusUpdate};
