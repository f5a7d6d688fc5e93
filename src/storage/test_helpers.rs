//! Shared test helpers for database-backed tests.
//!
//! Provides in-memory pool setup with migrations applied and seed helpers
//! for campaign contact rows.

#[cfg(test)]
use sqlx::sqlite::SqlitePoolOptions;
#[cfg(test)]
use sqlx::{Row, SqlitePool};

#[cfg(test)]
use crate::storage::run_migrations;

/// Creates a test database pool with migrations applied.
///
/// Uses a single-connection in-memory database so every query in a test sees
/// the same database.
#[cfg(test)]
pub async fn create_test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test database pool");
    run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// Inserts a campaign contact delivery record and returns its id.
#[cfg(test)]
pub async fn seed_contact(
    pool: &SqlitePool,
    campaign_id: &str,
    message_id: Option<&str>,
    phone: &str,
    status: &str,
) -> i64 {
    sqlx::query(
        "INSERT INTO campaign_contacts (campaign_id, message_id, phone, status)
         VALUES (?, ?, ?, ?)
         RETURNING id",
    )
    .bind(campaign_id)
    .bind(message_id)
    .bind(phone)
    .bind(status)
    .fetch_one(pool)
    .await
    .expect("Failed to insert test contact")
    .get::<i64, _>(0)
}

/// Reads the `(delivered, read, failed)` aggregate counters for a campaign.
///
/// Returns zeros when no stats row exists yet.
#[cfg(test)]
pub async fn campaign_counts(pool: &SqlitePool, campaign_id: &str) -> (i64, i64, i64) {
    let row = sqlx::query(
        "SELECT delivered_count, read_count, failed_count FROM campaign_stats WHERE campaign_id = ?",
    )
    .bind(campaign_id)
    .fetch_optional(pool)
    .await
    .expect("Failed to query campaign stats");
    match row {
        Some(row) => (row.get(0), row.get(1), row.get(2)),
        None => (0, 0, 0),
    }
}

/// Reads the current status of a contact row by message id.
#[cfg(test)]
pub async fn contact_status(pool: &SqlitePool, message_id: &str) -> String {
    sqlx::query("SELECT status FROM campaign_contacts WHERE message_id = ?")
        .bind(message_id)
        .fetch_one(pool)
        .await
        .expect("Failed to query contact status")
        .get::<String, _>(0)
}
