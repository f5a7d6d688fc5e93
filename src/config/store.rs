//! Runtime configuration resolution.
//!
//! `RateConfig` is resolved per operation: config-store (`settings` table)
//! values take precedence, environment variables are the fallback, constants
//! the final default. Per-sender keys (`throttle.<sender>.<field>`) override
//! the global keys (`throttle.<field>`).

use std::collections::HashMap;
use std::str::FromStr;

use log::warn;
use sqlx::{Row, SqlitePool};

use crate::config::types::RateConfig;
use crate::error_handling::ConfigError;

/// Loads and validates the throttle configuration for one sender identity.
///
/// Values are resolved in precedence order: per-sender config-store key,
/// global config-store key, environment variable, built-in default. A value
/// that parses but fails bounds validation is a hard [`ConfigError`] -- bad
/// configuration is surfaced, never silently clamped.
pub async fn load_rate_config(
    pool: &SqlitePool,
    sender_id: &str,
) -> Result<RateConfig, ConfigError> {
    let settings = fetch_throttle_settings(pool).await;
    let defaults = RateConfig::default();

    let config = RateConfig {
        enabled: resolve(&settings, sender_id, "enabled", "THROTTLE_ENABLED")?
            .unwrap_or(defaults.enabled),
        send_concurrency: resolve(
            &settings,
            sender_id,
            "send_concurrency",
            "THROTTLE_SEND_CONCURRENCY",
        )?
        .unwrap_or(defaults.send_concurrency),
        batch_size: resolve(&settings, sender_id, "batch_size", "THROTTLE_BATCH_SIZE")?
            .unwrap_or(defaults.batch_size),
        start_mps: resolve(&settings, sender_id, "start_mps", "THROTTLE_START_MPS")?
            .unwrap_or(defaults.start_mps),
        max_mps: resolve(&settings, sender_id, "max_mps", "THROTTLE_MAX_MPS")?
            .unwrap_or(defaults.max_mps),
        min_mps: resolve(&settings, sender_id, "min_mps", "THROTTLE_MIN_MPS")?
            .unwrap_or(defaults.min_mps),
        cooldown_secs: resolve(&settings, sender_id, "cooldown_secs", "THROTTLE_COOLDOWN_SECS")?
            .unwrap_or(defaults.cooldown_secs),
        min_increase_gap_secs: resolve(
            &settings,
            sender_id,
            "min_increase_gap_secs",
            "THROTTLE_MIN_INCREASE_GAP_SECS",
        )?
        .unwrap_or(defaults.min_increase_gap_secs),
        send_floor_delay_ms: resolve(
            &settings,
            sender_id,
            "send_floor_delay_ms",
            "THROTTLE_SEND_FLOOR_DELAY_MS",
        )?
        .unwrap_or(defaults.send_floor_delay_ms),
    };

    config.validate()?;
    Ok(config)
}

/// Fetches all `throttle.*` rows from the config store.
///
/// A failed query (e.g. settings table not yet migrated) degrades to the
/// environment/default fallback chain rather than failing the operation.
async fn fetch_throttle_settings(pool: &SqlitePool) -> HashMap<String, String> {
    match sqlx::query("SELECT key, value FROM settings WHERE key LIKE 'throttle.%'")
        .fetch_all(pool)
        .await
    {
        Ok(rows) => rows
            .into_iter()
            .map(|row| (row.get::<String, _>(0), row.get::<String, _>(1)))
            .collect(),
        Err(e) => {
            warn!("Config store unavailable, falling back to environment defaults: {e}");
            HashMap::new()
        }
    }
}

/// Resolves one field through the precedence chain.
///
/// Returns `Ok(None)` when no source provides a value.
fn resolve<T: FromStr>(
    settings: &HashMap<String, String>,
    sender_id: &str,
    field: &str,
    env_var: &str,
) -> Result<Option<T>, ConfigError> {
    let per_sender_key = format!("throttle.{sender_id}.{field}");
    let global_key = format!("throttle.{field}");

    if let Some(value) = settings.get(&per_sender_key) {
        return parse_setting(&per_sender_key, value).map(Some);
    }
    if let Some(value) = settings.get(&global_key) {
        return parse_setting(&global_key, value).map(Some);
    }
    if let Ok(value) = std::env::var(env_var) {
        return parse_setting(env_var, &value).map(Some);
    }
    Ok(None)
}

fn parse_setting<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidSetting {
            key: key.to_string(),
            value: value.to_string(),
        })
}
