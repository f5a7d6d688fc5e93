//! delivery_governor library: adaptive outbound pacing and delivery-status
//! reconciliation for a messaging provider.
//!
//! Three cooperating actors over one SQLite database:
//!
//! - a dispatch governor that paces concurrent sends through a token bucket
//!   limiter, whose target rate an AIMD controller adapts from provider
//!   throughput signals,
//! - a status-event pipeline that journals every delivery callback
//!   idempotently and applies it to per-recipient delivery records and
//!   campaign aggregates without double counting,
//! - a reconciliation sweeper that retries events which arrived before
//!   their delivery record existed.
//!
//! # Requirements
//!
//! This library requires a Tokio runtime. Use `#[tokio::main]` in your
//! application or ensure you're calling library functions within an async
//! context.

pub mod apply;
pub mod config;
pub mod dispatch;
mod error_handling;
pub mod limiter;
pub mod logging;
pub mod status_event;
pub mod storage;
pub mod sweeper;
pub mod throttle;

// Re-export public API
pub use config::{Config, LogFormat, LogLevel, RateConfig};
pub use error_handling::{ConfigError, DatabaseError, InitializationError};
pub use run::{run, RunReport};

// Internal run module (wires the components together for the CLI)
mod run {
    use anyhow::{Context, Result};
    use log::info;
    use std::sync::Arc;

    use crate::config::{load_rate_config, Config};
    use crate::dispatch::{DispatchGovernor, HttpProviderClient};
    use crate::storage::{init_db_pool_with_path, run_migrations};
    use crate::sweeper::{run_sweep, SweepReport};

    /// Summary of one CLI invocation, either a dispatch batch or a sweep.
    #[derive(Debug, Clone, Default)]
    pub struct RunReport {
        /// Contacts handed to sender workers this batch.
        pub attempted: usize,
        /// Sends the provider accepted.
        pub sent: usize,
        /// Sends that failed outright.
        pub failed: usize,
        /// Controller target after the batch (0 when pacing is disabled).
        pub target_mps: u32,
        /// Reconciliation outcome when `--sweep` was requested.
        pub sweep: Option<SweepReport>,
    }

    /// Runs one dispatch batch or one reconciliation sweep.
    pub async fn run(config: Config) -> Result<RunReport> {
        let pool = init_db_pool_with_path(&config.db_path)
            .await
            .context("Failed to initialize database pool")?;
        run_migrations(&pool)
            .await
            .context("Failed to run migrations")?;

        if config.sweep {
            let report = run_sweep(&pool, crate::config::SWEEP_LIMIT)
                .await
                .context("Reconciliation sweep failed")?;
            return Ok(RunReport {
                sweep: Some(report),
                ..Default::default()
            });
        }

        let rate_config = load_rate_config(&pool, &config.sender_id)
            .await
            .context("Failed to resolve throttle configuration")?;
        info!(
            "Dispatching for sender {} (target window {}-{} mps, concurrency {})",
            config.sender_id, rate_config.min_mps, rate_config.max_mps, rate_config.send_concurrency
        );

        let provider_url = config
            .provider_url
            .clone()
            .or_else(|| std::env::var("PROVIDER_API_URL").ok())
            .context("Provider API URL missing (--provider-url or PROVIDER_API_URL)")?;
        let provider_token = config
            .provider_token
            .clone()
            .or_else(|| std::env::var("PROVIDER_API_TOKEN").ok())
            .context("Provider API token missing (--provider-token or PROVIDER_API_TOKEN)")?;
        let body = std::env::var("CAMPAIGN_MESSAGE_BODY")
            .unwrap_or_else(|_| "You have a new message".to_string());
        let provider = Arc::new(
            HttpProviderClient::new(&provider_url, &config.sender_id, provider_token, body)
                .context("Failed to build provider client")?,
        );

        let governor = DispatchGovernor::new(
            Arc::clone(&pool),
            provider,
            rate_config,
            config.sender_id.clone(),
        );
        let report = governor
            .run_batch(config.campaign_id.as_deref())
            .await
            .context("Dispatch batch failed")?;

        Ok(RunReport {
            attempted: report.attempted,
            sent: report.sent,
            failed: report.failed,
            target_mps: report.target_mps,
            sweep: None,
        })
    }
}
