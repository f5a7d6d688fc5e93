//! Main application entry point (CLI binary).
//!
//! This is a thin wrapper around the `delivery_governor` library that
//! handles:
//! - Command-line argument parsing
//! - Environment variable loading (.env file)
//! - Logger initialization
//! - User-facing output formatting
//!
//! All core functionality is implemented in the library crate.

use anyhow::{Context, Result};
use clap::Parser;
use std::process;

use delivery_governor::logging::init_logger_with;
use delivery_governor::{run, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists). Allows
    // setting PROVIDER_API_TOKEN without exporting it manually.
    let _ = dotenvy::dotenv();

    let config = Config::parse();

    let log_level = config.log_level.clone();
    let log_format = config.log_format.clone();
    init_logger_with(log_level.into(), log_format).context("Failed to initialize logger")?;

    match run(config).await {
        Ok(report) => {
            if let Some(sweep) = report.sweep {
                println!(
                    "✅ Sweep finished: {} scanned, {} applied, {} unmatched, {} errored",
                    sweep.scanned, sweep.applied, sweep.unmatched, sweep.errored
                );
            } else {
                println!(
                    "✅ Dispatched {} contact{} ({} sent, {} failed), target now {} mps",
                    report.attempted,
                    if report.attempted == 1 { "" } else { "s" },
                    report.sent,
                    report.failed,
                    report.target_mps
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("delivery_governor error: {:#}", e);
            process::exit(1);
        }
    }
}
