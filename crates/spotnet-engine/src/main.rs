//! Market binary for the spotnet parking simulation.
//!
//! This is the main entry point that wires together configuration,
//! record generation, and the market run. It negotiates every car once,
//! waits for every granted spot to be released, and reports the outcome.
//!
//! # Startup Sequence
//!
//! 1. Initialize structured logging (tracing)
//! 2. Load and validate configuration from `spotnet-config.yaml`
//! 3. Generate car and lot records
//! 4. Run the market
//! 5. Log the report and optionally write it as JSON

mod error;
mod spawner;

use std::path::{Path, PathBuf};

use spotnet_core::market::negotiation_budget;
use spotnet_core::{Market, MarketReport, MarketSettings, SimulationConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::error::EngineError;

/// Config file looked up in the working directory when no path is given.
const DEFAULT_CONFIG_PATH: &str = "spotnet-config.yaml";

/// Environment variable naming the config file.
const CONFIG_ENV_VAR: &str = "SPOTNET_CONFIG";

/// Application entry point for the market binary.
///
/// # Errors
///
/// Returns an error if configuration, generation, or the run fails.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("spotnet-engine starting");

    // 2. Load configuration.
    let config = load_config()?;
    config.validate().map_err(EngineError::from)?;
    info!(
        mode = ?config.generation.mode,
        reply_timeout_ms = config.protocol.reply_timeout_ms,
        simulated_seconds_per_hour = config.timing.simulated_seconds_per_hour,
        release_workers = config.timing.release_workers,
        stale_acceptance = ?config.protocol.stale_acceptance,
        "Configuration loaded"
    );

    // 3. Generate records.
    let records = spawner::spawn_records(&config.generation)?;

    // 4. Run the market.
    let settings = MarketSettings::from_config(&config);
    info!(
        cars = records.cars.len(),
        lots = records.lots.len(),
        worst_case_negotiation_secs = negotiation_budget(&settings, records.cars.len()).as_secs(),
        "Market starting"
    );
    let report = Market::new(settings)
        .run(records.cars, records.lots)
        .await
        .map_err(EngineError::from)?;

    // 5. Report.
    report.log_summary();
    if let Some(path) = &config.output.report_path {
        write_report(&report, path)?;
        info!(path = %path.display(), "Report written");
    }

    info!(
        balanced = report.is_balanced(),
        seed = ?records.seed,
        "spotnet-engine shutdown complete"
    );
    Ok(())
}

/// Load configuration from the first CLI argument, `SPOTNET_CONFIG`, or
/// `spotnet-config.yaml`, in that order.
///
/// An explicitly named file must exist; the default one may be absent, in
/// which case defaults are used.
fn load_config() -> Result<SimulationConfig, EngineError> {
    let explicit = std::env::args()
        .nth(1)
        .or_else(|| std::env::var(CONFIG_ENV_VAR).ok())
        .map(PathBuf::from);

    if let Some(path) = explicit {
        info!(path = %path.display(), "Loading configuration");
        return Ok(SimulationConfig::from_file(&path)?);
    }

    let default_path = Path::new(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        Ok(SimulationConfig::from_file(default_path)?)
    } else {
        info!("Config file not found, using defaults");
        Ok(SimulationConfig::default())
    }
}

fn write_report(report: &MarketReport, path: &Path) -> Result<(), EngineError> {
    let json = report.to_json().map_err(|e| EngineError::Report {
        message: format!("failed to serialize report: {e}"),
    })?;
    std::fs::write(path, json).map_err(|e| EngineError::Report {
        message: format!("failed to write {}: {e}", path.display()),
    })
}
