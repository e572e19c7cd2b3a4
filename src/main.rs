//! healpool
//!
//! Runs a rebuild scenario described by a YAML file: create a pool, write
//! the configured datasets, fail ranks, rebuild, and verify every object.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use healpool::adapters::LoggingEventPublisher;
use healpool::{Config, ScenarioRunner};

// =============================================================================
// CLI Arguments
// =============================================================================

/// healpool - erasure-coded pools with self-healing rebuild
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario configuration (YAML); built-in defaults when absent
    #[arg(long, short, env = "HEALPOOL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the store directory from the configuration
    #[arg(long, env = "HEALPOOL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Print the Prometheus metrics after the run
    #[arg(long, env = "HEALPOOL_PRINT_METRICS")]
    print_metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            warn!("No configuration given, using defaults");
            Config::default()
        }
    };
    if let Some(dir) = args.data_dir.clone() {
        config.data_dir = Some(dir);
    }

    info!("Starting healpool scenario");
    info!("  Targets: {}", config.targets);
    info!("  Self-heal: {}", config.self_heal);
    info!("  Fail ranks: {:?}", config.fail_ranks);
    match &config.data_dir {
        Some(dir) => info!("  Stores: {}", dir.display()),
        None => info!("  Stores: in-memory"),
    }

    let runner = ScenarioRunner::new(config, Arc::new(LoggingEventPublisher::info_level()))
        .context("building scenario")?;
    let report = runner.run().await.context("running scenario")?;

    println!("{}", report);
    if args.print_metrics {
        println!("{}", runner.manager().metrics().gather_text()?);
    }

    if !report.is_success() {
        anyhow::bail!("scenario failed");
    }
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
