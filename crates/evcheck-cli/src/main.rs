mod config;
mod run;
mod verdict;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use evcheck_core::Shutdown;

#[derive(Parser)]
#[command(
    name = "evcheck",
    version,
    about = "Delivery verifier for HTTP event brokers: sends, receives, reconciles"
)]
struct Cli {
    /// Path to the TOML run configuration
    #[arg(long, env = "EVCHECK_CONFIG")]
    config: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let report = runtime.block_on(async {
        let shutdown = Shutdown::new();
        let on_signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, shutting down");
                on_signal.trigger();
            }
        });
        run::run(&config, shutdown).await
    })?;

    verdict::evaluate(&report, run::verdict_rules(&config))?;
    info!("run passed");
    Ok(())
}
