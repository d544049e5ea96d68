use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use kadrion::config::RunConfig;

#[derive(Parser)]
#[command(
    name = "kadrion",
    about = "Ramp-up load generator for WebSocket, SSE, HLS and HTTP-FLV endpoints",
    version,
    long_about = None
)]
struct Cli {
    /// Run configuration (YAML, or TOML with a .toml extension)
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = RunConfig::load(&cli.config)
        .with_context(|| format!("error loading config {}", cli.config.display()))?;

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, winding down outstanding clients");
            interrupt.cancel();
        }
    });

    // The report itself is logged by the aggregator.
    kadrion::run_from_config(&config, cancel).await?;

    Ok(())
}
