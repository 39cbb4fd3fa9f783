//! Agent entry point: loads the configuration, starts one pool per relay
//! target, and keeps them warm until interrupted.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use tunnel_agent::client::Client;
use tunnel_agent::config::Config;

#[derive(Parser)]
#[command(name = "tunnel-agent", about = "Reverse-tunnel agent")]
struct Cli {
    /// Configuration file path (YAML). Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_agent=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };

    info!(id = %config.id, targets = config.targets.len(), "starting tunnel agent");
    let client = Client::new(config);
    client.start();

    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down tunnel agent");
    client.shutdown().await;
    Ok(())
}
