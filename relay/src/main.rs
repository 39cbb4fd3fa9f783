//! Relay server entry point: loads the configuration, starts the pool
//! machinery, and serves the HTTP surface until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use tunnel_relay::config::Config;
use tunnel_relay::handlers;
use tunnel_relay::server::Server;

#[derive(Parser)]
#[command(name = "tunnel-relay", about = "Reverse-tunnel relay server")]
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
                .unwrap_or_else(|_| "tunnel_relay=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    if config.secret_key.is_empty() {
        warn!("no secret key configured, agent registration will be refused");
    }

    let addr = config.addr();
    let server = Server::new(config);
    server.start();

    let app = handlers::router(Arc::clone(&server));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("unable to bind {addr}"))?;
    info!("tunnel relay listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server failed")?;

    server.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
