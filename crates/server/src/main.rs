// crates/server/src/main.rs
//! Casework server binary.
//!
//! Builds the job scheduler from the environment, then serves the HTTP
//! adapter until Ctrl-C.

use std::net::SocketAddr;

use anyhow::Result;
use casework_jobs::{Scheduler, SchedulerConfig};
use casework_server::{create_app, init_metrics, AppState};
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Default port for the server.
const DEFAULT_PORT: u16 = 47892;

/// Casework job server
#[derive(Parser, Debug)]
#[command(name = "casework")]
#[command(version)]
#[command(about = "Per-case background job scheduler with live updates", long_about = None)]
struct Cli {
    /// Port to listen on (falls back to CASEWORK_PORT, then PORT)
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Address to bind
    #[arg(short = 'H', long = "host", default_value = "127.0.0.1")]
    host: std::net::IpAddr,
}

/// Get the server port from the CLI, the environment, or the default.
fn get_port(cli: Option<u16>) -> u16 {
    cli.or_else(|| {
        std::env::var("CASEWORK_PORT")
            .ok()
            .or_else(|| std::env::var("PORT").ok())
            .and_then(|p| p.parse().ok())
    })
    .unwrap_or(DEFAULT_PORT)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,casework_jobs=info,casework_server=info".into()),
        )
        .init();

    init_metrics();

    let config = SchedulerConfig::from_env();
    tracing::info!(
        retention_secs = config.retention.as_secs(),
        event_capacity = config.event_capacity,
        "Scheduler configured"
    );
    let scheduler = Scheduler::new(config);
    let app = create_app(AppState::new(scheduler));

    let addr = SocketAddr::new(cli.host, get_port(cli.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Casework server listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
