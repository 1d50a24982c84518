use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use telemetry_store::router::build_router;
use telemetry_store::{AppState, StoreConfig};

#[derive(Parser, Debug)]
#[command(name = "telemetry-server", about = "Multi-tenant telemetry store")]
struct Args {
    /// Path to a TOML config file. Environment overrides still apply.
    #[arg(short, long, env = "TELEMETRY_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured bind address.
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,telemetry_store=debug")),
        )
        .init();

    let args = Args::parse();
    let mut config = StoreConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind_address = bind;
    }
    let bind_address = config.server.bind_address;

    let state = AppState::new(config).context("assembling application state")?;
    let shutdown = CancellationToken::new();

    let mut workers = state.rollup.spawn_schedulers(shutdown.clone());
    workers.push(state.retention.spawn_scheduler(shutdown.clone()));
    workers.push(state.alerts.spawn_scheduler(shutdown.clone()));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("binding {bind_address}"))?;
    info!(%bind_address, "telemetry store listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    info!("telemetry store stopped");
    Ok(())
}
