use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

mod config;
mod error;
mod lines;
mod rpc;
mod status;
mod store;

use config::Config;
use lines::LinesProvider;
use status::StatusState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    std::fs::create_dir_all(&config.data_dir)?;

    info!(host = %config.lines_host, api = %config.lines_api, "upstream source");
    info!(rpc = %config.rpc_addr, http = %config.http_addr, "listen addresses");

    let provider = LinesProvider::new(
        &config.tracked_lines()?,
        &config.lines_host,
        &config.lines_api,
        &config.data_dir,
    )
    .await?;

    let state = Arc::new(StatusState::new(
        Arc::clone(&provider),
        config.rpc_addr.clone(),
    ));
    let app = status::router(Arc::clone(&state));

    let listener = TcpListener::bind(&config.http_addr).await?;
    info!("status endpoint listening on http://{}", config.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown ordering: streams first, then pollers, then the store drain.
    state.stop_rpc().await;
    provider.shutdown().await;

    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("stop requested");
}
