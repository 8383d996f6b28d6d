use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bitswarm::Bitswarm;

mod config;
mod routes;

use config::Config;
use routes::{AppState, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::parse();

    let swarm = Arc::new(Bitswarm::new(config.swarm_options().await?).await?);
    let handle = swarm.start().await?;

    let app = router(AppState {
        swarm: Arc::clone(&swarm),
        trusted_headers: config.trusted_headers.clone().into(),
    });

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;

    tracing::info!(
        listen = %config.listen,
        backend = if config.redis_url.is_some() { "redis" } else { "local" },
        total_bits = *swarm.total_bits(),
        "Listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    handle.stop();
    tracing::info!("Stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?err, "Failed to listen for shutdown signal");
    }
}
