use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use superagent::Agent;

#[tokio::main]
async fn main() -> Result<()> {
    let config = superagent_config::load().context("failed to load agent configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "starting agent");

    let agent = Arc::new(Agent::bootstrap(config).await.context("failed to bootstrap agent")?);
    info!(agent_id = %agent.agent_id, "agent bootstrapped");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = agent.spawn_background_tasks(shutdown_rx.clone());

    let api_bind = agent.config.networking.bind.clone();
    let health_bind = agent.config.monitoring.bind.clone();
    let stop_timeout = Duration::from_secs(30);

    let api_listener = tokio::net::TcpListener::bind(&api_bind).await.with_context(|| format!("failed to bind local API to {api_bind}"))?;
    let health_listener = tokio::net::TcpListener::bind(&health_bind).await.with_context(|| format!("failed to bind health endpoint to {health_bind}"))?;

    let api_router = superagent_api::router(agent.api_state());
    let health_router = superagent_health::router(agent.metrics.clone(), agent.health.clone());

    let mut api_shutdown = shutdown_rx.clone();
    let api_server = tokio::spawn(async move {
        axum::serve(api_listener, api_router)
            .with_graceful_shutdown(async move {
                let _ = api_shutdown.changed().await;
            })
            .await
    });

    let mut health_shutdown = shutdown_rx.clone();
    let health_server = tokio::spawn(async move {
        axum::serve(health_listener, health_router)
            .with_graceful_shutdown(async move {
                let _ = health_shutdown.changed().await;
            })
            .await
    });

    info!(%api_bind, %health_bind, "local API and health endpoints listening");

    wait_for_termination().await;
    info!("shutdown signal received, draining in-flight pipeline work");

    let _ = shutdown_tx.send(true);
    agent.wait_for_pipelines_to_drain(stop_timeout).await;

    if let Err(e) = api_server.await {
        error!(error = %e, "local API server task panicked");
    }
    if let Err(e) = health_server.await {
        error!(error = %e, "health server task panicked");
    }
    for handle in background {
        if let Err(e) = handle.await {
            error!(error = %e, "background task panicked");
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_termination() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
