use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fanout_bus::{Bus, LocalBus, RedisBus};
use tokio::signal;
use tracing::info;

use crosstalk::cli::Cli;
use crosstalk::config::ServerConfig;
use crosstalk::hints::build_hint_store;
use crosstalk::registry::ConnectionRegistry;
use crosstalk::router::MessageRouter;
use crosstalk::telemetry::Telemetry;
use crosstalk::{app, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        standalone = config.standalone,
        "starting crosstalk relay"
    );

    let bus: Arc<dyn Bus> = if config.standalone {
        Arc::new(LocalBus::new())
    } else {
        Arc::new(
            RedisBus::connect(&config.redis_url)
                .await
                .context("failed to connect broadcast bus to redis")?,
        )
    };
    let hints =
        build_hint_store(config.standalone, &config.redis_url, config.hint_ttl_seconds).await;

    let registry = Arc::new(ConnectionRegistry::new());
    let router = MessageRouter::new(registry.clone(), bus);
    let ingest_tasks = router.spawn_bus_ingest();

    let state = AppState {
        registry,
        router: router.clone(),
        hints,
        metrics: Some(telemetry.metrics_handle()),
    };

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("crosstalk listening on {}", config.listen_addr);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; draining"
    );
    router.unsubscribe_all();
    for task in ingest_tasks {
        task.abort();
    }
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
