use std::net::SocketAddr;
use std::time::Duration;

use pipeline_rs::{api_router, AppState, Config, Pipeline};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().map_err(|e| anyhow::anyhow!("configuration: {e}"))?;

    let mut pipeline = Pipeline::assemble(&config)?;
    pipeline
        .start(Duration::from_secs(config.dead_letter_sweep_seconds))
        .await?;

    let app = api_router(AppState {
        bus: pipeline.bus.clone(),
        gateway: pipeline.gateway.clone(),
        agent: pipeline.agent.clone(),
        tracker: pipeline.tracker.clone(),
    });

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!(addr = %addr, "Pipeline listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    pipeline.shutdown().await?;
    Ok(())
}
