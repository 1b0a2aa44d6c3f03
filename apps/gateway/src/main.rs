use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::serve;
use hookgram_core::{ServiceRegistry, StorePool};
use hookgram_gateway::{AppState, GatewayConfig, build_router, open_store, spawn_correlation_purge};
use hookgram_telemetry::{TelemetryConfig, init_telemetry};
use tokio::net::TcpListener;
use tracing::{info, warn};

const PURGE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    init_telemetry(TelemetryConfig::from_env(
        "hookgram-gateway",
        env!("CARGO_PKG_VERSION"),
    ))?;

    let config = GatewayConfig::from_env()?;
    let pool = StorePool::new(open_store(&config)?, config.store_max_handles);
    let registry = Arc::new(ServiceRegistry::builder().build());
    if registry.is_empty() {
        warn!("no services registered; every delivery will be acknowledged without dispatch");
    }

    let purge = spawn_correlation_purge(pool.clone(), config.oauth_ttl, PURGE_INTERVAL);
    let addr = config.bind;
    let router = build_router(AppState::new(config, registry, pool.clone())?);
    let listener = TcpListener::bind(addr).await?;
    info!("hookgram-gateway listening on {}", addr);

    serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    purge.abort();
    pool.close();
    Ok(())
}
