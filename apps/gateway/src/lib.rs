//! Hookgram gateway: inbound webhook routing, OAuth callbacks and the Telegram
//! update endpoint, served over axum.

pub mod config;
pub mod http;
pub mod oauth;
pub mod rate;
pub mod reqid;
pub mod telegram;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use hookgram_core::{InMemoryStore, SqliteStore, StorePool, SubscriptionStore};
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub use config::{BotConfig, GatewayConfig, StoreBackend};
pub use http::{AppState, build_router};
pub use telegram::UpdateSink;

pub fn open_store(config: &GatewayConfig) -> anyhow::Result<Arc<dyn SubscriptionStore>> {
    Ok(match &config.store {
        StoreBackend::Memory => {
            info!("using in-memory subscription store");
            Arc::new(InMemoryStore::new())
        }
        StoreBackend::Sqlite(path) => {
            info!(path = %path.display(), "using sqlite subscription store");
            Arc::new(SqliteStore::open(path)?)
        }
    })
}

/// Periodically drops OAuth correlation records older than `ttl`.
pub fn spawn_correlation_purge(
    pool: StorePool,
    ttl: Duration,
    interval: StdDuration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let store = match pool.acquire().await {
                Ok(store) => store,
                Err(_) => return,
            };
            match store.purge_correlations(OffsetDateTime::now_utc() - ttl).await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "expired oauth correlations removed"),
                Err(err) => error!(error = %err, "correlation purge failed"),
            }
        }
    })
}
