//! Bot worker: connects out to the API and answers its requests.
//!
//! Run with: cargo run -p botlink-worker
//!
//! Needs `API_WS_URL` and `API_WS_TOKEN`; without them the bridge stays off
//! and the process exits.

use std::sync::Arc;

use botlink_core::{BridgeConfig, ServerConfig};
use botlink_login::{LoginOrchestrator, REQUEST_LOGIN, storage::SqliteStore};
use botlink_transport::{EchoHandler, Router, RpcPeer, TransportManager};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let server = ServerConfig::from_env()?;
    let bridge = BridgeConfig::from_env()?;

    let store = Arc::new(SqliteStore::connect(&server.database_url).await?);
    tracing::info!("Using database {}", server.database_url);

    let mut router = Router::new();
    router
        .register(REQUEST_LOGIN, LoginOrchestrator::new(Arc::clone(&store), store))?
        .register("test", EchoHandler)?;
    let peer = RpcPeer::new(router);

    let Some(manager) = TransportManager::from_config(&bridge, peer) else {
        return Ok(());
    };
    let handle = manager.spawn();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
