//! API server: login endpoints plus the bridge the bot connects to.
//!
//! Run with: cargo run -p botlink-api-server
//!
//! Reads `.env` if present; see `botlink_core::config` for the variables.

use std::sync::Arc;

use botlink_core::{BridgeConfig, LoginConfig, ServerConfig};
use botlink_login::{LoginExchange, storage::SqliteStore};
use botlink_transport::{BridgeListener, Router as RequestRouter, RpcPeer};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
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
    let login = LoginConfig::from_env()?;

    let store = Arc::new(SqliteStore::connect(&server.database_url).await?);
    tracing::info!("Using database {}", server.database_url);

    // The API serves no request types of its own; it only calls the bot.
    let peer = RpcPeer::with_call_timeout(RequestRouter::new(), bridge.call_timeout);
    let exchange = Arc::new(
        LoginExchange::new(Arc::clone(&peer), store)
            .with_session_lifetime(login.session_lifetime),
    );

    let mut app = botlink_login::http::routes(exchange);
    if let Some(token) = bridge.token {
        tracing::info!("Bridge listening at {}", botlink_transport::websocket::BRIDGE_PATH);
        app = app.merge(BridgeListener::new(peer, token).router());
    } else {
        tracing::info!("$API_WS_TOKEN not set; bridge disabled");
    }
    let app = app
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(server.listen_addr).await?;
    tracing::info!("Server listening on http://{}", server.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;
    Ok(())
}
