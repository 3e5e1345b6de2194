//! Accepting end of the bridge (API side).
//!
//! Mount [`BridgeListener::router`] into the API's axum app. The bot connects
//! with the shared credential in its `authorization` header; only one bot
//! connection is live at a time, a new one replaces the old.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt, future};
use tokio::sync::{Notify, watch};

use crate::{
    link::{Inbound, LinkEnd, pump},
    peer::RpcPeer,
};

/// Default mount path of the bridge endpoint.
pub const BRIDGE_PATH: &str = "/internal/ws";

/// Bridge endpoint state.
pub struct BridgeListener {
    peer: Arc<RpcPeer>,
    token: String,
    // Held by the live connection for its whole lifetime.
    slot: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<Notify>>>,
    connected: watch::Sender<bool>,
}

impl BridgeListener {
    /// Create a listener accepting connections that present `token`.
    #[must_use]
    pub fn new(peer: Arc<RpcPeer>, token: impl Into<String>) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            peer,
            token: token.into(),
            slot: tokio::sync::Mutex::new(()),
            current: Mutex::new(None),
            connected,
        })
    }

    /// The peer served by this endpoint.
    #[must_use]
    pub const fn peer(&self) -> &Arc<RpcPeer> {
        &self.peer
    }

    /// Watch whether a bot is connected.
    #[must_use]
    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Router serving the endpoint at [`BRIDGE_PATH`].
    ///
    /// # Example
    /// ```ignore
    /// let app = Router::new()
    ///     .merge(BridgeListener::new(peer, token).router());
    /// ```
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(BRIDGE_PATH, get(ws_handler))
            .with_state(self)
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<Arc<Notify>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(AUTHORIZATION)
            .is_some_and(|value| value.as_bytes() == self.token.as_bytes())
    }

    async fn serve(self: Arc<Self>, socket: WebSocket) {
        let stop = Arc::new(Notify::new());
        if let Some(previous) = self.lock_current().replace(Arc::clone(&stop)) {
            tracing::info!("Replacing existing bridge connection");
            previous.notify_one();
        }

        // Wait for the replaced connection to hand its queue back.
        let _slot = self.slot.lock().await;
        self.connected.send_replace(true);
        tracing::info!("Bridge peer connected");

        let (write, read) = socket.split();
        let sink = write.with(|text: String| {
            future::ready(Ok::<_, axum::Error>(Message::Text(text.into())))
        });
        let end = pump(&self.peer, sink, read.map(classify), stop.notified()).await;

        let mut current = self.lock_current();
        if current.as_ref().is_some_and(|live| Arc::ptr_eq(live, &stop)) {
            *current = None;
            self.connected.send_replace(false);
        }
        drop(current);

        match end {
            LinkEnd::Failed(e) => tracing::warn!("Bridge peer dropped: {e}"),
            LinkEnd::Closed | LinkEnd::Stopped => tracing::info!("Bridge peer disconnected"),
        }
    }
}

fn classify(message: Result<Message, axum::Error>) -> Inbound {
    match message {
        Ok(Message::Text(text)) => Inbound::Text(text.as_str().to_owned()),
        Ok(Message::Binary(data)) => Inbound::from_binary(&data),
        Ok(Message::Close(_)) => Inbound::Closed,
        Ok(_) => Inbound::Ignored,
        Err(e) => Inbound::Failed(e.to_string()),
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(
    State(listener): State<Arc<BridgeListener>>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !listener.authorized(&headers) {
        tracing::warn!("Rejected bridge connection: bad credential");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match ws {
        Ok(ws) => ws
            .on_upgrade(move |socket| listener.serve(socket))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}
