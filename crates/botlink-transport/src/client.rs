//! Outbound, reconnecting bridge connection (bot side).
//!
//! A [`TransportManager`] owns exactly one WebSocket connection to the API.
//! It authenticates with a static bearer credential, retries after a fixed
//! delay whenever the connection drops or cannot be established, and lets
//! the peer's outbox queue envelopes while disconnected.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use botlink_core::{BridgeConfig, config::DEFAULT_RETRY_DELAY};
use futures::{FutureExt, SinkExt, StreamExt, future};
use tokio::{
    net::TcpStream,
    sync::{Notify, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};

use crate::{
    link::{Inbound, LinkEnd, pump},
    peer::RpcPeer,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Connection attempt error.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("Bridge credential is not a valid header value")]
    Credential,
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] tungstenite::Error),
}

/// Owner of the outbound bridge connection.
pub struct TransportManager {
    url: String,
    token: String,
    retry_delay: Duration,
    peer: Arc<RpcPeer>,
    state: watch::Sender<LinkState>,
    wake: Notify,
    stopping: AtomicBool,
}

impl TransportManager {
    /// Create a manager for `url`, authenticating with `token`.
    #[must_use]
    pub fn new(url: impl Into<String>, token: impl Into<String>, peer: Arc<RpcPeer>) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Self {
            url: url.into(),
            token: token.into(),
            retry_delay: DEFAULT_RETRY_DELAY,
            peer,
            state,
            wake: Notify::new(),
            stopping: AtomicBool::new(false),
        }
    }

    /// Create a manager from configuration.
    ///
    /// Returns `None`, after logging, when the endpoint or the credential is
    /// missing.
    #[must_use]
    pub fn from_config(config: &BridgeConfig, peer: Arc<RpcPeer>) -> Option<Self> {
        let Some((url, token)) = config.client_endpoint() else {
            tracing::info!("$API_WS_URL or $API_WS_TOKEN not set; bridge disabled");
            return None;
        };
        tracing::info!("$API_WS_URL and $API_WS_TOKEN set; connecting to {url}");
        Some(Self::new(url, token, peer).with_retry_delay(config.retry_delay))
    }

    /// Override the reconnect delay.
    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Start the connection loop.
    #[must_use]
    pub fn spawn(self) -> TransportHandle {
        let manager = Arc::new(self);
        let task = tokio::spawn(Arc::clone(&manager).run());
        TransportHandle { manager, task }
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.stopping() {
                break;
            }

            self.state.send_replace(LinkState::Connecting);
            let connected = tokio::select! {
                result = self.connect() => result,
                () = self.wake.notified() => {
                    if self.stopping() {
                        break;
                    }
                    continue;
                }
            };

            let end = match connected {
                Ok(stream) => {
                    // A wake-up stored before this connection existed is stale.
                    let _ = self.wake.notified().now_or_never();
                    if self.stopping() {
                        break;
                    }
                    tracing::info!("Bridge connected");
                    self.state.send_replace(LinkState::Connected);
                    self.serve(stream).await
                }
                Err(e) => LinkEnd::Failed(e.to_string()),
            };
            self.state.send_replace(LinkState::Disconnected);

            match end {
                LinkEnd::Stopped if self.stopping() => break,
                LinkEnd::Stopped => {
                    tracing::info!("Bridge reconnect requested");
                    continue;
                }
                LinkEnd::Closed => {
                    tracing::warn!("Bridge closed, reconnecting in {:?}", self.retry_delay);
                }
                LinkEnd::Failed(e) => {
                    tracing::warn!("Bridge: {e}; reconnecting in {:?}", self.retry_delay);
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.retry_delay) => {}
                () = self.wake.notified() => {}
            }
        }

        self.state.send_replace(LinkState::Disconnected);
        tracing::info!("Bridge shut down");
    }

    async fn connect(&self) -> Result<WsStream, ConnectError> {
        let mut request = self.url.as_str().into_client_request()?;
        let credential = HeaderValue::from_str(&self.token).map_err(|_| ConnectError::Credential)?;
        request.headers_mut().insert(AUTHORIZATION, credential);

        let (stream, _response) = connect_async(request).await?;
        Ok(stream)
    }

    async fn serve(&self, stream: WsStream) -> LinkEnd {
        let (write, read) = stream.split();
        let sink = write.with(|text: String| {
            future::ready(Ok::<_, tungstenite::Error>(Message::Text(text.into())))
        });
        pump(&self.peer, sink, read.map(classify), self.wake.notified()).await
    }
}

fn classify(message: Result<Message, tungstenite::Error>) -> Inbound {
    match message {
        Ok(Message::Text(text)) => Inbound::Text(text.as_str().to_owned()),
        Ok(Message::Binary(data)) => Inbound::from_binary(&data),
        Ok(Message::Close(_)) => Inbound::Closed,
        Ok(_) => Inbound::Ignored,
        Err(e) => Inbound::Failed(e.to_string()),
    }
}

/// Handle to a running [`TransportManager`].
pub struct TransportHandle {
    manager: Arc<TransportManager>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    /// The peer this connection serves.
    #[must_use]
    pub fn peer(&self) -> &Arc<RpcPeer> {
        &self.manager.peer
    }

    /// Watch the connection state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LinkState> {
        self.manager.state.subscribe()
    }

    /// Close the current connection, if any, and connect again right away.
    pub fn reconnect(&self) {
        self.manager.wake.notify_one();
    }

    /// Close the connection and stop reconnecting.
    pub async fn shutdown(self) {
        self.manager.stopping.store(true, Ordering::SeqCst);
        self.manager.wake.notify_one();
        if let Err(e) = self.task.await {
            tracing::error!("Bridge task failed: {e}");
        }
    }
}
