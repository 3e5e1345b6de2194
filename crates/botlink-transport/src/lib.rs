//! RPC bridge between the bot and the API.
//!
//! Provides:
//! - Wire protocol (JSON envelopes)
//! - Outbox with a memory-only queue for disconnected periods
//! - Request router and call correlation (`RpcPeer`)
//! - Reconnecting client (feature: client)
//! - Authenticated listener for axum (feature: server)

mod link;
pub mod outbox;
pub mod peer;
pub mod protocol;
pub mod router;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod websocket;

pub use outbox::Outbox;
pub use peer::{CallError, RpcPeer};
pub use protocol::{Envelope, ProtocolError};
pub use router::{EchoHandler, HandlerError, RequestHandler, Router, RouterError};

#[cfg(feature = "client")]
pub use client::{LinkState, TransportHandle, TransportManager};

#[cfg(feature = "server")]
pub use websocket::BridgeListener;
