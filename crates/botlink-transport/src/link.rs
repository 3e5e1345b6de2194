//! Frame pump shared by the client and the listener.

use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::{peer::RpcPeer, protocol::Envelope};

/// Upper bound on the closing handshake of a finished link.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Inbound frame, reduced to what the bridge cares about.
#[derive(Debug)]
pub(crate) enum Inbound {
    Text(String),
    Closed,
    Failed(String),
    Ignored,
}

impl Inbound {
    /// Decode a binary frame as UTF-8 text.
    pub(crate) fn from_binary(data: &[u8]) -> Self {
        match std::str::from_utf8(data) {
            Ok(text) => Self::Text(text.to_string()),
            Err(_) => {
                tracing::warn!("Discarding non UTF-8 bridge frame");
                Self::Ignored
            }
        }
    }
}

/// Why a link stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkEnd {
    /// Peer closed the connection.
    Closed,
    /// Read or write error.
    Failed(String),
    /// Local stop request.
    Stopped,
}

/// Run one live connection until it closes, fails, or `stop` resolves.
///
/// The peer's outbox is attached for the duration; on exit every envelope
/// not yet written goes back to its queue. `stop` is honored even while a
/// write is stalled, and the closing handshake is bounded by [`CLOSE_TIMEOUT`].
pub(crate) async fn pump<W, R, S>(peer: &Arc<RpcPeer>, mut sink: W, mut stream: R, stop: S) -> LinkEnd
where
    W: Sink<String> + Unpin,
    W::Error: Display,
    R: Stream<Item = Inbound> + Unpin,
    S: Future<Output = ()>,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
    peer.outbox().attach(tx);
    tokio::pin!(stop);

    let mut unsent = None;
    let end = loop {
        tokio::select! {
            () = &mut stop => break LinkEnd::Stopped,
            outgoing = rx.recv() => {
                let Some(envelope) = outgoing else {
                    break LinkEnd::Closed;
                };
                let text = match envelope.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(kind = %envelope.kind, "Dropping unencodable envelope: {e}");
                        continue;
                    }
                };
                tracing::debug!("[>] {text}");
                // A stalled write must not hold off a stop request.
                let written = tokio::select! {
                    result = sink.send(text) => result,
                    () = &mut stop => {
                        unsent = Some(envelope);
                        break LinkEnd::Stopped;
                    }
                };
                if let Err(e) = written {
                    unsent = Some(envelope);
                    break LinkEnd::Failed(e.to_string());
                }
            }
            incoming = stream.next() => match incoming {
                Some(Inbound::Text(text)) => peer.handle_incoming(&text),
                Some(Inbound::Ignored) => {}
                Some(Inbound::Failed(e)) => break LinkEnd::Failed(e),
                Some(Inbound::Closed) | None => break LinkEnd::Closed,
            },
        }
    };

    peer.outbox().detach(unsent, &mut rx);
    if tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await.is_err() {
        tracing::debug!("Bridge close did not finish within {CLOSE_TIMEOUT:?}");
    }
    end
}
