//! Request/response correlation and inbound dispatch.
//!
//! An [`RpcPeer`] is one end of the bridge. It owns the [`Outbox`], the
//! [`Router`] for inbound requests, and the table of outstanding calls keyed
//! by RPC nonce. Connections (client or listener) feed it decoded frames via
//! [`RpcPeer::handle_incoming`].

use std::{
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use botlink_core::config::DEFAULT_CALL_TIMEOUT;
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    outbox::Outbox,
    protocol::{Envelope, new_nonce},
    router::{NO_HANDLERS, Router, failure},
};

/// Outbound call error.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("No response to {kind:?} within {after:?}")]
    TimedOut { kind: String, after: Duration },
    #[error("Call to {0:?} was dropped before a response arrived")]
    Closed(String),
}

type Pending = HashMap<String, oneshot::Sender<Value>>;

/// One end of the bridge.
pub struct RpcPeer {
    outbox: Outbox,
    router: Router,
    pending: Mutex<Pending>,
    call_timeout: Duration,
}

/// Removes a call's listener when the call finishes, times out or is dropped.
///
/// A request still waiting in the outbox is withdrawn with it, so the remote
/// side never runs a call nobody awaits.
struct PendingGuard<'a> {
    peer: &'a RpcPeer,
    nonce: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.peer.lock_pending().remove(&self.nonce);
        if self.peer.outbox.withdraw(&self.nonce) {
            tracing::debug!(nonce = %self.nonce, "Withdrew unsent bridge call");
        }
    }
}

impl RpcPeer {
    /// Create a peer with the default call deadline.
    #[must_use]
    pub fn new(router: Router) -> Arc<Self> {
        Self::with_call_timeout(router, DEFAULT_CALL_TIMEOUT)
    }

    /// Create a peer with a custom call deadline.
    #[must_use]
    pub fn with_call_timeout(router: Router, call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            outbox: Outbox::new(),
            router,
            pending: Mutex::new(HashMap::new()),
            call_timeout,
        })
    }

    /// The peer's send path.
    #[must_use]
    pub const fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn outstanding_calls(&self) -> usize {
        self.lock_pending().len()
    }

    /// Send a fire-and-forget notification.
    pub fn notify(&self, kind: impl Into<String>, data: Value) {
        self.outbox.send(Envelope::notification(kind, data));
    }

    /// Call a remote handler with the default deadline.
    ///
    /// # Errors
    /// See [`RpcPeer::call_with_timeout`].
    pub async fn call(&self, kind: &str, data: Value) -> Result<Value, CallError> {
        self.call_with_timeout(kind, data, self.call_timeout).await
    }

    /// Call a remote handler and wait for its reply payload.
    ///
    /// The request is queued if the bridge is down. Dropping the returned
    /// future cancels the call.
    ///
    /// # Errors
    /// Returns [`CallError::TimedOut`] when no reply arrives within `timeout`.
    pub async fn call_with_timeout(
        &self,
        kind: &str,
        data: Value,
        timeout: Duration,
    ) -> Result<Value, CallError> {
        let nonce = new_nonce();
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(nonce.clone(), tx);
        let _guard = PendingGuard {
            peer: self,
            nonce: nonce.clone(),
        };

        self.outbox.send(Envelope::request(&nonce, kind, data));

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CallError::Closed(kind.to_string())),
            Err(_) => {
                tracing::warn!(%nonce, "Bridge call {kind:?} timed out after {timeout:?}");
                Err(CallError::TimedOut {
                    kind: kind.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Handle one inbound text frame.
    ///
    /// Malformed frames are logged and dropped.
    pub fn handle_incoming(self: &Arc<Self>, text: &str) {
        tracing::debug!("[<] {text}");
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("Discarding bridge frame: {e}");
                return;
            }
        };

        if let Some(nonce) = envelope.response_nonce().map(str::to_owned) {
            self.resolve(&nonce, envelope.data);
            return;
        }

        match envelope.nonce {
            Some(nonce) => self.dispatch_request(nonce, envelope.kind, envelope.data),
            None => self.dispatch_notification(envelope.kind, envelope.data),
        }
    }

    fn resolve(&self, nonce: &str, data: Value) {
        let listener = self.lock_pending().remove(nonce);
        match listener {
            Some(tx) => {
                // The caller may have given up in the meantime.
                let _ = tx.send(data);
            }
            None => tracing::debug!(%nonce, "Response for unknown or expired call"),
        }
    }

    fn dispatch_request(self: &Arc<Self>, nonce: String, kind: String, data: Value) {
        let Some(handler) = self.router.get(&kind) else {
            tracing::debug!(%nonce, "No handler for request {kind:?}");
            self.outbox
                .send(Envelope::response(&nonce, failure(NO_HANDLERS, None)));
            return;
        };

        let peer = Arc::clone(self);
        tokio::spawn(async move {
            let reply = match AssertUnwindSafe(handler.handle(data)).catch_unwind().await {
                Ok(Ok(reply)) => reply,
                Ok(Err(e)) => {
                    tracing::debug!(%nonce, "Handler for {kind:?} failed: {e}");
                    e.into_reply()
                }
                Err(_) => {
                    tracing::error!(%nonce, "Handler for {kind:?} panicked");
                    failure("handler panicked", None)
                }
            };
            peer.outbox.send(Envelope::response(&nonce, reply));
        });
    }

    fn dispatch_notification(&self, kind: String, data: Value) {
        let Some(handler) = self.router.get(&kind) else {
            tracing::debug!("Ignoring notification {kind:?}");
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = handler.handle(data).await {
                tracing::debug!("Notification handler for {kind:?} failed: {e}");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::router::{EchoHandler, HandlerError, RequestHandler};

    struct Failing;

    #[async_trait]
    impl RequestHandler for Failing {
        async fn handle(&self, _data: Value) -> Result<Value, HandlerError> {
            Err(HandlerError::with_status(404, "user not found"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl RequestHandler for Panicking {
        async fn handle(&self, _data: Value) -> Result<Value, HandlerError> {
            panic!("handler bug")
        }
    }

    fn attached(router: Router) -> (Arc<RpcPeer>, mpsc::UnboundedReceiver<Envelope>) {
        let peer = RpcPeer::new(router);
        let (tx, rx) = mpsc::unbounded_channel();
        peer.outbox().attach(tx);
        (peer, rx)
    }

    fn request(nonce: &str, kind: &str, data: Value) -> String {
        Envelope::request(nonce, kind, data).encode().unwrap()
    }

    #[tokio::test]
    async fn test_unknown_type_gets_no_handlers_reply() {
        let (peer, mut rx) = attached(Router::new());
        peer.handle_incoming(&request("n1", "mystery", json!({})));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, "response:n1");
        assert_eq!(reply.nonce.as_deref(), Some("n1"));
        assert_eq!(reply.data, json!({ "success": false, "error": "no handlers" }));
    }

    #[tokio::test]
    async fn test_handler_reply_is_correlated() {
        let mut router = Router::new();
        router.register("test", EchoHandler).unwrap();
        let (peer, mut rx) = attached(router);

        peer.handle_incoming(&request("n2", "test", json!({ "x": 1 })));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, "response:n2");
        assert_eq!(reply.data, json!({ "received": { "x": 1 } }));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failure_reply() {
        let mut router = Router::new();
        router.register("requestLogin", Failing).unwrap();
        let (peer, mut rx) = attached(router);

        peer.handle_incoming(&request("n3", "requestLogin", json!({ "user": "nobody" })));

        let reply = rx.recv().await.unwrap();
        assert_eq!(
            reply.data,
            json!({ "success": false, "statusCode": 404, "error": "user not found" })
        );
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_failure_reply() {
        let mut router = Router::new();
        router.register("boom", Panicking).unwrap();
        let (peer, mut rx) = attached(router);

        peer.handle_incoming(&request("n4", "boom", Value::Null));

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.kind, "response:n4");
        assert_eq!(reply.data["success"], false);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_ignored() {
        let (peer, mut rx) = attached(Router::new());
        peer.handle_incoming("{not json");
        peer.handle_incoming(r#"{"nonce":"n5"}"#);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_resolves_matching_response() {
        let (peer, mut rx) = attached(Router::new());

        let caller = Arc::clone(&peer);
        let call = tokio::spawn(async move { caller.call("requestLogin", json!({ "user": "alice" })).await });

        let request = rx.recv().await.unwrap();
        assert_eq!(request.kind, "requestLogin");
        let nonce = request.nonce.unwrap();

        // A reply for some other call must not resolve this one.
        peer.handle_incoming(&Envelope::response("other", json!({ "success": true })).encode().unwrap());
        peer.handle_incoming(&Envelope::response(&nonce, json!({ "success": true, "code": "A1B2C3D4" })).encode().unwrap());

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply["code"], "A1B2C3D4");
        assert_eq!(peer.outstanding_calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_tracked_independently() {
        let (peer, mut rx) = attached(Router::new());

        let first = tokio::spawn({
            let peer = Arc::clone(&peer);
            async move { peer.call("a", json!(1)).await }
        });
        let second = tokio::spawn({
            let peer = Arc::clone(&peer);
            async move { peer.call("b", json!(2)).await }
        });

        let mut requests = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        requests.sort_by(|x, y| x.kind.cmp(&y.kind));
        assert_eq!(peer.outstanding_calls(), 2);

        // Answer in reverse order.
        for request in requests.iter().rev() {
            let nonce = request.nonce.clone().unwrap();
            peer.handle_incoming(&Envelope::response(&nonce, request.data.clone()).encode().unwrap());
        }

        assert_eq!(first.await.unwrap().unwrap(), json!(1));
        assert_eq!(second.await.unwrap().unwrap(), json!(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out_and_releases_listener() {
        let peer = RpcPeer::with_call_timeout(Router::new(), Duration::from_secs(5));

        let err = peer.call("requestLogin", json!({})).await.unwrap_err();
        assert!(matches!(err, CallError::TimedOut { .. }));
        assert_eq!(peer.outstanding_calls(), 0);
        // Never delivered, so the request is withdrawn with the listener.
        assert_eq!(peer.outbox().queued(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_queued_call_is_withdrawn() {
        let peer = RpcPeer::new(Router::new());
        peer.notify("note", json!(1));

        let caller = Arc::clone(&peer);
        let call = tokio::spawn(async move { caller.call("requestLogin", json!({})).await });
        tokio::task::yield_now().await;
        assert_eq!(peer.outbox().queued(), 2);

        call.abort();
        let _ = call.await;
        assert_eq!(peer.outstanding_calls(), 0);
        assert_eq!(peer.outbox().queued(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_call_releases_listener() {
        let (peer, mut rx) = attached(Router::new());

        let caller = Arc::clone(&peer);
        let call = tokio::spawn(async move { caller.call("slow", Value::Null).await });
        let request = rx.recv().await.unwrap();
        assert_eq!(peer.outstanding_calls(), 1);

        call.abort();
        let _ = call.await;
        assert_eq!(peer.outstanding_calls(), 0);

        // A late reply is dropped quietly.
        peer.handle_incoming(&Envelope::response(&request.nonce.unwrap(), Value::Null).encode().unwrap());
    }
}
