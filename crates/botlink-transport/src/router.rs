//! Handler registry for inbound requests.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use botlink_core::StorageError;
use serde_json::{Value, json};
use thiserror::Error;

/// Reply error sent when a request type has no handler.
pub const NO_HANDLERS: &str = "no handlers";

/// Router setup error.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("A handler is already registered for {0:?}")]
    DuplicateHandler(String),
}

/// Failure raised by a request handler.
///
/// Turned into a `{ success: false, statusCode?, error }` reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Status code the caller should surface, if any.
    pub status: Option<u16>,
    /// Human-readable message.
    pub message: String,
}

impl HandlerError {
    /// Failure without a status code.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    /// Failure with a status code.
    #[must_use]
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Reply payload for this failure.
    #[must_use]
    pub fn into_reply(self) -> Value {
        failure(self.message, self.status)
    }
}

impl From<StorageError> for HandlerError {
    fn from(e: StorageError) -> Self {
        tracing::error!("Storage failure in handler: {e}");
        Self::new(e.to_string())
    }
}

/// Build a structured failure payload.
#[must_use]
pub fn failure(error: impl Into<String>, status: Option<u16>) -> Value {
    let mut reply = json!({ "success": false, "error": error.into() });
    if let Some(status) = status {
        reply["statusCode"] = json!(status);
    }
    reply
}

/// Trait for inbound request handlers.
///
/// The router sends exactly one reply built from the returned value.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one request payload.
    async fn handle(&self, data: Value) -> Result<Value, HandlerError>;
}

/// Liveness check that echoes the payload back as `{ received }`.
#[derive(Debug, Default, Clone)]
pub struct EchoHandler;

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn handle(&self, data: Value) -> Result<Value, HandlerError> {
        Ok(json!({ "received": data }))
    }
}

/// Mapping from request type to its single handler.
#[derive(Default, Clone)]
pub struct Router {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`.
    ///
    /// # Errors
    /// Returns [`RouterError::DuplicateHandler`] if `kind` already has one.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        handler: impl RequestHandler + 'static,
    ) -> Result<&mut Self, RouterError> {
        let kind = kind.into();
        if self.handlers.contains_key(&kind) {
            return Err(RouterError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, Arc::new(handler));
        Ok(self)
    }

    /// Handler registered for `kind`.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<Arc<dyn RequestHandler>> {
        self.handlers.get(kind).cloned()
    }

    /// Registered request types.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}
