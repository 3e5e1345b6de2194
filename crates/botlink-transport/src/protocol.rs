//! Wire protocol for the bridge.
//!
//! Every frame is one JSON envelope `{ nonce?, type, data? }`. A request
//! carries a nonce; its reply has the same nonce and the type
//! `"response:" + nonce`. Envelopes without a nonce are notifications.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Prefix of a reply's type.
pub const RESPONSE_PREFIX: &str = "response:";

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Envelope has an empty type")]
    EmptyType,
}

/// Generate a fresh RPC nonce.
#[must_use]
pub fn new_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Wire-level message unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id; absent on notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Request type, or `response:<nonce>` for replies.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    /// Create a request envelope.
    #[must_use]
    pub fn request(nonce: &str, kind: impl Into<String>, data: Value) -> Self {
        Self {
            nonce: Some(nonce.to_string()),
            kind: kind.into(),
            data,
        }
    }

    /// Create a fire-and-forget notification.
    #[must_use]
    pub fn notification(kind: impl Into<String>, data: Value) -> Self {
        Self {
            nonce: None,
            kind: kind.into(),
            data,
        }
    }

    /// Create the reply to the request carrying `nonce`.
    #[must_use]
    pub fn response(nonce: &str, data: Value) -> Self {
        Self {
            nonce: Some(nonce.to_string()),
            kind: format!("{RESPONSE_PREFIX}{nonce}"),
            data,
        }
    }

    /// The request nonce this envelope answers, if it is a reply.
    #[must_use]
    pub fn response_nonce(&self) -> Option<&str> {
        self.kind
            .strip_prefix(RESPONSE_PREFIX)
            .filter(|nonce| !nonce.is_empty())
    }

    /// Decode a text frame.
    ///
    /// # Errors
    /// Returns error if the frame is not an envelope.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Self = serde_json::from_str(text)?;
        if envelope.kind.is_empty() {
            return Err(ProtocolError::EmptyType);
        }
        Ok(envelope)
    }

    /// Encode as a text frame.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
