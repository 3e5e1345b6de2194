//! API-side login operations.
//!
//! `begin` asks the bot for a code over the bridge; `complete` trades a
//! confirmed code for a session token.

use std::{sync::Arc, time::Duration};

use botlink_core::{
    PendingLoginStore, Session, SessionStore, StorageError,
    config::DEFAULT_SESSION_LIFETIME,
    login::expires_after,
    now_millis,
};
use botlink_transport::RpcPeer;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::{code::session_token, orchestrator::REQUEST_LOGIN};

/// Login exchange error.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Invalid request body")]
    Validation,
    #[error("The provided login info could not be found.")]
    NotFound,
    #[error("This code is not yet valid.")]
    NotYetValid,
    #[error("{message}")]
    Upstream { status: u16, message: String },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ExchangeError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::Validation | Self::NotYetValid => 400,
            Self::NotFound => 404,
            Self::Upstream { status, .. } => *status,
            Self::Storage(_) => 500,
        }
    }

    /// Message safe to show the caller.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Storage(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

/// Successful `begin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BeginResponse {
    pub success: bool,
    pub nonce: String,
    pub code: String,
}

/// Successful `complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompleteResponse {
    pub success: bool,
    pub user: String,
    pub token: String,
}

/// Login exchange endpoint state.
pub struct LoginExchange<S> {
    peer: Arc<RpcPeer>,
    store: Arc<S>,
    session_lifetime: Duration,
}

impl<S> LoginExchange<S>
where
    S: PendingLoginStore + SessionStore,
{
    /// Create an exchange calling the bot through `peer`.
    #[must_use]
    pub const fn new(peer: Arc<RpcPeer>, store: Arc<S>) -> Self {
        Self {
            peer,
            store,
            session_lifetime: DEFAULT_SESSION_LIFETIME,
        }
    }

    /// Set how long issued sessions stay valid.
    #[must_use]
    pub const fn with_session_lifetime(mut self, session_lifetime: Duration) -> Self {
        self.session_lifetime = session_lifetime;
        self
    }

    /// Ask the bot to issue a login code for `user`.
    ///
    /// # Errors
    /// [`ExchangeError::Validation`] for an empty user; otherwise
    /// [`ExchangeError::Upstream`] carrying the bot's status (default 500).
    pub async fn begin(&self, user: &str) -> Result<BeginResponse, ExchangeError> {
        if user.is_empty() {
            return Err(ExchangeError::Validation);
        }

        let reply = self
            .peer
            .call(REQUEST_LOGIN, json!({ "user": user.to_lowercase() }))
            .await
            .map_err(|e| {
                tracing::warn!("requestLogin call failed: {e}");
                ExchangeError::Upstream {
                    status: 500,
                    message: "Login service unavailable".to_string(),
                }
            })?;

        parse_begin(&reply)
    }

    /// Exchange a confirmed login code for a session.
    ///
    /// # Errors
    /// [`ExchangeError::NotFound`] when no active login matches or another
    /// caller exchanged it first; [`ExchangeError::NotYetValid`] when the
    /// login is not confirmed yet.
    pub async fn complete(
        &self,
        user: &str,
        nonce: &str,
        code: &str,
    ) -> Result<CompleteResponse, ExchangeError> {
        if user.is_empty() || nonce.is_empty() || code.is_empty() {
            return Err(ExchangeError::Validation);
        }
        let now = now_millis();

        let login = self
            .store
            .find_for_exchange(user, nonce, code, now)
            .await?
            .ok_or(ExchangeError::NotFound)?;
        if !login.confirmed {
            return Err(ExchangeError::NotYetValid);
        }
        if !self.store.claim(login.id).await? {
            tracing::info!(user = %login.user, "Login already exchanged");
            return Err(ExchangeError::NotFound);
        }

        let login_id = login.id;
        let session = Session {
            user: login.user,
            token: session_token(),
            nonce: login.nonce,
            invalid: false,
            expires: expires_after(now, self.session_lifetime),
        };
        if let Err(e) = self.store.create_session(&session).await {
            // The row is already exchanged; it cannot be retried.
            tracing::error!(
                pending_login = %login_id,
                user = %session.user,
                "Pending login exchanged but its session was not stored: {e}"
            );
            return Err(e.into());
        }
        tracing::info!(user = %session.user, "Login exchanged for session");

        Ok(CompleteResponse {
            success: true,
            user: session.user,
            token: session.token,
        })
    }
}

fn parse_begin(reply: &Value) -> Result<BeginResponse, ExchangeError> {
    if reply["success"] != Value::Bool(true) {
        let status = reply["statusCode"]
            .as_u64()
            .and_then(|s| u16::try_from(s).ok())
            .unwrap_or(500);
        let message = reply["error"].as_str().unwrap_or("Login failed").to_string();
        return Err(ExchangeError::Upstream { status, message });
    }

    match (reply["nonce"].as_str(), reply["code"].as_str()) {
        (Some(nonce), Some(code)) => Ok(BeginResponse {
            success: true,
            nonce: nonce.to_string(),
            code: code.to_string(),
        }),
        _ => {
            tracing::warn!("Malformed requestLogin reply: {reply}");
            Err(ExchangeError::Upstream {
                status: 500,
                message: "Malformed reply from login service".to_string(),
            })
        }
    }
}
