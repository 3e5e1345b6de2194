//! Login records persisted in shared storage.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pending login identifier.
pub type PendingLoginId = Uuid;

/// How long a pending login stays usable after it is issued.
pub const PENDING_LOGIN_TTL: Duration = Duration::from_secs(15 * 60);

/// Current time as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// `now + duration` in epoch milliseconds, saturating.
#[must_use]
pub fn expires_after(now: i64, duration: Duration) -> i64 {
    now.saturating_add(i64::try_from(duration.as_millis()).unwrap_or(i64::MAX))
}

/// One login attempt, from code issuance to exchange or expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingLogin {
    /// Row identifier.
    pub id: PendingLoginId,
    /// Human-relayed code (8 uppercase hex characters).
    pub code: String,
    /// Canonical user identity.
    pub user: String,
    /// Login nonce binding `complete` to this attempt.
    pub nonce: String,
    /// Set once by the out-of-band confirming actor.
    pub confirmed: bool,
    /// Set once when the login is exchanged for a session.
    pub exchanged: bool,
    /// Revoked.
    pub invalid: bool,
    /// Expiry (Unix epoch milliseconds).
    pub expires: i64,
    /// True for the user's first confirmed login ever.
    pub require_phishing_confirmation: bool,
}

impl PendingLogin {
    /// Create a fresh, unconfirmed pending login expiring [`PENDING_LOGIN_TTL`] after `now`.
    #[must_use]
    pub fn issue(
        user: impl Into<String>,
        code: impl Into<String>,
        nonce: impl Into<String>,
        require_phishing_confirmation: bool,
        now: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            code: code.into(),
            user: user.into(),
            nonce: nonce.into(),
            confirmed: false,
            exchanged: false,
            invalid: false,
            expires: expires_after(now, PENDING_LOGIN_TTL),
            require_phishing_confirmation,
        }
    }

    /// Not exchanged, not invalid, not expired.
    #[must_use]
    pub const fn is_active(&self, now: i64) -> bool {
        !self.exchanged && !self.invalid && self.expires > now
    }
}

/// Session minted by a successful login exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Canonical user identity.
    pub user: String,
    /// Bearer token handed to the client.
    pub token: String,
    /// Login nonce copied from the pending login.
    pub nonce: String,
    /// Revoked.
    pub invalid: bool,
    /// Expiry (Unix epoch milliseconds).
    pub expires: i64,
}
