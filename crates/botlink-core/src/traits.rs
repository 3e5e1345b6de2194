//! Storage contracts for login state.
//!
//! Both processes talk to the same backing store; these traits are the only
//! queries and updates the login flow relies on.

use async_trait::async_trait;
use thiserror::Error;

use crate::login::{PendingLogin, PendingLoginId, Session};

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Pending login not found: {0}")]
    NotFound(PendingLoginId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Resolves user input to a canonical user identity.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Resolve `query` case-insensitively.
    ///
    /// Returns `None` when no user matches.
    async fn resolve(&self, query: &str) -> Result<Option<String>, StorageError>;
}

/// Trait for pending login storage backends.
#[async_trait]
pub trait PendingLoginStore: Send + Sync {
    /// Persist a new pending login unless an active row already holds its
    /// `(user, code)` pair at `now`.
    ///
    /// The check and the insert are one atomic step. Returns `false`, without
    /// writing, when the pair is taken.
    async fn create(&self, login: &PendingLogin, now: i64) -> Result<bool, StorageError>;

    /// Whether an active (not exchanged, not invalid, unexpired) row exists
    /// for `(user, code)` at `now`.
    async fn has_active(&self, user: &str, code: &str, now: i64) -> Result<bool, StorageError>;

    /// Number of this user's pending logins that were ever confirmed.
    async fn count_confirmed(&self, user: &str) -> Result<u64, StorageError>;

    /// Find the unexpired, unexchanged, valid row matching the exchange triple.
    ///
    /// `user` matches the stored canonical identity case-insensitively; the
    /// returned row carries the canonical form. Does not filter on `confirmed`.
    async fn find_for_exchange(
        &self,
        user: &str,
        nonce: &str,
        code: &str,
        now: i64,
    ) -> Result<Option<PendingLogin>, StorageError>;

    /// Find the active, unconfirmed row for `(user, code)`.
    ///
    /// Lookup used by the confirming actor.
    async fn find_unconfirmed(
        &self,
        user: &str,
        code: &str,
        now: i64,
    ) -> Result<Option<PendingLogin>, StorageError>;

    /// Flip `confirmed` from false to true.
    ///
    /// Returns `false` if the row was already confirmed, exchanged or invalid.
    async fn confirm(&self, id: PendingLoginId) -> Result<bool, StorageError>;

    /// Flip `exchanged` from false to true on a valid row.
    ///
    /// Exactly one concurrent caller observes `true`.
    async fn claim(&self, id: PendingLoginId) -> Result<bool, StorageError>;
}

/// Trait for session storage backends.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new session.
    async fn create_session(&self, session: &Session) -> Result<(), StorageError>;

    /// Get a session by token.
    async fn find_session(&self, token: &str) -> Result<Option<Session>, StorageError>;
}
