//! In-memory login storage.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use botlink_core::{
    PendingLogin, PendingLoginId, PendingLoginStore, Session, SessionStore, StorageError,
    UserDirectory,
};

/// In-memory storage implementation.
///
/// Useful for development and tests. Data is lost on restart and is not
/// shared between processes.
pub struct MemoryStore {
    logins: RwLock<HashMap<PendingLoginId, PendingLogin>>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemoryStore {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            logins: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot of a pending login.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn get(&self, id: PendingLoginId) -> Result<Option<PendingLogin>, StorageError> {
        Ok(self
            .logins
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(&id)
            .cloned())
    }

    /// Revoke a pending login.
    ///
    /// # Errors
    /// Returns [`StorageError::NotFound`] if `id` is unknown.
    pub fn invalidate(&self, id: PendingLoginId) -> Result<(), StorageError> {
        let mut logins = self
            .logins
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let login = logins.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        login.invalid = true;
        Ok(())
    }

    fn find(
        &self,
        predicate: impl Fn(&PendingLogin) -> bool,
    ) -> Result<Option<PendingLogin>, StorageError> {
        Ok(self
            .logins
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .values()
            .find(|login| predicate(login))
            .cloned())
    }

    // Check-and-set under a single write lock.
    fn update(
        &self,
        id: PendingLoginId,
        apply: impl FnOnce(&mut PendingLogin) -> bool,
    ) -> Result<bool, StorageError> {
        let mut logins = self
            .logins
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let login = logins.get_mut(&id).ok_or(StorageError::NotFound(id))?;
        Ok(apply(login))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PendingLoginStore for MemoryStore {
    async fn create(&self, login: &PendingLogin, now: i64) -> Result<bool, StorageError> {
        let mut logins = self
            .logins
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        let taken = logins
            .values()
            .any(|l| l.user == login.user && l.code == login.code && l.is_active(now));
        if taken {
            return Ok(false);
        }
        logins.insert(login.id, login.clone());
        Ok(true)
    }

    async fn has_active(&self, user: &str, code: &str, now: i64) -> Result<bool, StorageError> {
        Ok(self
            .find(|l| l.user == user && l.code == code && l.is_active(now))?
            .is_some())
    }

    async fn count_confirmed(&self, user: &str) -> Result<u64, StorageError> {
        let logins = self
            .logins
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(logins
            .values()
            .filter(|l| l.user == user && l.confirmed)
            .count() as u64)
    }

    async fn find_for_exchange(
        &self,
        user: &str,
        nonce: &str,
        code: &str,
        now: i64,
    ) -> Result<Option<PendingLogin>, StorageError> {
        self.find(|l| {
            l.user.eq_ignore_ascii_case(user)
                && l.nonce == nonce
                && l.code == code
                && l.is_active(now)
        })
    }

    async fn find_unconfirmed(
        &self,
        user: &str,
        code: &str,
        now: i64,
    ) -> Result<Option<PendingLogin>, StorageError> {
        self.find(|l| l.user == user && l.code == code && !l.confirmed && l.is_active(now))
    }

    async fn confirm(&self, id: PendingLoginId) -> Result<bool, StorageError> {
        self.update(id, |login| {
            if login.confirmed || login.exchanged || login.invalid {
                return false;
            }
            login.confirmed = true;
            true
        })
    }

    async fn claim(&self, id: PendingLoginId) -> Result<bool, StorageError> {
        self.update(id, |login| {
            if login.exchanged || login.invalid {
                return false;
            }
            login.exchanged = true;
            true
        })
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_session(&self, session: &Session) -> Result<(), StorageError> {
        self.sessions
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn find_session(&self, token: &str) -> Result<Option<Session>, StorageError> {
        Ok(self
            .sessions
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .get(token)
            .cloned())
    }
}

/// Fixed user list, matched case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct StaticUserDirectory {
    users: Vec<String>,
}

impl StaticUserDirectory {
    /// Directory containing `users` as canonical identities.
    #[must_use]
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: users.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl UserDirectory for StaticUserDirectory {
    async fn resolve(&self, query: &str) -> Result<Option<String>, StorageError> {
        Ok(self
            .users
            .iter()
            .find(|user| user.eq_ignore_ascii_case(query))
            .cloned())
    }
}
