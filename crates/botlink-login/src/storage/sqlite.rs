//! SQLite login storage (feature-gated).
//!
//! Both processes open the same database file; every conditional write is a
//! single statement so the check-and-set is atomic across them.
//!
//! The `users` table is owned by the bot: whatever syncs its member list
//! calls [`SqliteStore::add_user`]. The login flow only reads it.

use std::str::FromStr;

use async_trait::async_trait;
use botlink_core::{
    PendingLogin, PendingLoginId, PendingLoginStore, Session, SessionStore, StorageError,
    UserDirectory,
};
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS pending_logins (
    id TEXT PRIMARY KEY NOT NULL,
    code TEXT NOT NULL,
    user_id TEXT NOT NULL,
    nonce TEXT NOT NULL,
    confirmed INTEGER NOT NULL DEFAULT 0,
    exchanged INTEGER NOT NULL DEFAULT 0,
    invalid INTEGER NOT NULL DEFAULT 0,
    expires INTEGER NOT NULL,
    require_phishing_confirmation INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS pending_logins_user_code ON pending_logins (user_id, code);
CREATE TABLE IF NOT EXISTS sessions (
    token TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL,
    nonce TEXT NOT NULL,
    invalid INTEGER NOT NULL DEFAULT 0,
    expires INTEGER NOT NULL
);
";

const LOGIN_COLUMNS: &str = "id, code, user_id, nonce, confirmed, exchanged, invalid, expires, \
                             require_phishing_confirmation";

#[allow(clippy::needless_pass_by_value)]
fn internal(e: sqlx::Error) -> StorageError {
    tracing::error!("SQLite error: {e}");
    StorageError::Internal(e.to_string())
}

fn login_from_row(row: &SqliteRow) -> Result<PendingLogin, StorageError> {
    let id: String = row.try_get("id").map_err(internal)?;
    Ok(PendingLogin {
        id: PendingLoginId::parse_str(&id).map_err(|e| StorageError::Internal(e.to_string()))?,
        code: row.try_get("code").map_err(internal)?,
        user: row.try_get("user_id").map_err(internal)?,
        nonce: row.try_get("nonce").map_err(internal)?,
        confirmed: row.try_get("confirmed").map_err(internal)?,
        exchanged: row.try_get("exchanged").map_err(internal)?,
        invalid: row.try_get("invalid").map_err(internal)?,
        expires: row.try_get("expires").map_err(internal)?,
        require_phishing_confirmation: row
            .try_get("require_phishing_confirmation")
            .map_err(internal)?,
    })
}

/// SQLite storage implementation.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `database_url` and apply
    /// the schema.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the database cannot be opened.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(internal)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(internal)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database, for tests and demos.
    ///
    /// # Errors
    /// Returns error if the database cannot be created.
    pub async fn in_memory() -> Result<Self, StorageError> {
        // Each connection to :memory: is a separate database; keep exactly one alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(internal)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Create the tables if they do not exist.
    ///
    /// # Errors
    /// Returns error if a statement fails.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    /// Register a user. `id` is the canonical identity.
    ///
    /// # Errors
    /// Returns error if the insert fails.
    pub async fn add_user(&self, id: &str, name: &str) -> Result<(), StorageError> {
        sqlx::query("INSERT OR REPLACE INTO users (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(internal)?;
        Ok(())
    }

    /// Get a pending login by id.
    ///
    /// # Errors
    /// Returns error if the query fails.
    pub async fn get(&self, id: PendingLoginId) -> Result<Option<PendingLogin>, StorageError> {
        let row = sqlx::query(&format!("SELECT {LOGIN_COLUMNS} FROM pending_logins WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        row.as_ref().map(login_from_row).transpose()
    }
}

#[async_trait]
impl UserDirectory for SqliteStore {
    /// Match on the id first; fall back to the display name only when exactly
    /// one user carries it.
    async fn resolve(&self, query: &str) -> Result<Option<String>, StorageError> {
        let by_id = sqlx::query("SELECT id FROM users WHERE id = ? COLLATE NOCASE LIMIT 1")
            .bind(query)
            .fetch_optional(&self.pool)
            .await
            .map_err(internal)?;
        if let Some(row) = by_id {
            return row.try_get("id").map(Some).map_err(internal);
        }

        let by_name = sqlx::query("SELECT id FROM users WHERE name = ? COLLATE NOCASE LIMIT 2")
            .bind(query)
            .fetch_all(&self.pool)
            .await
            .map_err(internal)?;
        match by_name.as_slice() {
            [row] => row.try_get("id").map(Some).map_err(internal),
            [] => Ok(None),
            _ => {
                tracing::warn!(name = query, "Display name matches several users");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl PendingLoginStore for SqliteStore {
    async fn create(&self, login: &PendingLogin, now: i64) -> Result<bool, StorageError> {
        let result = sqlx::query(&format!(
            "INSERT INTO pending_logins ({LOGIN_COLUMNS}) \
             SELECT ?, ?, ?, ?, ?, ?, ?, ?, ? \
             WHERE NOT EXISTS (SELECT 1 FROM pending_logins \
             WHERE user_id = ? AND code = ? AND exchanged = 0 AND invalid = 0 AND expires > ?)"
        ))
        .bind(login.id.to_string())
        .bind(&login.code)
        .bind(&login.user)
        .bind(&login.nonce)
        .bind(login.confirmed)
        .bind(login.exchanged)
        .bind(login.invalid)
        .bind(login.expires)
        .bind(login.require_phishing_confirmation)
        .bind(&login.user)
        .bind(&login.code)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() == 1)
    }

    async fn has_active(&self, user: &str, code: &str, now: i64) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT 1 FROM pending_logins \
             WHERE user_id = ? AND code = ? AND exchanged = 0 AND invalid = 0 AND expires > ? \
             LIMIT 1",
        )
        .bind(user)
        .bind(code)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        Ok(row.is_some())
    }

    async fn count_confirmed(&self, user: &str) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) AS confirmed FROM pending_logins WHERE user_id = ? AND confirmed = 1",
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await
        .map_err(internal)?
        .try_get("confirmed")
        .map_err(internal)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn find_for_exchange(
        &self,
        user: &str,
        nonce: &str,
        code: &str,
        now: i64,
    ) -> Result<Option<PendingLogin>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {LOGIN_COLUMNS} FROM pending_logins \
             WHERE user_id = ? COLLATE NOCASE AND nonce = ? AND code = ? \
             AND exchanged = 0 AND invalid = 0 AND expires > ? LIMIT 1"
        ))
        .bind(user)
        .bind(nonce)
        .bind(code)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        row.as_ref().map(login_from_row).transpose()
    }

    async fn find_unconfirmed(
        &self,
        user: &str,
        code: &str,
        now: i64,
    ) -> Result<Option<PendingLogin>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {LOGIN_COLUMNS} FROM pending_logins \
             WHERE user_id = ? AND code = ? AND confirmed = 0 \
             AND exchanged = 0 AND invalid = 0 AND expires > ? LIMIT 1"
        ))
        .bind(user)
        .bind(code)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        row.as_ref().map(login_from_row).transpose()
    }

    async fn confirm(&self, id: PendingLoginId) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE pending_logins SET confirmed = 1 \
             WHERE id = ? AND confirmed = 0 AND exchanged = 0 AND invalid = 0",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim(&self, id: PendingLoginId) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE pending_logins SET exchanged = 1 \
             WHERE id = ? AND exchanged = 0 AND invalid = 0",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() == 1)
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_session(&self, session: &Session) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO sessions (token, user_id, nonce, invalid, expires) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&session.token)
        .bind(&session.user)
        .bind(&session.nonce)
        .bind(session.invalid)
        .bind(session.expires)
        .execute(&self.pool)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn find_session(&self, token: &str) -> Result<Option<Session>, StorageError> {
        let row = sqlx::query(
            "SELECT token, user_id, nonce, invalid, expires FROM sessions WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .map_err(internal)?;
        row.map(|row| {
            Ok(Session {
                user: row.try_get("user_id").map_err(internal)?,
                token: row.try_get("token").map_err(internal)?,
                nonce: row.try_get("nonce").map_err(internal)?,
                invalid: row.try_get("invalid").map_err(internal)?,
                expires: row.try_get("expires").map_err(internal)?,
            })
        })
        .transpose()
    }
}
