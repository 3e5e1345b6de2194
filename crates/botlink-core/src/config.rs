//! Configuration read from the process environment.
//!
//! Parsing goes through a key lookup function so callers can feed values
//! from anywhere; the `from_env` constructors use `std::env::var`.

use std::{net::SocketAddr, time::Duration};

use thiserror::Error;

/// Default delay before reconnecting a dropped bridge.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Default deadline for one bridge call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default session lifetime (30 days).
pub const DEFAULT_SESSION_LIFETIME: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Default shared database.
pub const DEFAULT_DATABASE_URL: &str = "sqlite://botlink.db";

/// Default HTTP bind address of the API.
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9000";

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Bridge settings.
///
/// The bridge is disabled unless both the endpoint and the credential are
/// set (worker) or the credential is set (API).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// `API_WS_URL`: endpoint the worker connects to.
    pub url: Option<String>,
    /// `API_WS_TOKEN`: static bearer credential.
    pub token: Option<String>,
    /// `BRIDGE_RETRY_SECS`
    pub retry_delay: Duration,
    /// `BRIDGE_CALL_TIMEOUT_SECS`
    pub call_timeout: Duration,
}

impl BridgeConfig {
    /// Parse from a key lookup.
    ///
    /// # Errors
    /// Returns error if a duration is not a whole number of seconds.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            url: non_empty(lookup("API_WS_URL")),
            token: non_empty(lookup("API_WS_TOKEN")),
            retry_delay: seconds(&lookup, "BRIDGE_RETRY_SECS", DEFAULT_RETRY_DELAY)?,
            call_timeout: seconds(&lookup, "BRIDGE_CALL_TIMEOUT_SECS", DEFAULT_CALL_TIMEOUT)?,
        })
    }

    /// Parse from the process environment.
    ///
    /// # Errors
    /// See [`BridgeConfig::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Endpoint and credential, if both are configured.
    #[must_use]
    pub fn client_endpoint(&self) -> Option<(&str, &str)> {
        Some((self.url.as_deref()?, self.token.as_deref()?))
    }
}

/// Login exchange settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginConfig {
    /// `SESSION_LIFETIME_SECS`
    pub session_lifetime: Duration,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            session_lifetime: DEFAULT_SESSION_LIFETIME,
        }
    }
}

impl LoginConfig {
    /// Parse from a key lookup.
    ///
    /// # Errors
    /// Returns error if the lifetime is not a whole number of seconds.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            session_lifetime: seconds(&lookup, "SESSION_LIFETIME_SECS", DEFAULT_SESSION_LIFETIME)?,
        })
    }

    /// Parse from the process environment.
    ///
    /// # Errors
    /// See [`LoginConfig::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Process-level settings shared by both binaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// `DATABASE_URL`
    pub database_url: String,
    /// `API_LISTEN_ADDR` (API only)
    pub listen_addr: SocketAddr,
}

impl ServerConfig {
    /// Parse from a key lookup.
    ///
    /// # Errors
    /// Returns error if the listen address does not parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr =
            non_empty(lookup("API_LISTEN_ADDR")).unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        Ok(Self {
            database_url: non_empty(lookup("DATABASE_URL"))
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            listen_addr: listen_addr
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid {
                    key: "API_LISTEN_ADDR",
                    value: listen_addr.clone(),
                })?,
        })
    }

    /// Parse from the process environment.
    ///
    /// # Errors
    /// See [`ServerConfig::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn seconds<F>(lookup: &F, key: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup(key)) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = BridgeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.url, None);
        assert_eq!(config.token, None);
        assert_eq!(config.retry_delay, DEFAULT_RETRY_DELAY);
        assert_eq!(config.call_timeout, DEFAULT_CALL_TIMEOUT);
        assert!(config.client_endpoint().is_none());
    }

    #[test]
    fn test_client_endpoint_requires_both() {
        let config = BridgeConfig::from_lookup(lookup(&[("API_WS_URL", "ws://api/internal/ws")])).unwrap();
        assert!(config.client_endpoint().is_none());

        let config = BridgeConfig::from_lookup(lookup(&[
            ("API_WS_URL", "ws://api/internal/ws"),
            ("API_WS_TOKEN", "secret"),
            ("BRIDGE_RETRY_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.client_endpoint(), Some(("ws://api/internal/ws", "secret")));
        assert_eq!(config.retry_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_blank_token_disables_bridge() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("API_WS_URL", "ws://api/internal/ws"),
            ("API_WS_TOKEN", "  "),
        ]))
        .unwrap();
        assert!(config.client_endpoint().is_none());
    }

    #[test]
    fn test_server_defaults_and_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.listen_addr, "127.0.0.1:9000".parse().unwrap());

        let config = ServerConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite::memory:"),
            ("API_LISTEN_ADDR", "0.0.0.0:8080"),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.listen_addr.port(), 8080);

        let err = ServerConfig::from_lookup(lookup(&[("API_LISTEN_ADDR", "nowhere")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "API_LISTEN_ADDR", .. }));
    }

    #[test]
    fn test_invalid_duration() {
        let err = LoginConfig::from_lookup(lookup(&[("SESSION_LIFETIME_SECS", "a week")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "SESSION_LIFETIME_SECS", .. }));
    }
}
