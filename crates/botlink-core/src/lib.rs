//! Shared building blocks for the bot ↔ API login bridge.
//!
//! This crate provides:
//! - `PendingLogin` / `Session` - Records persisted in shared storage
//! - Storage traits the login flow relies on
//! - Environment configuration

pub mod config;
pub mod login;
pub mod traits;

pub use config::{BridgeConfig, ConfigError, LoginConfig, ServerConfig};
pub use login::{PendingLogin, PendingLoginId, Session, now_millis};
pub use traits::{PendingLoginStore, SessionStore, StorageError, UserDirectory};
