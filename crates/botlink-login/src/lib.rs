//! Code-based login flow.
//!
//! Provides:
//! - `LoginOrchestrator` - bot-side `requestLogin` handler
//! - `LoginExchange` - API-side `begin` / `complete` operations
//! - HTTP routes (feature: http)
//! - Storage implementations (memory, SQLite)

pub mod code;
pub mod exchange;
pub mod orchestrator;
pub mod storage;

#[cfg(feature = "http")]
pub mod http;

pub use exchange::{BeginResponse, CompleteResponse, ExchangeError, LoginExchange};
pub use orchestrator::{LoginOrchestrator, REQUEST_LOGIN};
