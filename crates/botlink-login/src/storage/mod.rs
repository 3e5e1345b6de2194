//! Storage implementations.

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "memory")]
pub use memory::{MemoryStore, StaticUserDirectory};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
