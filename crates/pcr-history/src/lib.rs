//! PCAP replay history storage.
//!
//! This crate provides:
//! - The [`HistoryStore`] trait the replay engine records terminal sessions into
//! - A SQLite implementation with paginated, filtered, newest-first queries
//! - Explicit retention operations (`prune`, `clear`)

pub mod error;
pub mod schema;
pub mod store;

pub use error::{HistoryError, Result};
pub use store::{HistoryStore, SqliteHistoryStore};

/// Schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;
