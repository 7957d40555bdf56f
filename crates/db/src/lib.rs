//! Sqlite-backed implementations of the core storage ports: canonical
//! events, suggestions, and the append-only workflow log.

pub mod connection;
pub mod migrations;
pub mod repositories;

pub use connection::{connect, connect_with_settings, DbPool};
pub use repositories::{SqlEventStore, SqlSuggestionStore, SqlWorkflowStore};
