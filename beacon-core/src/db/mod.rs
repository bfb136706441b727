//! Durable storage for beacon
//!
//! This module provides the storage layer using SQLite with:
//! - Schema migrations
//! - A key-value record store used for the pending queue and identifiers

pub mod repo;
pub mod schema;

pub use repo::Database;

use crate::error::Result;

/// Durable string records addressed by key.
///
/// Writes replace the whole record; there is no partial update.
pub trait KeyValueStore: Send + Sync {
    /// Returns the record for `key`, or `None` if absent
    fn get_string(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous record
    fn set_string(&self, key: &str, value: &str) -> Result<()>;

    /// Deletes the record for `key`; absent keys are not an error
    fn remove(&self, key: &str) -> Result<()>;
}
