//! Error types for beacon-core
//!
//! Transport failures are not errors: they surface as
//! [`Outcome`](crate::collector::Outcome) values and are always retried.

use thiserror::Error;

/// Main error type for the beacon-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Durable storage error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Collector client setup error
    #[error("collector error: {0}")]
    Collector(String),

    /// Stored record written by an unknown format version
    #[error("unsupported storage format version {found} (expected {expected})")]
    UnsupportedFormat { found: u32, expected: u32 },

    /// A lock guarding shared state was poisoned by a panicking thread
    #[error("lock poisoned during {0}")]
    LockPoisoned(&'static str),
}

/// Result type alias for beacon-core
pub type Result<T> = std::result::Result<T, Error>;
