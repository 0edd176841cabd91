//! Error types for the tiercache-store crate.
//!
//! Fallible setup and maintenance calls return [`StoreError`] via
//! [`StoreResult`]. The [`CacheStore`](crate::CacheStore) contract itself is
//! infallible: tier failures are logged at the boundary and degrade to a
//! cache miss.

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the cache tiers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization of a cache value failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The durable tier has been closed and no longer accepts work.
    #[error("durable cache is closed")]
    Closed,

    /// The durable worker thread could not be spawned or dropped a reply.
    #[error("durable worker failed: {0}")]
    Worker(String),

    /// A stored target id could not be parsed back into a UUID.
    #[error("invalid target id `{id}`: {reason}")]
    InvalidTarget { id: String, reason: String },
}
