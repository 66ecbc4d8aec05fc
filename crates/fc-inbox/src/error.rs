//! Error taxonomy for the inbox core.
//!
//! Mirrors the small per-crate `thiserror` enums this ecosystem uses
//! elsewhere: one flat enum, `#[from]` conversions at the driver
//! boundary, a `Result` alias.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum InboxError {
    /// A storage operation failed after the provider's retry budget was
    /// exhausted, or failed in a way classified as non-transient.
    #[error("storage error: {0}")]
    Storage(String),

    /// A storage operation failed in a way the caller can retry; surfaced
    /// only when the provider's own retry budget has been exhausted.
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no handler registered for message type {0:?}")]
    HandlerNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("shutdown in progress")]
    ShutdownInProgress,
}

impl InboxError {
    /// Whether this error represents a condition that is safe to retry
    /// at the call site (as opposed to one a caller should surface).
    pub fn is_transient(&self) -> bool {
        matches!(self, InboxError::Transient(_))
    }
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
impl From<sqlx::Error> for InboxError {
    fn from(err: sqlx::Error) -> Self {
        if is_transient_sqlx_error(&err) {
            InboxError::Transient(err.to_string())
        } else {
            InboxError::Storage(err.to_string())
        }
    }
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
fn is_transient_sqlx_error(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed
    )
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for InboxError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() || err.is_connection_dropped() || err.is_connection_refusal() {
            InboxError::Transient(err.to_string())
        } else {
            InboxError::Storage(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, InboxError>;
