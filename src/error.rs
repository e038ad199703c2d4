//! Error types for airlimit.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Main error type for limiter operations.
///
/// A rejected request is never an error: limiters report it as `Ok(false)`.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Invalid limiter parameters (non-positive rate, zero window, ...)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A fixed-window call arrived outside its window
    #[error("Time {now} is outside the fixed window [{left}, {right}]")]
    OutsideWindow {
        now: DateTime<Utc>,
        left: DateTime<Utc>,
        right: DateTime<Utc>,
    },

    /// Fixed-window mode was requested but no boundaries are known
    #[error("Fixed window requested but no window boundaries are configured")]
    MissingFixedWindow,

    /// Shared store failures reported by a script executor
    #[error("Store error: {0}")]
    Store(String),

    /// A store script returned something other than an admission flag
    #[error("Unexpected script reply: {0}")]
    UnexpectedReply(i64),

    /// A store command did not finish within the configured timeout
    #[error("Store command timed out after {0:?}")]
    Timeout(Duration),

    /// Redis client errors
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
