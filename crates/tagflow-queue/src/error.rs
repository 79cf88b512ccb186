//! Error types for the staging queue.

use thiserror::Error;

/// Staging-queue errors.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Connection pool error.
    #[error("staging store pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),

    /// Store command error.
    #[error("staging store error: {0}")]
    Store(#[from] deadpool_redis::redis::RedisError),

    /// Pool configuration error.
    #[error("staging store configuration error: {0}")]
    Config(String),

    /// Item (de)serialisation error.
    #[error("staging item serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

/// Result type for staging-queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;
