use thiserror::Error;
use transaction::TransactionError;

/// Errors that can occur when reading or maintaining the outbox stream.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// A Redis error occurred.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Enlisting or committing a scoped write failed.
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// The outbox was configured with invalid settings.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors reported by a transport send.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The destination could not be reached. Worth retrying.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// The destination refused the message.
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// The message could not be enlisted in the outbox.
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),
}

impl TransportError {
    /// Whether sending the same message again may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::Rejected(_))
    }
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
