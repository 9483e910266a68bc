use thiserror::Error;
use transaction::{ConcurrencyConflict, TransactionError};

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// The write lost an optimistic concurrency race. Reload and retry.
    #[error("Concurrency conflict: {0}")]
    Conflict(#[from] ConcurrencyConflict),

    /// A Redis error occurred.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The transaction scope failed for a reason other than a conflict.
    #[error("Transaction error: {0}")]
    Transaction(TransactionError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The saga record cannot be stored or loaded as given.
    #[error("Invalid saga: {0}")]
    InvalidSaga(String),

    /// The store was configured with invalid settings.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<TransactionError> for SagaStoreError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::Conflict(conflict) => SagaStoreError::Conflict(conflict),
            TransactionError::Redis(err) => SagaStoreError::Redis(err),
            other => SagaStoreError::Transaction(other),
        }
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, SagaStoreError>;
