use common::Revision;
use thiserror::Error;

/// A write was rejected because the stored state moved on since it was read.
///
/// Conflicts are never retried internally: the caller has to reload and
/// decide again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConcurrencyConflict {
    /// An insert found the key already present.
    #[error("{key} already exists")]
    AlreadyExists { key: String },

    /// An update expected a different stored revision.
    #[error("Revision mismatch for {key}: expected stored revision {expected}, found {actual}")]
    RevisionMismatch {
        key: String,
        expected: Revision,
        actual: Revision,
    },

    /// An update targeted a key that no longer exists.
    #[error("{key} does not exist")]
    Missing { key: String },

    /// A watched key was written by another client between the precondition
    /// checks and `EXEC`; the transaction was discarded.
    #[error("{} changed during the transaction", .keys.join(", "))]
    WatchedKeyChanged { keys: Vec<String> },
}

/// Errors raised while running or committing scoped Redis operations.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// The Redis server or connection failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// A precondition rejected the write.
    #[error("Concurrency conflict: {0}")]
    Conflict(#[from] ConcurrencyConflict),

    /// Redis answered with a reply the operation could not interpret.
    #[error("Unexpected reply to {operation}: {detail}")]
    UnexpectedReply {
        operation: &'static str,
        detail: String,
    },
}

impl TransactionError {
    /// Returns the conflict if this error is one.
    pub fn as_conflict(&self) -> Option<&ConcurrencyConflict> {
        match self {
            TransactionError::Conflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, TransactionError>;
