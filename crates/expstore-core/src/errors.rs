//! Error types for expectations store operations.

use thiserror::Error;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, ExpStoreError>;

/// Errors surfaced to callers of the expectations store.
#[derive(Debug, Error)]
pub enum ExpStoreError {
    /// Invalid configuration or partition scope. Never retried.
    #[error("config error: {0}")]
    Config(String),

    /// A mutating call was made on a store opened in read-only mode.
    #[error("expectations store is in read-only mode")]
    ReadOnly,

    /// A backend operation failed after the bounded retries were used up.
    #[error("{op} on partition {partition} failed: {source}")]
    Backend {
        /// Name of the store operation that failed.
        op: String,
        /// Partition the operation was bound to.
        partition: String,
        #[source]
        source: BackendError,
    },

    /// A stored document could not be decoded into its schema type.
    #[error("corrupt {kind} document {id}: {message}")]
    Corrupt {
        kind: &'static str,
        id: String,
        message: String,
    },

    /// The requested audit artifact does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller supplied an unusable argument.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl ExpStoreError {
    pub(crate) fn backend(op: &str, partition: &str, source: BackendError) -> Self {
        ExpStoreError::Backend {
            op: op.to_string(),
            partition: partition.to_string(),
            source,
        }
    }

    /// True for the read-only policy error.
    pub fn is_read_only(&self) -> bool {
        matches!(self, ExpStoreError::ReadOnly)
    }
}

/// Errors raised by a [`crate::backend::DocumentStore`] implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend is temporarily unable to serve the request.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A single attempt exceeded its operation deadline.
    #[error("{0} timed out")]
    Timeout(String),

    /// A watch subscriber fell behind the change feed and missed batches.
    #[error("watch stream lagged by {0} batches")]
    StreamLagged(u64),

    /// The change feed was shut down.
    #[error("watch stream closed")]
    StreamClosed,

    /// A write batch exceeded the per-commit document cap.
    #[error("write batch of {count} documents exceeds the maximum of {max}")]
    BatchTooLarge { count: usize, max: usize },

    /// The query cannot be expressed against this backend.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackendError {
    /// Whether a retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Unavailable(_)
            | BackendError::Timeout(_)
            | BackendError::StreamLagged(_) => true,
            BackendError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
