//! Error types and Result aliases for dirindex.
//!
//! This module defines the error hierarchy used throughout the crate.
//! All public functions return `Result<T, Error>` or `Result<T>`.
//!
//! Ingestion errors are classified as transient or permanent so the
//! pipeline knows whether to retry; query errors are returned to the
//! caller as-is.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for dirindex operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Path filter construction error.
    #[error("filter error: {0}")]
    Filter(#[from] FilterError),

    /// Database/storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Embedding generation error.
    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// File watching error.
    #[error("watcher error: {0}")]
    Watcher(#[from] WatcherError),

    /// Chunking error.
    #[error("chunk error: {0}")]
    Chunk(#[from] ChunkError),

    /// Reconciliation error.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Query error.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Server/API error.
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Path filter errors. Only raised while the filter is being built.
#[derive(Error, Debug)]
pub enum FilterError {
    /// An exclusion pattern could not be compiled.
    #[error("invalid exclusion pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A watch root is not an absolute path.
    #[error("watch root must be absolute: {0}")]
    RelativeRoot(String),
}

/// Storage-specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// `SQLite` database error.
    #[error("database error: {0}")]
    Database(String),

    /// Database is locked or busy; the operation may succeed if retried.
    #[error("database busy: {0}")]
    Busy(String),

    /// Record not found.
    #[error("not found: {entity} with id '{id}'")]
    NotFound { entity: &'static str, id: String },

    /// Schema migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Vector operation error.
    #[error("vector error: {0}")]
    Vector(String),
}

/// Embedding-specific errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingError {
    /// Timeout, connection failure, rate limiting or a 5xx response.
    #[error("transient embedding failure: {0}")]
    Transient(String),

    /// Input rejected or response unusable; retrying will not help.
    #[error("permanent embedding failure: {0}")]
    Permanent(String),

    /// The service answered with a vector of the wrong length.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// File watcher errors.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// Failed to watch path.
    #[error("failed to watch path '{path}': {reason}")]
    WatchFailed { path: String, reason: String },

    /// Downstream stage stopped receiving events.
    #[error("event channel closed")]
    ChannelClosed,
}

/// Chunking errors. The file is skipped and the pipeline moves on.
#[derive(Error, Debug)]
pub enum ChunkError {
    /// Content looks binary.
    #[error("binary content in '{0}'")]
    Binary(String),

    /// File exceeds the configured size limit.
    #[error("file '{path}' is {size} bytes, limit is {limit}")]
    TooLarge { path: String, size: u64, limit: u64 },

    /// File could not be read.
    #[error("failed to read '{path}': {reason}")]
    Unreadable { path: String, reason: String },
}

/// Reconciliation errors.
#[derive(Error, Debug)]
pub enum IndexError {
    /// Retried with backoff before giving up.
    #[error("transient index failure for '{path}': {reason}")]
    Transient { path: String, reason: String },

    /// Dropped and logged; the file heals on its next change.
    #[error("permanent index failure for '{path}': {reason}")]
    Permanent { path: String, reason: String },
}

/// Query errors, returned synchronously and never retried.
#[derive(Error, Debug)]
pub enum QueryError {
    /// Nothing is indexed under the requested path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The query itself is malformed.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// Server/API errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {address}: {reason}")]
    BindFailed { address: String, reason: String },

    /// Request handling error.
    #[error("request error: {0}")]
    Request(String),
}

impl Error {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the failed operation can succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::Embedding(e) => e.is_transient(),
            Self::Index(IndexError::Transient { .. }) | Self::Watcher(WatcherError::WatchFailed { .. }) => true,
            _ => false,
        }
    }
}

impl StorageError {
    /// Create a not-found error.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Whether retrying the failed operation can succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => Self::Busy(err.to_string()),
            _ => Self::Database(err.to_string()),
        }
    }
}

impl EmbeddingError {
    /// Whether the embedder client should retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl IndexError {
    /// Classify a storage failure for the given path.
    #[must_use]
    pub fn from_storage(path: impl Into<String>, err: &StorageError) -> Self {
        let path = path.into();
        let reason = err.to_string();
        if err.is_transient() {
            Self::Transient { path, reason }
        } else {
            Self::Permanent { path, reason }
        }
    }
}

#[cfg(test)]
mod tests;
