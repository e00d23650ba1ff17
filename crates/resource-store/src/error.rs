//! Error types for the resource store.

use thiserror::Error;

/// Why a payload was rejected by a [`ContentValidator`](crate::validator::ContentValidator).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContentInvalidReason {
    #[error("content can't be decoded")]
    CantDecode,

    #[error("declared type {declared} does not match detected type {detected}")]
    UnmatchedFormat { declared: String, detected: String },

    #[error("bad size {width}x{height}")]
    BadSize { width: u32, height: u32 },

    #[error("content of {size} bytes exceeds limit of {limit} bytes")]
    TooBig { size: usize, limit: usize },
}

/// Errors produced by blob, digest and resource operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("content invalid: {0}")]
    ContentInvalid(#[from] ContentInvalidReason),

    #[error("not found: {0}")]
    NotFound(String),

    /// A row references a blob tag that is absent from the blob table.
    #[error("database corrupted: {0}")]
    DatabaseCorrupted(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    TimedOut,
}

impl StoreError {
    /// Backing-store failures that may succeed on retry.
    ///
    /// Read-only operations can be retried freely. `retain` and `free` must not be
    /// retried once their success is uncertain: the refcount is not idempotent.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Storage(_) | StoreError::Io(_) | StoreError::TimedOut
        )
    }

    /// Consistency failures that must surface as hard errors.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::DatabaseCorrupted(_))
    }
}

/// Result type for resource store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
