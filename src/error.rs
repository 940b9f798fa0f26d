//! Error types for depot.

use thiserror::Error;

use crate::path::ValidationError;

/// Common error type for depot operations.
#[derive(Error, Debug)]
pub enum DepotError {
    /// Input validation failed before any I/O was attempted.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Referenced file or directory is absent from the backend.
    #[error("{0} not found")]
    NotFound(String),

    /// A directory policy flag denies the requested action.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The operation conflicts with the current state of the item,
    /// e.g. a protected item targeted for deletion or an occupied
    /// destination path.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Failure surfaced by the underlying storage technology.
    #[error("backend error: {0}")]
    Backend(String),

    /// Database error.
    ///
    /// This is a generic database error that wraps errors from any
    /// repository backend. Errors from sqlx are automatically converted.
    #[error("database error: {0}")]
    Database(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// Conversion from sqlx errors
impl From<sqlx::Error> for DepotError {
    fn from(e: sqlx::Error) -> Self {
        DepotError::Database(e.to_string())
    }
}

// Conversion from reqwest errors raised by the HTTP-based adapters
impl From<reqwest::Error> for DepotError {
    fn from(e: reqwest::Error) -> Self {
        DepotError::Backend(e.to_string())
    }
}

/// Result type alias for depot operations.
pub type Result<T> = std::result::Result<T, DepotError>;
