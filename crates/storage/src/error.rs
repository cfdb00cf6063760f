//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The key collides with an existing directory, or one of its parents
    /// is an existing blob.
    #[error("key conflicts with existing layout: {0}")]
    Conflict(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Map an I/O error for `key`. A missing file, or a parent that is not a
    /// directory, becomes [`StorageError::NotFound`].
    pub(crate) fn from_io(key: &str, e: std::io::Error) -> Self {
        if matches!(
            e.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory
        ) {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Io(e)
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
