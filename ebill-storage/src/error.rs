//! Storage error types.

use thiserror::Error;

use crate::types::DeleteReport;

/// Object storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: gs://{bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("bucket not found: {0}")]
    BucketNotFound(String),

    #[error("already exists: {0}")]
    Conflict(String),

    #[error("{operation} failed with HTTP {status}: {body}")]
    Backend {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("archive error: {0}")]
    Archive(String),

    #[error("bulk delete incomplete: {} of {} key(s) failed", .0.failed.len(), .0.total())]
    BulkDelete(DeleteReport),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        StorageError::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Missing object or missing bucket.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::NotFound { .. } | StorageError::BucketNotFound(_)
        )
    }
}

impl From<zip::result::ZipError> for StorageError {
    fn from(err: zip::result::ZipError) -> Self {
        StorageError::Archive(err.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
