//! Error types for filestorage

use std::io;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File not found: {0}")]
    NotFound(u64),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Header too large: {size} bytes (limit {limit})")]
    HeaderTooLarge { size: usize, limit: usize },

    #[error("Corrupt header: {0}")]
    CorruptHeader(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    /// Map an I/O error on a record path, turning "no such file" into `NotFound`.
    pub fn from_record_io(err: io::Error, id: u64) -> Self {
        if err.kind() == io::ErrorKind::NotFound {
            StorageError::NotFound(id)
        } else {
            StorageError::Io(err)
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        StorageError::Delivery(err.to_string())
    }
}
