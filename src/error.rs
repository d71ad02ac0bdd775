use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Invalid namespace: {0} (must match [a-z0-9][a-z0-9._-]*)")]
    InvalidNamespace(String),

    #[error("Invalid key: {0} (must match [a-z0-9][a-z0-9._-]*)")]
    InvalidKey(String),

    #[error("Invalid expiry: {0}")]
    InvalidExpiry(String),

    #[error("No such file: {0}")]
    NotFound(PathBuf),

    #[error("Key not found in cache: {0}")]
    KeyNotFound(String),

    #[error("Cache could not be initialized")]
    CacheUnavailable,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
