//! Error types shared across the cache, rate limiter and configuration layers

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the cache layer
///
/// Public `CacheStore` and `ResilientFetcher` operations return
/// [`CacheError::InvalidKey`], plus `Serialization` from `set` for a payload
/// that has no JSON form. Storage faults are absorbed by the store, which
/// logs them and degrades to memory-only.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Key or namespace sanitizes to nothing usable
    #[error("Invalid cache key: '{0}'")]
    InvalidKey(String),

    /// Filesystem read/write failed
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be encoded or decoded
    #[error("Record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Blocking storage task panicked or was cancelled
    #[error("Storage task failed: {0}")]
    Task(String),
}

impl From<tokio::task::JoinError> for CacheError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheError::Task(err.to_string())
    }
}

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid JSON for the expected shape
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
