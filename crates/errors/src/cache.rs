//! Image cache error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("cache entry not found: {key}")]
    EntryNotFound { key: String },

    #[error("cached file missing from disk: {path}")]
    FileMissing { path: String },

    #[error("hash mismatch during store: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("cache index unreadable: {message}")]
    IndexCorrupted { message: String },

    #[error("cache I/O failed: {message}")]
    IoError { message: String },
}
