//! Image download error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("not a valid download URL: {0}")]
    InvalidUrl(String),

    #[error("image download failed: {0}")]
    DownloadFailed(String),

    #[error("server answered HTTP {status}: {message}")]
    HttpError { status: u16, message: String },

    #[error("downloaded image checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}
