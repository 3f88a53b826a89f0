//! Server and request-dispatch error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {message}")]
    BindFailed { addr: String, message: String },

    #[error("malformed HTTP request: {0}")]
    MalformedRequest(String),

    #[error("request body too large: {size} bytes (limit {limit})")]
    BodyTooLarge { size: usize, limit: usize },

    #[error("rate limited: retry after {retry_after_seconds}s")]
    RateLimited { retry_after_seconds: u64 },

    #[error("server is shutting down")]
    ShuttingDown,
}
