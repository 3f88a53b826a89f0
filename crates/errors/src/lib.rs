#![deny(clippy::pedantic, unsafe_code)]
#![allow(clippy::module_name_repetitions)]

//! Error types for the provd provisioning daemon
//!
//! One enum per domain (cache, executor, network, server, config, input),
//! aggregated into [`Error`] for cross-crate boundaries. Cancellation is a
//! first-class variant so callers can keep it out of the error logs.

use thiserror::Error;

pub mod cache;
pub mod config;
pub mod executor;
pub mod input;
pub mod network;
pub mod server;

pub use cache::CacheError;
pub use config::ConfigError;
pub use executor::ExecutorError;
pub use input::InputError;
pub use network::NetworkError;
pub use server::ServerError;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("input error: {0}")]
    Input(#[from] InputError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
        path: Option<std::path::PathBuf>,
    },
}

impl Error {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// An I/O error annotated with the path being touched
    pub fn io_with_path(err: &std::io::Error, path: impl Into<std::path::PathBuf>) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
            path: Some(path.into()),
        }
    }

    /// Whether this error is a cancellation (benign, never logged as a fault)
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::Executor(ExecutorError::Cancelled)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
            path: None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
