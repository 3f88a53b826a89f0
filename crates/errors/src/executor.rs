//! Stage executor and process supervision error types

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    #[error("failed to spawn stage executor {program}: {message}")]
    SpawnFailed { program: String, message: String },

    #[error("stage produced no output for {seconds}s")]
    SilenceTimeout { seconds: u64 },

    #[error("stage exceeded maximum duration of {seconds}s")]
    OverallTimeout { seconds: u64 },

    #[error("stage exited with status {status} without reporting a result")]
    NoTerminalRecord { status: i32 },

    #[error("stage cancelled")]
    Cancelled,

    #[error("device error on {device}: {message}")]
    DeviceError { device: String, message: String },
}
