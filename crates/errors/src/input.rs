//! Request input validation error types
//!
//! Input errors are rejected at the server boundary and never enter the
//! provisioning pipeline.

use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum InputError {
    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("no image source: one of cache_key, download_url, local_image_path is required")]
    MissingImageSource,

    #[error("conflicting image sources: specify exactly one of cache_key, download_url, local_image_path")]
    ConflictingImageSources,

    #[error("invalid request document: {message}")]
    MalformedDocument { message: String },

    #[error("invalid device identifier: {device}")]
    InvalidDevice { device: String },
}
