//! Error types for nixie-core
//!
//! Explicit error variants with context, using thiserror.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid service name: {name}, reason: {reason}")]
    InvalidServiceName { name: String, reason: String },

    #[error("invalid worker key: {key}, reason: {reason}")]
    InvalidWorkerKey { key: String, reason: String },

    #[error("envelope encode failed: {reason}")]
    EnvelopeEncodeFailed { reason: String },

    #[error("envelope decode failed: {reason}")]
    EnvelopeDecodeFailed { reason: String },

    #[error("invalid configuration: {field}, reason: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create an envelope decode error
    pub fn decode_failed(reason: impl Into<String>) -> Self {
        Self::EnvelopeDecodeFailed {
            reason: reason.into(),
        }
    }

    /// Create an envelope encode error
    pub fn encode_failed(reason: impl Into<String>) -> Self {
        Self::EnvelopeEncodeFailed {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}
