//! Error types for nixie-rpc
//!
//! These cover the service lifecycle and transport plumbing. Failures of an
//! individual outbound call have their own taxonomy in [`crate::call`].

use thiserror::Error;

/// Result type alias for service operations
pub type RpcResult<T> = std::result::Result<T, RpcError>;

/// Service lifecycle and transport error types
#[derive(Error, Debug)]
pub enum RpcError {
    #[error(transparent)]
    Bus(#[from] nixie_bus::BusError),

    #[error(transparent)]
    Codec(#[from] nixie_core::Error),

    #[error("service {service} is already started")]
    AlreadyStarted { service: String },

    #[error("service {service} is not started")]
    NotStarted { service: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::AlreadyStarted {
            service: "auth".into(),
        };
        assert!(err.to_string().contains("auth"));
    }
}
