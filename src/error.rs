//! Custom error types for the service.
//!
//! This module defines the top-level error type, `ServiceError`. Layer-specific
//! errors live next to the code that raises them and convert into it:
//!
//! - **`Config`**: configuration could not be loaded or failed validation
//!   (see [`crate::config::ConfigError`]).
//! - **`Camera`**: a device operation failed (see [`crate::camera::CameraError`]).
//! - **`Protocol`**: an inbound control message was rejected
//!   (see [`crate::protocol::ProtocolError`]).
//! - **`Io`**: socket bind/accept failures.
//!
//! None of these terminate the process once the server is running. Per-message
//! errors are turned into structured replies by the dispatcher; only startup
//! errors (bad config, port in use) reach `main`.

use thiserror::Error;

use crate::camera::CameraError;
use crate::config::ConfigError;
use crate::protocol::ProtocolError;

/// Convenience alias for results using the service error type.
pub type AppResult<T> = std::result::Result<T, ServiceError>;

/// Top-level service error.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration load or validation failure.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Device operation failure.
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    /// Rejected control message.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Socket or filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound channel to the client closed.
    #[error("Connection closed")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ServiceError::Camera(CameraError::NotConnected);
        assert_eq!(err.to_string(), "Camera error: Camera is not connected");
    }

    #[test]
    fn test_protocol_error_conversion() {
        let err: ServiceError = ProtocolError::MissingField("index").into();
        assert!(err.to_string().contains("index"));
    }
}
