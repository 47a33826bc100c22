//! Client error types.

use qwormhole_core::CoreError;
use qwormhole_protocol::{ErrorClass, HandshakeError, ProtocolError};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out: {0}")]
    Timeout(&'static str),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid configuration: {0}")]
    Core(#[from] CoreError),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
}

impl ClientError {
    /// Returns the error class, which decides between reconnecting and
    /// failing fast.
    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Io(_)
            | ClientError::ConnectionClosed
            | ClientError::NotConnected
            | ClientError::Timeout(_)
            | ClientError::TlsHandshake(_) => ErrorClass::Transport,
            ClientError::Protocol(e) => e.class(),
            ClientError::Handshake(_) | ClientError::Json(_) => ErrorClass::Protocol,
            ClientError::Configuration(_) | ClientError::Core(_) => ErrorClass::Configuration,
        }
    }

    /// Returns whether this error takes the reconnect path.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}
