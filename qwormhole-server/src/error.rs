//! Server error types.

use crate::registry::ConnectionId;
use qwormhole_protocol::{ErrorClass, HandshakeError, ProtocolError};
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("core error: {0}")]
    Core(#[from] qwormhole_core::CoreError),

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("connection limit reached ({0})")]
    ConnectionLimit(usize),

    #[error("outbound queue of {queued} bytes exceeds {threshold}")]
    Backpressure { queued: usize, threshold: usize },

    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("connection {0} is closing")]
    ConnectionClosing(ConnectionId),

    #[error("timed out: {0}")]
    Timeout(&'static str),

    #[error("server is already listening")]
    AlreadyListening,

    #[error("server shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("connection task failed: {0}")]
    TaskFailed(String),
}

impl ServerError {
    /// Returns the error class reported with `Error` events.
    pub fn class(&self) -> ErrorClass {
        match self {
            ServerError::Io(_)
            | ServerError::Timeout(_)
            | ServerError::TlsHandshake(_)
            | ServerError::ShuttingDown
            | ServerError::UnknownConnection(_)
            | ServerError::ConnectionClosing(_) => ErrorClass::Transport,
            ServerError::Protocol(e) => e.class(),
            ServerError::Handshake(_) | ServerError::Json(_) | ServerError::Rejected(_) => {
                ErrorClass::Protocol
            }
            ServerError::ConnectionLimit(_) | ServerError::Backpressure { .. } => {
                ErrorClass::Resource
            }
            ServerError::Core(_)
            | ServerError::AlreadyListening
            | ServerError::Configuration(_)
            | ServerError::TlsConfig(_) => ErrorClass::Configuration,
            ServerError::TaskFailed(_) => ErrorClass::Unknown,
        }
    }
}
