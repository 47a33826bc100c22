//! Protocol error types and error classes.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },

    #[error("framer is in a failed state; reset required")]
    FramerFailed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
}

impl ProtocolError {
    /// Returns the error class for this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            ProtocolError::Io(_) => ErrorClass::Transport,
            _ => ErrorClass::Protocol,
        }
    }
}

/// Reasons a handshake is rejected.
///
/// Every variant is a hard reject: the connection is closed and no partial
/// trust is granted.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed handshake: {0}")]
    Malformed(String),

    #[error("expected handshake as first frame, got {0}")]
    UnexpectedMessage(String),

    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("signed handshake required")]
    SignatureRequired,

    #[error("missing handshake field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field} encoding: {reason}")]
    InvalidEncoding { field: &'static str, reason: String },

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("nIndex mismatch: presented {presented}, derived {derived}")]
    IndexMismatch { presented: f64, derived: f64 },

    #[error("negHash mismatch")]
    HashMismatch,

    #[error("signature verification failed")]
    BadSignature,

    #[error("handshake rejected by verifier")]
    Rejected,
}

/// Error taxonomy shared by clients and servers.
///
/// The class decides what a connection does with a failure: protocol and
/// resource errors are fatal to the connection, transport errors are
/// retried by clients, configuration errors fail fast. `Unknown` covers
/// failures outside the taxonomy, such as a crashed connection task, and is
/// never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Protocol,
    Transport,
    Resource,
    Configuration,
    Unknown,
}

impl ErrorClass {
    /// Returns whether a client should take the reconnect path.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::Transport | ErrorClass::Protocol | ErrorClass::Resource
        )
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Protocol => write!(f, "protocol"),
            ErrorClass::Transport => write!(f, "transport"),
            ErrorClass::Resource => write!(f, "resource"),
            ErrorClass::Configuration => write!(f, "configuration"),
            ErrorClass::Unknown => write!(f, "unknown"),
        }
    }
}
