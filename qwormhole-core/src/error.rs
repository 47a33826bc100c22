//! Core error types.

use qwormhole_protocol::ErrorClass;
use thiserror::Error;

/// Errors from kernel primitives.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid {field}: {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CoreError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        CoreError::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}
