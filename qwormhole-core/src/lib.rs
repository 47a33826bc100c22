//! # qwormhole-core
//!
//! Connection-independent primitives shared by the client and server.
//!
//! This crate provides:
//! - Token-bucket rate limiting with a priority-ordered pending queue
//! - Exponential reconnect backoff
//! - A per-instance Prometheus telemetry aggregator

pub mod error;
pub mod rate_limiter;
pub mod reconnect;
pub mod telemetry;

pub use error::CoreError;
pub use rate_limiter::{Admission, RateLimitConfig, RateLimiter};
pub use reconnect::{ReconnectConfig, ReconnectState};
pub use telemetry::{ConnectionSnapshot, Telemetry, TelemetrySnapshot};
