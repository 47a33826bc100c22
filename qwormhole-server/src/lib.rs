//! # qwormhole-server
//!
//! TCP server for qwormhole.
//!
//! This crate provides:
//! - Listener with ordered admission (hooks, connection limit, TLS, handshake)
//! - Connection registry with broadcast and targeted sends
//! - Per-connection backpressure enforcement and graceful close
//! - YAML daemon configuration
//! - Prometheus exporter over HTTP

pub mod config;
pub mod error;
pub mod hooks;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod stream;
pub mod tls;

pub use config::{
    Config, ConfigError, FramingConfig, HandshakeConfig, MetricsConfig, NetworkConfig, TlsConfig,
};
pub use error::ServerError;
pub use hooks::{AllowAll, ConnectionHooks, KeyAllowList};
pub use registry::{ConnectionId, ConnectionInfo};
pub use server::{Server, ServerConfig, ServerEvent, ServerEvents};
pub use session::CLOSE_DRAIN_TIMEOUT;
