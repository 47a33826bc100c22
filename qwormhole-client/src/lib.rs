//! # qwormhole-client
//!
//! Client side of the qwormhole transport kernel.
//!
//! This crate provides:
//! - A transport capability trait with a TCP/TLS fallback and a selector
//! - A connection driver: connect, handshake, framed send/receive, heartbeat
//! - Reconnection with exponential backoff
//! - Optional token-bucket rate limiting with send priorities

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod stream;
pub mod tcp;
pub mod tls;
pub mod transport;

#[cfg(test)]
mod scenarios;

pub use client::{Client, ClientEvents, SendOptions};
pub use config::{ClientConfig, TlsClientConfig};
pub use connection::{ClientEvent, ConnectionState};
pub use error::ClientError;
pub use qwormhole_core::ReconnectConfig;
pub use tcp::TcpTransport;
pub use transport::{
    ConnectOptions, StreamReader, StreamWriter, TransportCapability, TransportChannel,
    TransportKind, TransportPreference, TransportReader, TransportSelector, TransportWriter,
};
