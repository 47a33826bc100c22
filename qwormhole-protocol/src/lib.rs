//! # qwormhole-protocol
//!
//! Wire protocol implementation for qwormhole.
//!
//! This crate provides:
//! - Length-prefixed framing with a stateful, split-tolerant decoder
//! - Raw (unframed) mode for message-preserving transports
//! - Typed control messages (handshake, heartbeat) validated at the socket boundary
//! - Plain and signed handshake construction and verification
//! - Error taxonomy shared by the client and server crates

pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;

pub use codec::{FrameEvent, Framer, FramingMode};
pub use error::{ErrorClass, HandshakeError, ProtocolError};
pub use frame::{encode_frame, FRAME_HEADER_SIZE};
pub use handshake::{HandshakeIdentity, HandshakeVerifier, TagCheck};
pub use message::{ControlMessage, HandshakeMessage, HandshakeRecord, Heartbeat, TagValue, Tags};

/// Default maximum frame payload size (4 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: u32 = 4 * 1024 * 1024;

/// Default per-connection outbound queue limit before a connection is dropped (5 MiB).
pub const DEFAULT_MAX_BACKPRESSURE_BYTES: usize = 5 * 1024 * 1024;
