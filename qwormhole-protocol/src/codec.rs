//! Stateful framer for length-prefixed and raw streams.

use crate::error::ProtocolError;
use crate::frame::{decode_frame, encode_frame};
use crate::DEFAULT_MAX_FRAME_LENGTH;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// How message boundaries are recovered from the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FramingMode {
    /// 4-byte big-endian length header before every payload.
    #[default]
    LengthPrefixed,
    /// No header; every read is one message. Only meaningful when the
    /// transport itself preserves message boundaries.
    Raw,
}

/// Output of [`Framer::push`].
#[derive(Debug)]
pub enum FrameEvent {
    /// A complete payload.
    Payload(Bytes),
    /// Terminal decoding error. The stream cannot be resynchronized.
    Error(ProtocolError),
}

/// Accumulates partial reads and yields whole payloads in arrival order.
///
/// Headers may be split at any byte; several frames may arrive in a single
/// chunk. A declared length above the limit latches the framer into a failed
/// state: the error is reported once and further input is ignored until
/// [`Framer::reset`].
#[derive(Debug)]
pub struct Framer {
    mode: FramingMode,
    max_frame_length: u32,
    buffer: BytesMut,
    raw_chunks: VecDeque<Bytes>,
    failed: bool,
}

impl Framer {
    pub fn new(mode: FramingMode, max_frame_length: u32) -> Self {
        Self {
            mode,
            max_frame_length,
            buffer: BytesMut::with_capacity(8192),
            raw_chunks: VecDeque::new(),
            failed: false,
        }
    }

    /// Creates a length-prefixed framer with the default frame limit.
    pub fn length_prefixed() -> Self {
        Self::new(FramingMode::LengthPrefixed, DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn mode(&self) -> FramingMode {
        self.mode
    }

    pub fn max_frame_length(&self) -> u32 {
        self.max_frame_length
    }

    /// Encodes a payload for the wire.
    ///
    /// In raw mode the payload is returned unchanged.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, ProtocolError> {
        match self.mode {
            FramingMode::LengthPrefixed => {
                Ok(encode_frame(payload, self.max_frame_length)?.freeze())
            }
            FramingMode::Raw => Ok(Bytes::copy_from_slice(payload)),
        }
    }

    /// Appends a chunk and returns every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<FrameEvent> {
        if self.failed {
            return Vec::new();
        }

        self.extend(chunk);

        let mut events = Vec::new();
        loop {
            match self.next_frame() {
                Ok(Some(payload)) => events.push(FrameEvent::Payload(payload)),
                Ok(None) => break,
                Err(e) => {
                    events.push(FrameEvent::Error(e));
                    break;
                }
            }
        }
        events
    }

    /// Appends data to the internal buffer without decoding.
    pub fn extend(&mut self, chunk: &[u8]) {
        if self.failed || chunk.is_empty() {
            return;
        }
        match self.mode {
            FramingMode::LengthPrefixed => self.buffer.extend_from_slice(chunk),
            FramingMode::Raw => self.raw_chunks.push_back(Bytes::copy_from_slice(chunk)),
        }
    }

    /// Attempts to decode the next payload from the buffer.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.failed {
            return Err(ProtocolError::FramerFailed);
        }

        match self.mode {
            FramingMode::Raw => Ok(self.raw_chunks.pop_front()),
            FramingMode::LengthPrefixed => {
                match decode_frame(&mut self.buffer, self.max_frame_length) {
                    Ok(frame) => Ok(frame),
                    Err(e) => {
                        self.failed = true;
                        self.buffer.clear();
                        Err(e)
                    }
                }
            }
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len() + self.raw_chunks.iter().map(Bytes::len).sum::<usize>()
    }

    /// Returns whether a terminal error has been reported.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Clears buffered state and the failure latch.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.raw_chunks.clear();
        self.failed = false;
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::length_prefixed()
    }
}
