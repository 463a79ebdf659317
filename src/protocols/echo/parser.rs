//! Echo frame parser.
//!
//! A frame is a 4-byte little-endian payload length followed by exactly
//! that many payload bytes.

use crate::runtime::Buffer;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Default upper bound on a declared payload length.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

/// A complete frame found at the head of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// Payload bytes, borrowed from the input.
    pub payload: &'a [u8],
    /// Header plus payload length, i.e. bytes to consume.
    pub consumed: usize,
}

/// Protocol violations. Fatal to the connection that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Declared or supplied payload length exceeds the limit.
    Oversized { length: usize, max: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Oversized { length, max } => {
                write!(f, "message too long: {length} bytes exceeds limit of {max}")
            }
        }
    }
}

impl std::error::Error for FrameError {}

/// Length-prefixed frame codec with a payload size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl FrameCodec {
    /// Create a codec that rejects payloads longer than `max_message_size`.
    ///
    /// The limit is clamped to what the 4-byte length field can express.
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size: max_message_size.min(u32::MAX as usize),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Try to decode one frame from the head of `input`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. The length check runs
    /// as soon as the header is complete, so an oversized frame is rejected
    /// before any of its body arrives.
    pub fn try_decode<'a>(&self, input: &'a [u8]) -> Result<Option<Frame<'a>>, FrameError> {
        let Some(header) = input.first_chunk::<HEADER_LEN>() else {
            return Ok(None);
        };

        let length = u32::from_le_bytes(*header) as usize;
        if length > self.max_message_size {
            return Err(FrameError::Oversized {
                length,
                max: self.max_message_size,
            });
        }

        let consumed = HEADER_LEN + length;
        if input.len() < consumed {
            return Ok(None);
        }

        Ok(Some(Frame {
            payload: &input[HEADER_LEN..consumed],
            consumed,
        }))
    }

    /// Append `payload` as a frame to `output`.
    ///
    /// The sender enforces the same limit as the receiver.
    pub fn encode(&self, payload: &[u8], output: &mut Buffer) -> Result<(), FrameError> {
        if payload.len() > self.max_message_size {
            return Err(FrameError::Oversized {
                length: payload.len(),
                max: self.max_message_size,
            });
        }

        output.reserve(HEADER_LEN + payload.len());
        output.append(&(payload.len() as u32).to_le_bytes());
        output.append(payload);
        Ok(())
    }
}
