//! Echo protocol implementation.
//!
//! Every request payload is sent back unchanged, framed the same way.
//!
//! ## Protocol Format
//!
//! Length-prefixed binary protocol:
//!
//! ```text
//! message := length (4 bytes, unsigned, little-endian) payload (length bytes)
//!
//! Example:
//! Request:  05 00 00 00 'h' 'e' 'l' 'l' 'o'
//! Response: 05 00 00 00 'h' 'e' 'l' 'l' 'o'
//! ```
//!
//! A declared length above the configured limit closes the connection
//! without a response. Clients may pipeline: several frames can be sent
//! before reading any response, and responses come back in request order.

pub mod handler;
pub mod parser;

pub use handler::{Echo, Service};
pub use parser::{FrameCodec, FrameError};
