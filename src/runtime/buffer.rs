//! Per-connection byte staging.
//!
//! A `Buffer` grows at the tail and drains from the head. Connections keep
//! one for bytes received but not yet framed and one for encoded responses
//! not yet sent.
//!
//! Backed by `BytesMut`: consuming from the head only moves a cursor, and
//! the space in front is reclaimed when a later append needs to grow.

use bytes::{Buf, BytesMut};
use std::io::{self, Read};

/// Growable byte sequence with append-at-tail, consume-from-head.
#[derive(Debug, Default)]
pub struct Buffer {
    data: BytesMut,
}

impl Buffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
        }
    }

    /// Add bytes to the tail.
    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Remove `n` bytes from the head.
    ///
    /// Consuming more than is stored empties the buffer.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.data.len(), "consume past end of buffer");
        let n = n.min(self.data.len());
        self.data.advance(n);
    }

    /// Make room for at least `additional` more bytes.
    pub fn reserve(&mut self, additional: usize) {
        self.data.reserve(additional);
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// View of the unconsumed bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// One read of at most `max` bytes from `reader` into the tail.
    ///
    /// Returns what the reader returned; on error or a short read the
    /// buffer only grows by the bytes actually received.
    pub fn read_from<R: Read>(&mut self, reader: &mut R, max: usize) -> io::Result<usize> {
        let start = self.data.len();
        self.data.resize(start + max, 0);

        let result = reader.read(&mut self.data[start..]);
        let n = *result.as_ref().unwrap_or(&0);
        self.data.truncate(start + n);
        result
    }
}
