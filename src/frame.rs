//! Message deframing.
//!
//! Messages are length-prefixed on the wire:
//! - 1 byte: compressed flag (0 = uncompressed, 1 = compressed)
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: message payload
//!
//! DATA frames carry arbitrary slices of this sequence; the deframer
//! reassembles message boundaries across frame boundaries. Emission can be
//! paused while a completion signal is outstanding, so that header delivery
//! and application backpressure gate buffered messages.

use bytes::{Buf, Bytes, BytesMut};
use std::io;

/// Size of the message header (1 byte flag + 4 bytes length).
pub const HEADER_SIZE: usize = 5;

/// Maximum message size (4MB, the conventional gRPC default).
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Incremental message-boundary recovery over a stream of opaque buffers.
#[derive(Debug, Default)]
pub struct MessageDeframer {
    buffer: BytesMut,
    paused: bool,
    end_of_stream: bool,
    closed: bool,
}

impl MessageDeframer {
    /// Create a new deframer.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            paused: false,
            end_of_stream: false,
            closed: false,
        }
    }

    /// Feed an inbound buffer. `end_of_stream` marks the final buffer; an
    /// empty buffer with `end_of_stream` set flushes the pipeline.
    pub fn deframe(&mut self, data: &[u8], end_of_stream: bool) {
        if self.closed {
            return;
        }
        self.buffer.extend_from_slice(data);
        if end_of_stream {
            self.end_of_stream = true;
        }
    }

    /// Suspend message emission until [`resume`](Self::resume).
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Resume message emission.
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Whether emission is currently suspended.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Try to extract the next complete message.
    ///
    /// Returns `Ok(None)` when paused, closed, or when more data is needed.
    /// Returns `Err` when the peer announces a message larger than
    /// [`MAX_MESSAGE_SIZE`].
    pub fn next_message(&mut self) -> io::Result<Option<Bytes>> {
        if self.paused || self.closed || self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;

        if length > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message too large: {} bytes", length),
            ));
        }

        if self.buffer.len() < HEADER_SIZE + length {
            return Ok(None);
        }

        self.buffer.advance(HEADER_SIZE);
        Ok(Some(self.buffer.split_to(length).freeze()))
    }

    /// Whether the peer signalled end-of-stream and every buffered byte has
    /// been consumed.
    pub fn end_of_stream_reached(&self) -> bool {
        self.end_of_stream && self.buffer.is_empty()
    }

    /// Whether the peer signalled end-of-stream with a partial message left
    /// in the buffer.
    pub fn end_of_stream_mid_message(&self) -> bool {
        self.end_of_stream && !self.buffer.is_empty()
    }

    /// Stop emitting and drop buffered data. Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
        self.buffer.clear();
    }

    /// Whether the deframer has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Encode a message into wire format with the length prefix.
pub fn encode_message(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + data.len());
    buf.extend_from_slice(&[0]);
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
    buf.freeze()
}
