//! Incremental NUL-delimited frame codec.
//!
//! Bytes arrive in arbitrary chunks. The codec buffers them until it sees the
//! terminator and only then hands out the frame text, so a partially received
//! frame is never visible to the protocol layer.
//!
//! The codec is stateful and belongs to exactly one connection.

use bytes::{BufMut, Bytes, BytesMut};

/// Byte that terminates every frame on the wire.
pub const FRAME_TERMINATOR: u8 = 0x00;

/// Initial buffer capacity. Grows by doubling.
const INITIAL_CAPACITY: usize = 1024;

/// Per-connection frame decoder/encoder.
#[derive(Debug)]
pub struct FrameCodec {
    buf: BytesMut,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec with an empty buffer.
    pub fn new() -> Self {
        Self { buf: BytesMut::with_capacity(INITIAL_CAPACITY) }
    }

    /// Feed one byte.
    ///
    /// Returns the buffered frame text when `byte` is the terminator and resets
    /// the buffer; otherwise buffers the byte and returns `None`. Invalid UTF-8
    /// is replaced, never reported.
    pub fn decode_next_byte(&mut self, byte: u8) -> Option<String> {
        if byte == FRAME_TERMINATOR {
            return Some(self.pop_frame());
        }

        if self.buf.len() == self.buf.capacity() {
            let additional = self.buf.capacity().max(INITIAL_CAPACITY);
            self.buf.reserve(additional);
        }
        self.buf.put_u8(byte);
        None
    }

    /// Feed a chunk and collect every frame it completes, in order.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<String> {
        chunk.iter().filter_map(|&byte| self.decode_next_byte(byte)).collect()
    }

    /// Encode a frame text for the wire by appending the terminator.
    pub fn encode(text: &str) -> Bytes {
        let mut out = BytesMut::with_capacity(text.len() + 1);
        out.put_slice(text.as_bytes());
        out.put_u8(FRAME_TERMINATOR);
        out.freeze()
    }

    /// Number of bytes buffered towards the next frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn pop_frame(&mut self) -> String {
        let bytes = self.buf.split();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
