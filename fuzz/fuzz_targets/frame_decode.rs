//! Fuzz target for the NUL-delimited frame codec and the frame parser
//!
//! # Strategy
//!
//! - Arbitrary bytes, including invalid UTF-8 and stray terminators
//! - The same bytes fed whole, byte-at-a-time and in arbitrary chunk sizes
//!
//! # Invariants
//!
//! - Chunking never changes which frame texts come out
//! - One frame per terminator; trailing bytes stay buffered
//! - Parsing any frame text never panics
//! - Rendering a parsed frame and parsing it again keeps command and headers

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use stomplite_proto::{FRAME_TERMINATOR, Frame, FrameCodec};

#[derive(Debug, Arbitrary)]
struct Input {
    bytes: Vec<u8>,
    chunk: u8,
}

fuzz_target!(|input: Input| {
    let whole = FrameCodec::new().decode(&input.bytes);

    let chunk = usize::from(input.chunk).max(1);
    let mut codec = FrameCodec::new();
    let mut chunked = Vec::new();
    for piece in input.bytes.chunks(chunk) {
        chunked.extend(codec.decode(piece));
    }
    assert_eq!(whole, chunked);

    let terminators = input.bytes.iter().filter(|&&b| b == FRAME_TERMINATOR).count();
    assert_eq!(whole.len(), terminators);

    let trailing = input.bytes.iter().rev().take_while(|&&b| b != FRAME_TERMINATOR).count();
    assert_eq!(codec.buffered(), trailing);

    for text in &whole {
        let frame = Frame::parse(text);
        let reparsed = Frame::parse(&frame.to_string());
        assert_eq!(frame.command, reparsed.command);
        assert_eq!(frame.headers, reparsed.headers);
    }
});
