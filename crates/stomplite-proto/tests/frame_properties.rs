//! Property-based tests for frame encoding/decoding
//!
//! These tests verify that the codec and parser agree for ALL well-formed
//! frames, not just specific examples, and that chunk boundaries never change
//! what the decoder produces.

use stomplite_proto::{Command, Frame, FrameCodec};
use proptest::prelude::*;

/// Strategy for generating arbitrary command tokens
fn arbitrary_command() -> impl Strategy<Value = String> {
    prop_oneof![
        Just(Command::Connect),
        Just(Command::Connected),
        Just(Command::Subscribe),
        Just(Command::Unsubscribe),
        Just(Command::Send),
        Just(Command::Message),
        Just(Command::Disconnect),
        Just(Command::Receipt),
        Just(Command::Error),
    ]
    .prop_map(|command| command.as_str().unwrap_or_default().to_owned())
}

/// Strategy for generating arbitrary frames without an embedded NUL
fn arbitrary_frame() -> impl Strategy<Value = Frame> {
    (
        arbitrary_command(),
        prop::collection::vec(("[a-z][a-z-]{0,15}", "[ -~]{0,40}"), 0..8),
        "[^\u{0}]{0,256}",
    )
        .prop_map(|(command, headers, body)| Frame { command, headers, body })
}

/// Encode a frame the way the server does
fn encode(frame: &Frame) -> Vec<u8> {
    FrameCodec::encode(&frame.to_string()).to_vec()
}

#[test]
fn prop_frame_encode_decode_roundtrip() {
    proptest!(|(frame in arbitrary_frame())| {
        let wire = encode(&frame);

        let mut codec = FrameCodec::new();
        let texts = codec.decode(&wire);

        // PROPERTY: exactly one frame, identical after parsing
        prop_assert_eq!(texts.len(), 1);
        let decoded = Frame::parse(&texts[0]);
        prop_assert_eq!(decoded, frame);
        prop_assert_eq!(codec.buffered(), 0);
    });
}

#[test]
fn prop_byte_at_a_time_yields_one_frame_on_terminator() {
    proptest!(|(frame in arbitrary_frame())| {
        let wire = encode(&frame);
        let mut codec = FrameCodec::new();

        let (last, prefix) = wire.split_last().expect("encoded frame is never empty");
        for &byte in prefix {
            prop_assert!(codec.decode_next_byte(byte).is_none());
        }

        let text = codec.decode_next_byte(*last);
        prop_assert_eq!(text.map(|t| Frame::parse(&t)), Some(frame));
    });
}

#[test]
fn prop_chunk_boundaries_do_not_matter() {
    proptest!(|(
        frames in prop::collection::vec(arbitrary_frame(), 1..5),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    )| {
        let wire: Vec<u8> = frames.iter().flat_map(encode).collect();

        let mut offsets: Vec<usize> = cuts.iter().map(|cut| cut.index(wire.len())).collect();
        offsets.push(0);
        offsets.push(wire.len());
        offsets.sort_unstable();
        offsets.dedup();

        let mut codec = FrameCodec::new();
        let mut decoded = Vec::new();
        for window in offsets.windows(2) {
            decoded.extend(codec.decode(&wire[window[0]..window[1]]).iter().map(|t| Frame::parse(t)));
        }

        prop_assert_eq!(decoded, frames);
    });
}

#[test]
fn end_to_end_scenario_frames_parse() {
    let mut codec = FrameCodec::new();
    let texts = codec.decode(
        b"CONNECT\nlogin:alice\npasscode:x\n\n\0SUBSCRIBE\ndestination:/topic/news\nid:7\n\n\0",
    );

    let frames: Vec<Frame> = texts.iter().map(|t| Frame::parse(t)).collect();
    assert_eq!(frames[0].command(), Command::Connect);
    assert_eq!(frames[0].header("login"), Some("alice"));
    assert_eq!(frames[1].command(), Command::Subscribe);
    assert_eq!(frames[1].header("destination"), Some("/topic/news"));
    assert_eq!(frames[1].header("id"), Some("7"));
}
