//! Stomplite wire protocol.
//!
//! A STOMP-derived text protocol. Every frame on the wire has the shape
//!
//! ```text
//! COMMAND\n
//! header-name:header-value\n
//! ...
//! \n
//! <body>\0
//! ```
//!
//! This crate holds the pieces that know nothing about connections:
//!
//! - [`FrameCodec`]: turns a byte stream into frame texts and back
//! - [`Frame`]: parsed command, ordered headers, body
//! - [`Command`]: the recognized command tokens
//! - [`headers`]: the recognized header names
//! - [`inject_subscription`]: the per-subscriber rewrite used by fan-out

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod frame;
pub mod headers;

pub use codec::{FRAME_TERMINATOR, FrameCodec};
pub use frame::{Command, Frame, inject_subscription};
