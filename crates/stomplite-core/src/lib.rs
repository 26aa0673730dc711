//! Stomplite broker core.
//!
//! Everything the broker does that is independent of how bytes move:
//!
//! - [`ProtocolEngine`]: per-connection state machine over parsed frames
//! - [`SessionDirectory`]: registered users and the logged-in set
//! - [`Registry`]: connection sinks and channel subscriptions, fan-out
//! - [`FileTracker`]: notification hook for SENDs carrying a `file-name`
//!
//! Runners (thread-per-connection or reactor) own the sockets. They register a
//! [`FrameSink`] per connection, decode inbound bytes with
//! [`stomplite_proto::FrameCodec`] and feed each frame to the connection's
//! engine until [`ProtocolEngine::should_terminate`] reports `true`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod engine;
mod error;
mod registry;
mod sessions;
mod tracking;

pub use clock::{Clock, SystemClock};
pub use engine::{DEFAULT_PROTOCOL_VERSION, EngineState, ProtocolConfig, ProtocolEngine};
pub use error::{ProtocolViolation, SinkError};
pub use registry::{ConnectionId, Connections, FrameSink, Registry};
pub use sessions::{LoginOutcome, LoginRecord, SessionDirectory};
pub use tracking::{FileRecord, FileTracker, FileTrackingLog};
