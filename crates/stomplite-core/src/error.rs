//! Error types for the stomplite core.
//!
//! Two layers with different handling: protocol violations are answered with
//! an ERROR frame before the connection is torn down, transport failures tear
//! the connection down without a reply.

use std::io;

use stomplite_proto::{Command, Frame, headers};
use thiserror::Error;

/// Failure to hand bytes to a connection's socket.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink was closed (peer gone or teardown already started)
    #[error("connection closed")]
    Closed,

    /// Underlying write failed
    #[error("write failed: {0}")]
    Io(String),
}

impl From<io::Error> for SinkError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// A frame the engine refuses to process.
///
/// Every variant is fatal for the connection: the client receives an ERROR
/// frame and the connection is terminated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolViolation {
    /// A header the command requires is absent
    #[error("malformed frame: {description}")]
    MalformedFrame {
        /// Which header(s) were missing
        description: &'static str,
    },

    /// Known user, wrong credential
    #[error("bad credentials")]
    BadCredentials,

    /// The user is logged in on another connection
    #[error("user {username} already logged in")]
    AlreadyLoggedIn {
        /// User that tried to log in
        username: String,
    },

    /// This connection already completed CONNECT
    #[error("client already connected")]
    ClientAlreadyConnected,

    /// Command token not accepted from clients
    #[error("unknown command {command:?}")]
    UnknownCommand {
        /// Token as received
        command: String,
    },

    /// A command other than CONNECT arrived before authentication
    #[error("not connected")]
    NotConnected,
}

impl ProtocolViolation {
    /// Value of the ERROR frame's `message` header.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::MalformedFrame { .. } => "Malformed Frame",
            Self::BadCredentials => "Bad Credentials",
            Self::AlreadyLoggedIn { .. } => "User already logged in",
            Self::ClientAlreadyConnected => "Client already connected",
            Self::UnknownCommand { .. } => "Unknown Command",
            Self::NotConnected => "Not Connected",
        }
    }

    /// Human-readable ERROR body.
    pub fn description(&self) -> String {
        match self {
            Self::MalformedFrame { description } => (*description).to_owned(),
            Self::BadCredentials => "Password does not match".to_owned(),
            Self::AlreadyLoggedIn { username } => format!("User {username} is already active"),
            Self::ClientAlreadyConnected => {
                "You are already logged in on this connection".to_owned()
            },
            Self::UnknownCommand { .. } => "Command not supported".to_owned(),
            Self::NotConnected => "CONNECT must be the first frame".to_owned(),
        }
    }

    /// ERROR frame sent to the client before teardown.
    pub fn to_frame(&self) -> Frame {
        Frame::new(Command::Error)
            .with_header(headers::MESSAGE, self.summary())
            .with_body(format!("{}\n", self.description()))
    }
}
