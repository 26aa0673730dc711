//! Parsed frame representation.
//!
//! A [`Frame`] is what the protocol engine works with. The codec only deals in
//! frame *texts*; parsing into command, headers and body happens here and never
//! fails. Semantic problems (unknown command, missing header) are left for the
//! engine to answer with an ERROR frame.

use std::fmt;

use crate::headers;

/// Separator between the header block and the body.
const BODY_SEPARATOR: &str = "\n\n";

/// Command token on the first line of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Client authenticates
    Connect,
    /// Server accepts a CONNECT
    Connected,
    /// Client subscribes to a channel
    Subscribe,
    /// Client drops a subscription
    Unsubscribe,
    /// Client publishes to a channel
    Send,
    /// Server delivers a published frame
    Message,
    /// Client ends the session
    Disconnect,
    /// Server acknowledges a `receipt` header
    Receipt,
    /// Server reports a protocol error
    Error,
    /// Anything else
    Unknown,
}

impl Command {
    /// Match a command token exactly (case-sensitive).
    pub fn parse(token: &str) -> Self {
        match token {
            "CONNECT" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "SEND" => Self::Send,
            "MESSAGE" => Self::Message,
            "DISCONNECT" => Self::Disconnect,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => Self::Unknown,
        }
    }

    /// Wire token. `None` for [`Command::Unknown`].
    pub fn as_str(self) -> Option<&'static str> {
        Some(match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Disconnect => "DISCONNECT",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Unknown => return None,
        })
    }
}

/// One protocol message.
///
/// # Invariants
///
/// - Headers keep insertion order, so rendering reproduces the sender's order.
/// - Duplicate header names are kept, but [`Frame::header`] always resolves to
///   the first occurrence.
/// - The body never contains the NUL terminator; the codec owns that byte.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Command token as received (may be unrecognized)
    pub command: String,
    /// Header name/value pairs in wire order
    pub headers: Vec<(String, String)>,
    /// Payload after the blank line (may be empty)
    pub body: String,
}

impl Frame {
    /// Frame with the given command, no headers and an empty body.
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self { command: command.as_str().unwrap_or_default().to_owned(), ..Self::default() }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Parse a frame text (without its NUL terminator).
    ///
    /// Never fails. Leading end-of-line bytes (heart-beats between frames) are
    /// skipped. Header lines split on the first colon only, so values may
    /// contain colons; lines without a colon are ignored.
    pub fn parse(text: &str) -> Self {
        let text = text.trim_start_matches(['\n', '\r']);

        let (head, body) = match text.find(BODY_SEPARATOR) {
            Some(idx) => (&text[..idx], &text[idx + BODY_SEPARATOR.len()..]),
            None => (text, ""),
        };

        let mut lines = head.split('\n');
        let command = lines.next().unwrap_or_default().to_owned();

        let headers = lines
            .take_while(|line| !line.is_empty())
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.to_owned(), value.to_owned()))
            .collect();

        Self { command, headers, body: body.to_owned() }
    }

    /// Recognized command, or [`Command::Unknown`].
    pub fn command(&self) -> Command {
        Command::parse(&self.command)
    }

    /// First value of the named header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    /// Value of the `receipt` header, if the client asked for one.
    pub fn receipt(&self) -> Option<&str> {
        self.header(headers::RECEIPT)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.command)?;
        for (name, value) in &self.headers {
            writeln!(f, "{name}:{value}")?;
        }
        writeln!(f)?;
        f.write_str(&self.body)
    }
}

/// Rewrite a frame text for one subscriber by adding a `subscription` header.
///
/// The header goes right before the header/body separator. A text without a
/// separator (headers only) gets the header plus a separator appended.
pub fn inject_subscription(text: &str, subscription_id: &str) -> String {
    match text.find(BODY_SEPARATOR) {
        Some(idx) => {
            let (head, rest) = text.split_at(idx);
            format!("{head}\n{}:{subscription_id}{rest}", headers::SUBSCRIPTION)
        },
        None => {
            let head = text.strip_suffix('\n').unwrap_or(text);
            format!("{head}\n{}:{subscription_id}{BODY_SEPARATOR}", headers::SUBSCRIPTION)
        },
    }
}
