//! Per-connection protocol state machine.
//!
//! Interprets decoded frames, drives login/logout through the
//! [`SessionDirectory`] and subscriptions/fan-out through the shared
//! [`Connections`] capability, and decides when the connection must end.
//!
//! # State Machine
//!
//! ```text
//! ┌─────────────────┐  CONNECT ok   ┌───────────────┐
//! │ Unauthenticated │──────────────>│ Authenticated │
//! └─────────────────┘               └───────────────┘
//!          │                                │
//!          │ DISCONNECT / ERROR / close()   │ DISCONNECT / ERROR / close()
//!          ↓                                ↓
//!     ┌────────────┐                  ┌────────────┐
//!     │ Terminated │                  │ Terminated │
//!     └────────────┘                  └────────────┘
//! ```
//!
//! Every error is fatal: the engine sends an ERROR frame, logs the user out,
//! removes the connection from the registry and stops accepting frames. The
//! connection runner polls [`ProtocolEngine::should_terminate`] and stops
//! reading.
//!
//! # Receipts
//!
//! A `receipt` header on any command is answered with a RECEIPT after the
//! command has been handled. DISCONNECT sends its RECEIPT before teardown. A
//! command that failed with an ERROR never gets a RECEIPT.

use std::{collections::BTreeMap, sync::Arc};

use stomplite_proto::{Command, Frame, headers};

use crate::{
    error::ProtocolViolation,
    registry::{ConnectionId, Connections},
    sessions::{LoginOutcome, SessionDirectory},
    tracking::FileTracker,
};

/// Protocol version announced on CONNECTED unless configured otherwise.
pub const DEFAULT_PROTOCOL_VERSION: &str = "1.2";

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Initial state - no successful CONNECT yet
    Unauthenticated,
    /// CONNECT succeeded
    Authenticated,
    /// No further frames are processed
    Terminated,
}

/// Protocol configuration shared by every engine of a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolConfig {
    /// Value of the `version` header on CONNECTED
    pub version: String,
    /// Reject commands other than CONNECT/DISCONNECT before authentication
    pub require_authentication: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self { version: DEFAULT_PROTOCOL_VERSION.to_owned(), require_authentication: false }
    }
}

/// Protocol state machine for one connection.
///
/// Owned by exactly one runner; frames are processed one at a time, to
/// completion, in arrival order. The username and the subscription table are
/// private to this engine.
pub struct ProtocolEngine {
    connection_id: ConnectionId,
    connections: Arc<dyn Connections>,
    sessions: Arc<SessionDirectory>,
    tracker: Arc<dyn FileTracker>,
    config: ProtocolConfig,
    state: EngineState,
    /// Username after a successful CONNECT
    username: Option<String>,
    /// Subscription ID → channel, for reversing UNSUBSCRIBE
    subscriptions: BTreeMap<String, String>,
    /// Sequence number of the next MESSAGE this connection publishes
    next_message: u64,
}

impl std::fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("connection_id", &self.connection_id)
            .field("state", &self.state)
            .field("username", &self.username)
            .field("subscriptions", &self.subscriptions)
            .finish_non_exhaustive()
    }
}

impl ProtocolEngine {
    /// Create an engine in [`EngineState::Unauthenticated`].
    pub fn new(
        connection_id: ConnectionId,
        connections: Arc<dyn Connections>,
        sessions: Arc<SessionDirectory>,
        tracker: Arc<dyn FileTracker>,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            connection_id,
            connections,
            sessions,
            tracker,
            config,
            state: EngineState::Unauthenticated,
            username: None,
            subscriptions: BTreeMap::new(),
            next_message: 0,
        }
    }

    /// Connection this engine serves.
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Current state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Whether the runner must stop feeding frames.
    pub fn should_terminate(&self) -> bool {
        self.state == EngineState::Terminated
    }

    /// Authenticated username. `None` before CONNECT and after termination.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Number of live subscriptions held by this connection.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Process one complete frame.
    ///
    /// Frames arriving after termination are ignored.
    pub fn process(&mut self, frame: &Frame) {
        if self.should_terminate() {
            tracing::trace!(connection_id = %self.connection_id, "frame after termination ignored");
            return;
        }

        let command = frame.command();

        if self.config.require_authentication
            && self.state == EngineState::Unauthenticated
            && !matches!(command, Command::Connect | Command::Disconnect)
        {
            self.fail(&ProtocolViolation::NotConnected);
            return;
        }

        let result = match command {
            Command::Connect => self.handle_connect(frame),
            Command::Subscribe => self.handle_subscribe(frame),
            Command::Unsubscribe => self.handle_unsubscribe(frame),
            Command::Send => self.handle_send(frame),
            Command::Disconnect => {
                self.handle_disconnect(frame);
                return;
            },
            Command::Connected
            | Command::Message
            | Command::Receipt
            | Command::Error
            | Command::Unknown => {
                Err(ProtocolViolation::UnknownCommand { command: frame.command.clone() })
            },
        };

        match result {
            Ok(()) => {
                if let Some(receipt) = frame.receipt() {
                    self.send_receipt(receipt);
                }
            },
            Err(violation) => self.fail(&violation),
        }
    }

    /// Transport-driven teardown (peer closed, I/O error, shutdown).
    ///
    /// Logs the user out and removes the connection from the registry. No
    /// frame is sent. Idempotent.
    pub fn close(&mut self) {
        self.terminate();
    }

    fn handle_connect(&mut self, frame: &Frame) -> Result<(), ProtocolViolation> {
        let (Some(login), Some(passcode)) =
            (frame.header(headers::LOGIN), frame.header(headers::PASSCODE))
        else {
            return Err(ProtocolViolation::MalformedFrame {
                description: "Missing login or passcode header",
            });
        };

        let outcome = if self.username.is_some() {
            LoginOutcome::ThisConnectionAlreadyAuthenticated
        } else {
            self.sessions.login(self.connection_id, login, passcode)
        };

        match outcome {
            LoginOutcome::LoggedIn | LoginOutcome::Registered => {
                tracing::debug!(connection_id = %self.connection_id, username = login, ?outcome, "authenticated");

                self.username = Some(login.to_owned());
                self.state = EngineState::Authenticated;

                let connected = Frame::new(Command::Connected)
                    .with_header(headers::VERSION, self.config.version.as_str());
                self.reply(&connected);
                Ok(())
            },
            LoginOutcome::WrongCredential => Err(ProtocolViolation::BadCredentials),
            LoginOutcome::AlreadyLoggedInElsewhere => {
                Err(ProtocolViolation::AlreadyLoggedIn { username: login.to_owned() })
            },
            LoginOutcome::ThisConnectionAlreadyAuthenticated => {
                Err(ProtocolViolation::ClientAlreadyConnected)
            },
        }
    }

    fn handle_subscribe(&mut self, frame: &Frame) -> Result<(), ProtocolViolation> {
        let (Some(destination), Some(id)) =
            (frame.header(headers::DESTINATION), frame.header(headers::ID))
        else {
            return Err(ProtocolViolation::MalformedFrame {
                description: "Missing destination or id",
            });
        };

        // Reusing an id for another channel moves the subscription.
        if let Some(previous) = self.subscriptions.insert(id.to_owned(), destination.to_owned())
            && previous != destination
        {
            self.release_channel(&previous);
        }
        self.connections.subscribe(destination, self.connection_id, id);

        tracing::debug!(connection_id = %self.connection_id, destination, id, "subscribed");
        Ok(())
    }

    fn handle_unsubscribe(&mut self, frame: &Frame) -> Result<(), ProtocolViolation> {
        let Some(id) = frame.header(headers::ID) else {
            return Err(ProtocolViolation::MalformedFrame { description: "Missing id" });
        };

        match self.subscriptions.remove(id) {
            Some(channel) => {
                self.release_channel(&channel);
                tracing::debug!(connection_id = %self.connection_id, channel, id, "unsubscribed");
            },
            None => {
                tracing::debug!(connection_id = %self.connection_id, id, "unsubscribe for unknown id ignored");
            },
        }
        Ok(())
    }

    /// Drop the registry entry for `channel` unless another local id still
    /// maps to it, in which case that id takes the entry over.
    fn release_channel(&self, channel: &str) {
        match self.subscriptions.iter().find(|(_, mapped)| mapped.as_str() == channel) {
            Some((id, _)) => self.connections.subscribe(channel, self.connection_id, id),
            None => self.connections.unsubscribe(channel, self.connection_id),
        }
    }

    fn handle_send(&mut self, frame: &Frame) -> Result<(), ProtocolViolation> {
        let Some(destination) = frame.header(headers::DESTINATION) else {
            return Err(ProtocolViolation::MalformedFrame {
                description: "Missing destination header",
            });
        };

        if let (Some(file_name), Some(username)) =
            (frame.header(headers::FILE_NAME), self.username.as_deref())
        {
            self.tracker.track_file(username, file_name, destination);
        }

        let message_id = format!("{}-{}", self.connection_id, self.next_message);
        self.next_message += 1;

        let message = Frame::new(Command::Message)
            .with_header(headers::MESSAGE_ID, message_id)
            .with_header(headers::DESTINATION, destination)
            .with_body(frame.body.as_str());

        self.connections.send_to_channel(destination, &message.to_string());
        Ok(())
    }

    fn handle_disconnect(&mut self, frame: &Frame) {
        if let Some(receipt) = frame.receipt() {
            self.send_receipt(receipt);
        }

        tracing::debug!(connection_id = %self.connection_id, "client disconnected");
        self.terminate();
    }

    fn send_receipt(&self, receipt: &str) {
        let frame = Frame::new(Command::Receipt).with_header(headers::RECEIPT_ID, receipt);
        self.reply(&frame);
    }

    fn fail(&mut self, violation: &ProtocolViolation) {
        tracing::debug!(connection_id = %self.connection_id, error = %violation, "protocol violation");

        self.reply(&violation.to_frame());
        self.terminate();
    }

    fn reply(&self, frame: &Frame) {
        // A failed write already tore the connection down in the registry;
        // the runner notices the dead socket.
        let _ = self.connections.send(self.connection_id, &frame.to_string());
    }

    fn terminate(&mut self) {
        if self.state == EngineState::Terminated {
            return;
        }
        self.state = EngineState::Terminated;

        if let Some(username) = self.username.take() {
            self.sessions.logout(&username);
        }
        self.subscriptions.clear();
        self.connections.disconnect(self.connection_id);
    }
}
