//! Server driver.
//!
//! Ties together the shared broker state (registry, session directory, file
//! tracker) and hands every accepted connection a [`ConnectionPump`]. Both
//! concurrency strategies drive connections exclusively through the pump, so
//! what goes out on the wire does not depend on the strategy.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use stomplite_core::{
    ConnectionId, Connections, FileTracker, FileTrackingLog, FrameSink, ProtocolConfig,
    ProtocolEngine, Registry, SessionDirectory,
};
use stomplite_proto::{Frame, FrameCodec};

/// Whether a runner keeps reading from a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep reading
    Continue,
    /// The engine terminated; stop reading and tear down
    Stop,
}

/// Broker state shared by every connection of one server.
pub struct ServerCore {
    registry: Arc<Registry>,
    sessions: Arc<SessionDirectory>,
    tracker: Arc<dyn FileTracker>,
    protocol: ProtocolConfig,
    /// Next connection ID to hand out
    next_id: AtomicU64,
}

impl std::fmt::Debug for ServerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCore")
            .field("registry", &self.registry)
            .field("sessions", &self.sessions)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

impl ServerCore {
    /// Fresh broker state with an in-memory file-tracking log.
    pub fn new(protocol: ProtocolConfig) -> Self {
        Self::with_collaborators(
            Arc::new(SessionDirectory::new()),
            Arc::new(FileTrackingLog::new()),
            protocol,
        )
    }

    /// Broker state around an existing session directory and file tracker.
    pub fn with_collaborators(
        sessions: Arc<SessionDirectory>,
        tracker: Arc<dyn FileTracker>,
        protocol: ProtocolConfig,
    ) -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            sessions,
            tracker,
            protocol,
            next_id: AtomicU64::new(0),
        }
    }

    /// Accept a connection: allocate its ID, register its sink and build the
    /// engine that will serve it.
    pub fn admit(&self, sink: Arc<dyn FrameSink>) -> ConnectionPump {
        let connection_id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        if !self.registry.register_connection(connection_id, sink) {
            tracing::warn!(%connection_id, "connection id already registered");
        }

        let engine = ProtocolEngine::new(
            connection_id,
            Arc::clone(&self.registry) as Arc<dyn Connections>,
            Arc::clone(&self.sessions),
            Arc::clone(&self.tracker),
            self.protocol.clone(),
        );

        ConnectionPump { codec: FrameCodec::new(), engine }
    }

    /// Shared connection/channel registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Shared session directory.
    pub fn sessions(&self) -> &Arc<SessionDirectory> {
        &self.sessions
    }
}

/// Inbound half of one connection: decoder plus protocol engine.
///
/// Owned by exactly one runner (a thread or a task). Bytes are fed in the
/// order they were read, so frames are processed in arrival order.
#[derive(Debug)]
pub struct ConnectionPump {
    codec: FrameCodec,
    engine: ProtocolEngine,
}

impl ConnectionPump {
    /// Connection this pump serves.
    pub fn connection_id(&self) -> ConnectionId {
        self.engine.connection_id()
    }

    /// Feed freshly read bytes.
    ///
    /// Every complete frame is parsed and processed. Frames that follow a
    /// terminating frame in the same chunk are dropped.
    pub fn deliver(&mut self, bytes: &[u8]) -> Flow {
        for text in self.codec.decode(bytes) {
            if self.engine.should_terminate() {
                break;
            }
            self.engine.process(&Frame::parse(&text));
        }

        if self.engine.should_terminate() { Flow::Stop } else { Flow::Continue }
    }

    /// Tear the connection down after the peer went away or reading failed.
    pub fn close(&mut self) {
        self.engine.close();
    }
}
