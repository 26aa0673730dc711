//! Connection and channel registry.
//!
//! The registry owns two shared tables: connection → outbound sink (for
//! point-to-point sends) and channel → subscribers (for fan-out). Any
//! connection's worker may mutate them, so both sit behind locks.
//!
//! No registry lock is held while a sink writes. A publish on connection A
//! snapshots the subscriber list, releases the lock, then writes to each
//! subscriber's sink. Each sink serializes its own writers, so two publishers
//! targeting the same subscriber never interleave bytes.
//!
//! Disconnecting a connection removes it from every table at once, so a
//! concurrent fan-out either finds the sink (and the write goes out or fails
//! cleanly) or does not find it at all.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory operations only")]

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use stomplite_proto::{FrameCodec, inject_subscription};

use crate::error::SinkError;

/// Process-unique connection identifier, assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outbound half of one connection.
///
/// # Invariants
///
/// - `send` writes the whole buffer or fails; concurrent callers are
///   serialized, never interleaved.
/// - After `close`, every `send` fails.
pub trait FrameSink: Send + Sync {
    /// Write one encoded frame.
    fn send(&self, bytes: &[u8]) -> Result<(), SinkError>;

    /// Release the socket. Idempotent.
    fn close(&self);
}

/// What a protocol engine may do to the shared broker state.
pub trait Connections: Send + Sync {
    /// Send a frame text to one connection. `false` if it is gone or the write
    /// failed.
    fn send(&self, connection_id: ConnectionId, frame: &str) -> bool;

    /// Fan a frame text out to every subscriber of `channel`.
    fn send_to_channel(&self, channel: &str, frame: &str);

    /// Subscribe `connection_id` to `channel` under `subscription_id`.
    fn subscribe(&self, channel: &str, connection_id: ConnectionId, subscription_id: &str);

    /// Drop the subscription of `connection_id` to `channel`, if any.
    fn unsubscribe(&self, channel: &str, connection_id: ConnectionId);

    /// Forget `connection_id` everywhere. Idempotent.
    fn disconnect(&self, connection_id: ConnectionId);
}

/// Channel name → (connection → subscription id)
type ChannelTable = HashMap<String, HashMap<ConnectionId, String>>;

/// Shared registry of connections and channel subscriptions.
#[derive(Default)]
pub struct Registry {
    /// Connection ID → outbound sink
    connections: RwLock<HashMap<ConnectionId, Arc<dyn FrameSink>>>,
    /// Channel → subscribers. Empty channels are pruned
    channels: RwLock<ChannelTable>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("connections", &self.connection_count())
            .field("channels", &self.read_channels().len())
            .finish()
    }
}

impl Registry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the outbound sink of a freshly accepted connection.
    ///
    /// Returns `false` (and keeps the existing sink) if the id is taken.
    pub fn register_connection(&self, connection_id: ConnectionId, sink: Arc<dyn FrameSink>) -> bool {
        let mut connections = self.write_connections();
        if connections.contains_key(&connection_id) {
            return false;
        }
        connections.insert(connection_id, sink);
        true
    }

    /// Encode and write a frame text to one connection.
    ///
    /// A failed write is an implicit disconnect: the connection is removed from
    /// every table and its sink is closed.
    pub fn send_to_connection(&self, connection_id: ConnectionId, frame: &str) -> bool {
        let Some(sink) = self.sink(connection_id) else {
            return false;
        };

        match sink.send(&FrameCodec::encode(frame)) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(%connection_id, error = %e, "write failed, dropping connection");
                self.remove(connection_id);
                sink.close();
                false
            },
        }
    }

    /// Deliver a frame text to every subscriber of `channel`, each copy carrying
    /// that subscriber's `subscription` header.
    ///
    /// Returns how many copies were written.
    pub fn send_to_channel(&self, channel: &str, frame: &str) -> usize {
        let subscribers: Vec<(ConnectionId, String)> = match self.read_channels().get(channel) {
            Some(subscribers) => {
                subscribers.iter().map(|(id, sub)| (*id, sub.clone())).collect()
            },
            None => return 0,
        };

        subscribers
            .into_iter()
            .filter(|(connection_id, subscription_id)| {
                self.send_to_connection(*connection_id, &inject_subscription(frame, subscription_id))
            })
            .count()
    }

    /// Subscribe a connection to a channel. A later call for the same pair
    /// replaces the subscription id.
    pub fn subscribe(&self, channel: &str, connection_id: ConnectionId, subscription_id: &str) {
        self.write_channels()
            .entry(channel.to_owned())
            .or_default()
            .insert(connection_id, subscription_id.to_owned());
    }

    /// Unsubscribe a connection from a channel.
    ///
    /// Returns `true` if the connection was subscribed.
    pub fn unsubscribe(&self, channel: &str, connection_id: ConnectionId) -> bool {
        let mut channels = self.write_channels();

        let Some(subscribers) = channels.get_mut(channel) else {
            return false;
        };
        let removed = subscribers.remove(&connection_id).is_some();
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        removed
    }

    /// Remove a connection from the connection table and every channel.
    ///
    /// Does not close the sink: the connection's runner owns the socket and
    /// closes it once it stops reading. Returns `true` if the connection was
    /// registered.
    pub fn disconnect(&self, connection_id: ConnectionId) -> bool {
        self.remove(connection_id).is_some()
    }

    /// Forced shutdown: drop every connection and close its sink.
    ///
    /// Returns how many connections were closed.
    pub fn close_all(&self) -> usize {
        let drained: Vec<(ConnectionId, Arc<dyn FrameSink>)> =
            self.write_connections().drain().collect();
        self.write_channels().clear();

        for (connection_id, sink) in &drained {
            tracing::debug!(%connection_id, "closing connection for shutdown");
            sink.close();
        }
        drained.len()
    }

    /// Check if a connection is registered.
    pub fn has_connection(&self, connection_id: ConnectionId) -> bool {
        self.read_connections().contains_key(&connection_id)
    }

    /// Total number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.read_connections().len()
    }

    /// Number of subscribers of a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.read_channels().get(channel).map_or(0, HashMap::len)
    }

    /// Subscription id `connection_id` holds on `channel`.
    pub fn subscription_id(&self, channel: &str, connection_id: ConnectionId) -> Option<String> {
        self.read_channels().get(channel).and_then(|subs| subs.get(&connection_id).cloned())
    }

    /// Check if a connection is subscribed to a channel.
    pub fn is_subscribed(&self, channel: &str, connection_id: ConnectionId) -> bool {
        self.subscription_id(channel, connection_id).is_some()
    }

    fn sink(&self, connection_id: ConnectionId) -> Option<Arc<dyn FrameSink>> {
        self.read_connections().get(&connection_id).cloned()
    }

    fn remove(&self, connection_id: ConnectionId) -> Option<Arc<dyn FrameSink>> {
        let sink = self.write_connections().remove(&connection_id);

        let mut channels = self.write_channels();
        channels.retain(|_, subscribers| {
            subscribers.remove(&connection_id);
            !subscribers.is_empty()
        });

        sink
    }

    fn read_connections(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Arc<dyn FrameSink>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_connections(&self) -> RwLockWriteGuard<'_, HashMap<ConnectionId, Arc<dyn FrameSink>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_channels(&self) -> RwLockReadGuard<'_, ChannelTable> {
        self.channels.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_channels(&self) -> RwLockWriteGuard<'_, ChannelTable> {
        self.channels.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connections for Registry {
    fn send(&self, connection_id: ConnectionId, frame: &str) -> bool {
        self.send_to_connection(connection_id, frame)
    }

    fn send_to_channel(&self, channel: &str, frame: &str) {
        let delivered = Self::send_to_channel(self, channel, frame);
        tracing::trace!(channel, delivered, "fan-out complete");
    }

    fn subscribe(&self, channel: &str, connection_id: ConnectionId, subscription_id: &str) {
        Self::subscribe(self, channel, connection_id, subscription_id);
    }

    fn unsubscribe(&self, channel: &str, connection_id: ConnectionId) {
        Self::unsubscribe(self, channel, connection_id);
    }

    fn disconnect(&self, connection_id: ConnectionId) {
        Self::disconnect(self, connection_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use stomplite_proto::{Frame, FrameCodec};

    use super::*;

    /// Sink that records every frame it is handed.
    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<String>>,
        closed: Mutex<bool>,
        fail: bool,
    }

    impl RecordingSink {
        fn failing() -> Self {
            Self { fail: true, ..Self::default() }
        }

        fn frames(&self) -> Vec<Frame> {
            self.frames.lock().unwrap().iter().map(|text| Frame::parse(text)).collect()
        }

        fn is_closed(&self) -> bool {
            *self.closed.lock().unwrap()
        }
    }

    impl FrameSink for RecordingSink {
        fn send(&self, bytes: &[u8]) -> Result<(), SinkError> {
            if self.fail || self.is_closed() {
                return Err(SinkError::Closed);
            }
            let mut codec = FrameCodec::new();
            self.frames.lock().unwrap().extend(codec.decode(bytes));
            Ok(())
        }

        fn close(&self) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn registry_with(sinks: &[(u64, Arc<RecordingSink>)]) -> Registry {
        let registry = Registry::new();
        for (id, sink) in sinks {
            assert!(registry.register_connection(ConnectionId(*id), Arc::clone(sink) as Arc<dyn FrameSink>));
        }
        registry
    }

    #[test]
    fn register_duplicate_connection_fails() {
        let sink = Arc::new(RecordingSink::default());
        let registry = registry_with(&[(1, Arc::clone(&sink))]);

        assert!(!registry.register_connection(ConnectionId(1), sink));
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn send_to_unknown_connection_fails_quietly() {
        let registry = Registry::new();
        assert!(!registry.send_to_connection(ConnectionId(42), "RECEIPT\nreceipt-id:1\n\n"));
    }

    #[test]
    fn send_to_connection_encodes_one_frame() {
        let sink = Arc::new(RecordingSink::default());
        let registry = registry_with(&[(1, Arc::clone(&sink))]);

        assert!(registry.send_to_connection(ConnectionId(1), "CONNECTED\nversion:1.2\n\n"));

        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header("version"), Some("1.2"));
    }

    #[test]
    fn fan_out_injects_subscription_per_subscriber() {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let registry = registry_with(&[(1, Arc::clone(&first)), (2, Arc::clone(&second))]);

        registry.subscribe("/topic/news", ConnectionId(1), "0");
        registry.subscribe("/topic/news", ConnectionId(2), "1");

        let delivered = registry
            .send_to_channel("/topic/news", "MESSAGE\nmessage-id:9-0\ndestination:/topic/news\n\nhello");
        assert_eq!(delivered, 2);

        let mut a = first.frames().remove(0);
        let mut b = second.frames().remove(0);
        assert_eq!(a.header("subscription"), Some("0"));
        assert_eq!(b.header("subscription"), Some("1"));

        // Only the subscription header differs
        a.headers.retain(|(name, _)| name != "subscription");
        b.headers.retain(|(name, _)| name != "subscription");
        assert_eq!(a, b);
        assert_eq!(a.body, "hello");
    }

    #[test]
    fn resubscribe_overwrites_subscription_id() {
        let sink = Arc::new(RecordingSink::default());
        let registry = registry_with(&[(1, Arc::clone(&sink))]);

        registry.subscribe("/q", ConnectionId(1), "a");
        registry.subscribe("/q", ConnectionId(1), "b");

        assert_eq!(registry.subscriber_count("/q"), 1);
        registry.send_to_channel("/q", "MESSAGE\n\nx");
        assert_eq!(sink.frames()[0].header("subscription"), Some("b"));
    }

    #[test]
    fn unsubscribe_stops_delivery_to_that_connection_only() {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let registry = registry_with(&[(1, Arc::clone(&first)), (2, Arc::clone(&second))]);

        registry.subscribe("/q", ConnectionId(1), "0");
        registry.subscribe("/q", ConnectionId(2), "0");

        assert!(registry.unsubscribe("/q", ConnectionId(1)));
        assert!(!registry.unsubscribe("/q", ConnectionId(1)));
        assert!(!registry.unsubscribe("/nowhere", ConnectionId(1)));

        registry.send_to_channel("/q", "MESSAGE\n\nx");
        assert!(first.frames().is_empty());
        assert_eq!(second.frames().len(), 1);
    }

    #[test]
    fn empty_channels_are_pruned() {
        let registry = registry_with(&[(1, Arc::new(RecordingSink::default()))]);

        registry.subscribe("/q", ConnectionId(1), "0");
        registry.unsubscribe("/q", ConnectionId(1));

        assert_eq!(registry.read_channels().len(), 0);
    }

    #[test]
    fn disconnect_removes_from_every_channel() {
        let registry = registry_with(&[
            (1, Arc::new(RecordingSink::default())),
            (2, Arc::new(RecordingSink::default())),
        ]);

        registry.subscribe("/a", ConnectionId(1), "0");
        registry.subscribe("/b", ConnectionId(1), "1");
        registry.subscribe("/a", ConnectionId(2), "0");

        assert!(registry.disconnect(ConnectionId(1)));
        assert!(!registry.disconnect(ConnectionId(1)));

        assert!(!registry.has_connection(ConnectionId(1)));
        assert!(!registry.is_subscribed("/a", ConnectionId(1)));
        assert_eq!(registry.subscriber_count("/a"), 1);
        assert_eq!(registry.subscriber_count("/b"), 0);
    }

    #[test]
    fn failed_write_drops_and_closes_connection() {
        let broken = Arc::new(RecordingSink::failing());
        let healthy = Arc::new(RecordingSink::default());
        let registry = registry_with(&[(1, Arc::clone(&broken)), (2, Arc::clone(&healthy))]);

        registry.subscribe("/q", ConnectionId(1), "0");
        registry.subscribe("/q", ConnectionId(2), "0");

        assert_eq!(registry.send_to_channel("/q", "MESSAGE\n\nx"), 1);
        assert!(broken.is_closed());
        assert!(!registry.has_connection(ConnectionId(1)));
        assert_eq!(registry.subscriber_count("/q"), 1);
    }

    #[test]
    fn close_all_closes_every_sink() {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let registry = registry_with(&[(1, Arc::clone(&first)), (2, Arc::clone(&second))]);
        registry.subscribe("/q", ConnectionId(1), "0");

        assert_eq!(registry.close_all(), 2);
        assert!(first.is_closed());
        assert!(second.is_closed());
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.subscriber_count("/q"), 0);
    }

    #[test]
    fn connection_id_displays_as_number() {
        assert_eq!(ConnectionId(17).to_string(), "17");
    }
}
