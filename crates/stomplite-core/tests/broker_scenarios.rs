//! Multi-connection scenarios driven through the public API, without sockets.

use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use stomplite_core::{
    ConnectionId, Connections, FileTracker, FileTrackingLog, FrameSink, ProtocolConfig,
    ProtocolEngine, Registry, SessionDirectory, SinkError,
};
use stomplite_proto::{Frame, FrameCodec};

/// Sink that decodes everything written to it back into frame texts.
#[derive(Default)]
struct CapturingSink {
    codec: Mutex<FrameCodec>,
    frames: Mutex<Vec<String>>,
}

impl CapturingSink {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.frames.lock().unwrap())
    }
}

impl FrameSink for CapturingSink {
    fn send(&self, bytes: &[u8]) -> Result<(), SinkError> {
        let decoded = self.codec.lock().unwrap().decode(bytes);
        self.frames.lock().unwrap().extend(decoded);
        Ok(())
    }

    fn close(&self) {}
}

struct Harness {
    registry: Arc<Registry>,
    sessions: Arc<SessionDirectory>,
    files: Arc<FileTrackingLog>,
}

impl Harness {
    fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            sessions: Arc::new(SessionDirectory::new()),
            files: Arc::new(FileTrackingLog::new()),
        }
    }

    fn accept(&self, id: u64) -> Client {
        let sink = Arc::new(CapturingSink::default());
        assert!(
            self.registry
                .register_connection(ConnectionId(id), Arc::clone(&sink) as Arc<dyn FrameSink>)
        );
        let engine = ProtocolEngine::new(
            ConnectionId(id),
            Arc::clone(&self.registry) as Arc<dyn Connections>,
            Arc::clone(&self.sessions),
            Arc::clone(&self.files) as Arc<dyn FileTracker>,
            ProtocolConfig::default(),
        );
        Client { engine, sink, codec: FrameCodec::new() }
    }
}

struct Client {
    engine: ProtocolEngine,
    sink: Arc<CapturingSink>,
    codec: FrameCodec,
}

impl Client {
    /// Push raw wire bytes through a codec and the engine, like a runner does.
    fn receive(&mut self, bytes: &[u8]) {
        for text in self.codec.decode(bytes) {
            if self.engine.should_terminate() {
                break;
            }
            self.engine.process(&Frame::parse(&text));
        }
    }
}

#[test]
fn end_to_end_pub_sub_scenario() {
    let harness = Harness::new();
    let mut alice = harness.accept(0);
    let mut bob = harness.accept(1);

    alice.receive(b"CONNECT\nlogin:alice\npasscode:x\n\n\0");
    assert_eq!(alice.sink.take(), vec!["CONNECTED\nversion:1.2\n\n"]);

    alice.receive(b"SUBSCRIBE\ndestination:/topic/news\nid:7\nreceipt:1\n\n\0");
    assert_eq!(alice.sink.take(), vec!["RECEIPT\nreceipt-id:1\n\n"]);

    bob.receive(b"CONNECT\nlogin:bob\npasscode:y\n\n\0SEND\ndestination:/topic/news\n\nhello\0");
    assert_eq!(bob.sink.take(), vec!["CONNECTED\nversion:1.2\n\n"]);
    assert_eq!(alice.sink.take(), vec![
        "MESSAGE\nmessage-id:1-0\ndestination:/topic/news\nsubscription:7\n\nhello"
    ]);

    alice.receive(b"DISCONNECT\nreceipt:99\n\n\0");
    assert_eq!(alice.sink.take(), vec!["RECEIPT\nreceipt-id:99\n\n"]);
    assert!(alice.engine.should_terminate());

    bob.receive(b"SEND\ndestination:/topic/news\n\nanyone?\0");
    assert!(alice.sink.take().is_empty());
    assert_eq!(harness.registry.subscriber_count("/topic/news"), 0);
}

#[test]
fn each_subscriber_gets_its_own_subscription_id() {
    let harness = Harness::new();
    let mut publisher = harness.accept(10);
    let mut subscribers: Vec<Client> = (0..4).map(|i| harness.accept(i)).collect();

    for (i, client) in subscribers.iter_mut().enumerate() {
        client.receive(format!("SUBSCRIBE\ndestination:/fan\nid:sub-{i}\n\n\0").as_bytes());
    }
    publisher.receive(b"SEND\ndestination:/fan\n\npayload\0");

    for (i, client) in subscribers.iter().enumerate() {
        let frames = client.sink.take();
        assert_eq!(frames.len(), 1);

        let message = Frame::parse(&frames[0]);
        assert_eq!(message.header("subscription"), Some(format!("sub-{i}").as_str()));
        assert_eq!(message.header("message-id"), Some("10-0"));
        assert_eq!(message.body, "payload");
    }
    assert!(publisher.sink.take().is_empty(), "publisher is not subscribed");
}

#[test]
fn login_is_exclusive_until_logout() {
    let harness = Harness::new();
    let mut first = harness.accept(0);
    let mut second = harness.accept(1);
    let mut third = harness.accept(2);

    first.receive(b"CONNECT\nlogin:alice\npasscode:x\n\n\0");
    second.receive(b"CONNECT\nlogin:alice\npasscode:x\n\n\0");

    let rejected = second.sink.take();
    assert_eq!(rejected.len(), 1);
    assert_eq!(Frame::parse(&rejected[0]).header("message"), Some("User already logged in"));
    assert!(second.engine.should_terminate());

    first.engine.close();
    third.receive(b"CONNECT\nlogin:alice\npasscode:x\n\n\0");
    assert_eq!(third.sink.take(), vec!["CONNECTED\nversion:1.2\n\n"]);
    assert_eq!(harness.sessions.active_connection("alice"), Some(ConnectionId(2)));
    assert_eq!(harness.sessions.login_history("alice").len(), 2);
}

#[test]
fn frames_after_error_in_same_chunk_are_dropped() {
    let harness = Harness::new();
    let mut client = harness.accept(0);

    client.receive(b"BOGUS\n\n\0CONNECT\nlogin:alice\npasscode:x\n\n\0");

    let frames = client.sink.take();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].starts_with("ERROR\n"));
    assert!(!harness.sessions.is_logged_in("alice"));
    assert!(!harness.registry.has_connection(ConnectionId(0)));
}

#[test]
fn file_reports_are_tracked_per_user() {
    let harness = Harness::new();
    let mut client = harness.accept(0);

    client.receive(b"CONNECT\nlogin:alice\npasscode:x\n\n\0");
    client.receive(b"SEND\ndestination:/germany_spain\nfile-name:events.json\n\n{}\0");
    client.receive(b"SEND\ndestination:/germany_spain\n\nno file\0");

    let files = harness.files.files_for_user("alice");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file_name, "events.json");
    assert_eq!(files[0].destination, "/germany_spain");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: however the wire bytes are chunked, every subscriber sees the
    /// same frames in publish order.
    #[test]
    fn prop_fan_out_order_independent_of_chunking(
        bodies in prop::collection::vec("[a-z ]{0,16}", 1..8),
        chunk in 1usize..32,
    ) {
        let harness = Harness::new();
        let mut subscriber = harness.accept(0);
        let mut publisher = harness.accept(1);

        subscriber.receive(b"SUBSCRIBE\ndestination:/p\nid:s\n\n\0");

        let mut wire = Vec::new();
        for body in &bodies {
            wire.extend_from_slice(format!("SEND\ndestination:/p\n\n{body}\0").as_bytes());
        }
        for piece in wire.chunks(chunk) {
            publisher.receive(piece);
        }

        let received: Vec<String> =
            subscriber.sink.take().iter().map(|text| Frame::parse(text).body).collect();
        prop_assert_eq!(received, bodies);
    }
}
