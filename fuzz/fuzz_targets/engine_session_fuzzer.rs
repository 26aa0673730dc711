//! Fuzz target for protocol engines sharing one broker
//!
//! # Strategy
//!
//! - Three connections interleaving arbitrary commands
//! - Small pools of usernames, passcodes, channels and subscription ids so
//!   collisions (duplicate login, reused ids, shared channels) are common
//! - Random transport drops in between
//!
//! # Invariants
//!
//! - A username is logged in from at most one connection
//! - Nothing is written to a connection after its ERROR frame
//! - A terminated connection is gone from the registry and holds no login

#![no_main]

use std::sync::{Arc, Mutex};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use stomplite_core::{
    ConnectionId, Connections, FileTracker, FileTrackingLog, FrameSink, ProtocolConfig,
    ProtocolEngine, Registry, SessionDirectory, SinkError,
};
use stomplite_proto::{Frame, FrameCodec};

const USERS: [&str; 2] = ["alice", "bob"];
const PASSCODES: [&str; 2] = ["x", "y"];
const CHANNELS: [&str; 2] = ["/a", "/b"];
const IDS: [&str; 2] = ["1", "2"];

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Connect { user: u8, passcode: u8, receipt: bool },
    Subscribe { channel: u8, id: u8, receipt: bool },
    Unsubscribe { id: u8 },
    Send { channel: u8, body: String },
    Disconnect { receipt: bool },
    Raw { text: String },
    Drop,
}

#[derive(Debug, Arbitrary)]
struct Session {
    require_authentication: bool,
    steps: Vec<(u8, Op)>,
}

#[derive(Default)]
struct CapturingSink {
    frames: Mutex<Vec<String>>,
}

impl FrameSink for CapturingSink {
    fn send(&self, bytes: &[u8]) -> Result<(), SinkError> {
        let decoded = FrameCodec::new().decode(bytes);
        self.frames.lock().unwrap().extend(decoded);
        Ok(())
    }

    fn close(&self) {}
}

fn pick<'a>(pool: &[&'a str], index: u8) -> &'a str {
    pool[usize::from(index) % pool.len()]
}

fn render(op: &Op) -> Option<String> {
    let receipt = |wanted: bool| if wanted { "receipt:r\n" } else { "" };
    Some(match op {
        Op::Connect { user, passcode, receipt: r } => format!(
            "CONNECT\nlogin:{}\npasscode:{}\n{}\n",
            pick(&USERS, *user),
            pick(&PASSCODES, *passcode),
            receipt(*r)
        ),
        Op::Subscribe { channel, id, receipt: r } => format!(
            "SUBSCRIBE\ndestination:{}\nid:{}\n{}\n",
            pick(&CHANNELS, *channel),
            pick(&IDS, *id),
            receipt(*r)
        ),
        Op::Unsubscribe { id } => format!("UNSUBSCRIBE\nid:{}\n\n", pick(&IDS, *id)),
        Op::Send { channel, body } => {
            format!("SEND\ndestination:{}\n\n{}", pick(&CHANNELS, *channel), body.replace('\0', ""))
        },
        Op::Disconnect { receipt: r } => format!("DISCONNECT\n{}\n", receipt(*r)),
        Op::Raw { text } => text.replace('\0', ""),
        Op::Drop => return None,
    })
}

fuzz_target!(|session: Session| {
    let registry = Arc::new(Registry::new());
    let sessions = Arc::new(SessionDirectory::new());
    let files = Arc::new(FileTrackingLog::new());
    let config = ProtocolConfig {
        require_authentication: session.require_authentication,
        ..ProtocolConfig::default()
    };

    let mut connections: Vec<(ProtocolEngine, Arc<CapturingSink>)> = (0..3u64)
        .map(|id| {
            let sink = Arc::new(CapturingSink::default());
            registry.register_connection(ConnectionId(id), Arc::clone(&sink) as Arc<dyn FrameSink>);
            let engine = ProtocolEngine::new(
                ConnectionId(id),
                Arc::clone(&registry) as Arc<dyn Connections>,
                Arc::clone(&sessions),
                Arc::clone(&files) as Arc<dyn FileTracker>,
                config.clone(),
            );
            (engine, sink)
        })
        .collect();

    for (target, op) in session.steps.iter().take(256) {
        let (engine, _) = &mut connections[usize::from(*target) % 3];
        match render(op) {
            Some(text) => engine.process(&Frame::parse(&text)),
            None => engine.close(),
        }

        for user in USERS {
            let holders = connections.iter().filter(|(e, _)| e.username() == Some(user)).count();
            assert!(holders <= 1, "{user} logged in twice");
            assert_eq!(holders == 1, sessions.is_logged_in(user));
        }
    }

    for (engine, sink) in &connections {
        let frames = sink.frames.lock().unwrap();
        if let Some(position) = frames.iter().position(|f| f.starts_with("ERROR\n")) {
            assert_eq!(position, frames.len() - 1, "frames written after ERROR");
            assert!(engine.should_terminate());
        }

        if engine.should_terminate() {
            assert!(engine.username().is_none());
            assert_eq!(engine.subscription_count(), 0);
            assert!(!registry.has_connection(engine.connection_id()));
        }
    }
});
