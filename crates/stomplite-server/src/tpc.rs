//! Thread-per-connection strategy.
//!
//! A blocking accept loop hands each connection to its own named OS thread,
//! which reads, decodes and processes frames until the engine terminates or
//! the peer goes away. Writes happen synchronously on whichever thread
//! produced the frame, serialized by the target connection's [`TcpSink`].

#![allow(clippy::disallowed_types, reason = "Blocking I/O on dedicated threads")]

use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpListener, TcpStream},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

use stomplite_core::{FrameSink, SinkError};

use crate::{
    driver::{ConnectionPump, Flow, ServerCore},
    error::ServerError,
};

/// Size of the per-connection read buffer.
const READ_BUFFER_SIZE: usize = 4096;

/// Outbound half of a blocking TCP connection.
pub(crate) struct TcpSink {
    /// Serializes writers; each frame is written and flushed whole
    writer: Mutex<TcpStream>,
    /// Handle used to shut the socket down without waiting for the writer
    control: TcpStream,
    closed: AtomicBool,
}

impl TcpSink {
    pub(crate) fn new(stream: &TcpStream) -> io::Result<Self> {
        Ok(Self {
            writer: Mutex::new(stream.try_clone()?),
            control: stream.try_clone()?,
            closed: AtomicBool::new(false),
        })
    }
}

impl FrameSink for TcpSink {
    fn send(&self, bytes: &[u8]) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Wakes the reader blocked on this socket.
            let _ = self.control.shutdown(Shutdown::Both);
        }
    }
}

/// Accept connections until `shutdown` is raised, one thread per connection.
///
/// On return every connection has been closed and every worker joined.
pub(crate) fn run(
    listener: TcpListener,
    core: &ServerCore,
    shutdown: &AtomicBool,
) -> Result<(), ServerError> {
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    for stream in listener.incoming() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }

        match stream {
            Ok(stream) => match spawn_connection(core, stream) {
                Ok(worker) => workers.push(worker),
                Err(e) => tracing::warn!(error = %e, "failed to start connection thread"),
            },
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }

        workers.retain(|worker| !worker.is_finished());
    }

    let closed = core.registry().close_all();
    tracing::info!(closed, "closed open connections");

    for worker in workers {
        if worker.join().is_err() {
            tracing::warn!("connection thread panicked");
        }
    }
    Ok(())
}

fn spawn_connection(core: &ServerCore, stream: TcpStream) -> io::Result<JoinHandle<()>> {
    let sink = Arc::new(TcpSink::new(&stream)?);
    let pump = core.admit(Arc::clone(&sink) as Arc<dyn FrameSink>);
    let connection_id = pump.connection_id();

    tracing::debug!(%connection_id, peer = ?stream.peer_addr().ok(), "accepted connection");

    let worker_sink = Arc::clone(&sink);
    let spawned = std::thread::Builder::new()
        .name(format!("stomplite-conn-{connection_id}"))
        .spawn(move || serve(stream, pump, &worker_sink));

    if spawned.is_err() {
        // The pump never ran, so nobody else will deregister it.
        core.registry().disconnect(connection_id);
        sink.close();
    }
    spawned
}

fn serve(mut stream: TcpStream, mut pump: ConnectionPump, sink: &TcpSink) {
    let connection_id = pump.connection_id();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                tracing::debug!(%connection_id, "peer closed connection");
                break;
            },
            Ok(n) => {
                if pump.deliver(&buf[..n]) == Flow::Stop {
                    break;
                }
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
            Err(e) => {
                tracing::debug!(%connection_id, error = %e, "read failed");
                break;
            },
        }
    }

    pump.close();
    sink.close();
    tracing::debug!(%connection_id, "connection finished");
}
