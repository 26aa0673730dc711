//! Reactor strategy.
//!
//! A multi-threaded tokio runtime with a fixed number of workers multiplexes
//! every connection. Each connection gets one reader task that waits for
//! readiness, reads, and feeds its [`ConnectionPump`].
//!
//! # Writes
//!
//! [`ReactorSink::send`] writes on the calling task and returns once the whole
//! frame is in the socket or the write failed, exactly like the
//! thread-per-connection sink. A per-connection lock keeps frames from
//! concurrent publishers whole. When the socket is not writable the caller
//! parks in [`tokio::task::block_in_place`] until it is, so a stalled peer
//! stalls its publishers but not the other tasks on the same worker.
//!
//! # Teardown
//!
//! A failed write surfaces as a [`SinkError`], so the registry drops the
//! connection and closes its sink. [`FrameSink::close`] raises the close
//! signal, which stops the reader and releases any writer parked on the
//! socket. The socket itself closes once the last handle is dropped.

#![allow(clippy::disallowed_types, reason = "Writer lock is never held across an await")]

use std::{
    io,
    net::TcpListener as StdTcpListener,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use stomplite_core::{FrameSink, SinkError};
use tokio::{
    net::{TcpListener, TcpStream},
    runtime::Handle,
    sync::watch,
    task::JoinSet,
};

use crate::{
    driver::{ConnectionPump, Flow, ServerCore},
    error::ServerError,
};

/// Size of the per-connection read buffer.
const READ_BUFFER_SIZE: usize = 4096;

/// How long shutdown waits for tasks still running on the runtime.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Outbound half of a reactor connection.
pub(crate) struct ReactorSink {
    stream: Arc<TcpStream>,
    /// Serializes writers; each frame is written whole
    writer: Mutex<()>,
    closed: watch::Sender<bool>,
    runtime: Handle,
}

impl ReactorSink {
    /// Must be called from inside the runtime.
    fn new(stream: Arc<TcpStream>) -> (Self, watch::Receiver<bool>) {
        let (closed, close_signal) = watch::channel(false);
        let sink = Self { stream, writer: Mutex::new(()), closed, runtime: Handle::current() };
        (sink, close_signal)
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        match self.writer.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => tokio::task::block_in_place(|| {
                self.writer.lock().unwrap_or_else(PoisonError::into_inner)
            }),
        }
    }

    /// Park until the socket accepts more bytes or the sink is closed.
    fn wait_writable(&self) -> Result<(), SinkError> {
        let mut close_signal = self.closed.subscribe();
        tokio::task::block_in_place(|| {
            self.runtime.block_on(async {
                tokio::select! {
                    ready = self.stream.writable() => ready.map_err(SinkError::from),
                    _ = close_signal.wait_for(|closed| *closed) => Err(SinkError::Closed),
                }
            })
        })
    }
}

impl FrameSink for ReactorSink {
    fn send(&self, bytes: &[u8]) -> Result<(), SinkError> {
        if *self.closed.borrow() {
            return Err(SinkError::Closed);
        }

        let _writer = self.lock_writer();
        let mut written = 0;
        while written < bytes.len() {
            match self.stream.try_write(&bytes[written..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait_writable()?,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// Build the runtime and accept connections until `shutdown` is raised.
///
/// On return every connection has been closed and the runtime is gone.
pub(crate) fn run(
    listener: StdTcpListener,
    core: &ServerCore,
    worker_threads: usize,
    shutdown: &AtomicBool,
) -> Result<(), ServerError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_name("stomplite-reactor")
        .enable_all()
        .build()
        .map_err(|e| ServerError::Runtime(format!("failed to build runtime: {e}")))?;

    tracing::info!(worker_threads, "reactor runtime started");

    listener.set_nonblocking(true)?;
    let result = runtime.block_on(async {
        let mut connections = JoinSet::new();
        let accepted = accept_loop(listener, core, shutdown, &mut connections).await;

        let closed = core.registry().close_all();
        tracing::info!(closed, "closed open connections");

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(remaining = connections.len(), "connections still open after grace period");
        }

        accepted
    });

    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn accept_loop(
    listener: StdTcpListener,
    core: &ServerCore,
    shutdown: &AtomicBool,
    connections: &mut JoinSet<()>,
) -> Result<(), ServerError> {
    let listener = TcpListener::from_std(listener)?;

    loop {
        let accepted = listener.accept().await;
        if shutdown.load(Ordering::Acquire) {
            return Ok(());
        }

        match accepted {
            Ok((stream, peer)) => {
                let stream = Arc::new(stream);
                let (sink, close_signal) = ReactorSink::new(Arc::clone(&stream));
                let sink = Arc::new(sink);
                let pump = core.admit(Arc::clone(&sink) as Arc<dyn FrameSink>);

                tracing::debug!(connection_id = %pump.connection_id(), %peer, "accepted connection");

                connections.spawn(serve(stream, pump, sink, close_signal));
            },
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }

        while connections.try_join_next().is_some() {}
    }
}

async fn serve(
    stream: Arc<TcpStream>,
    mut pump: ConnectionPump,
    sink: Arc<ReactorSink>,
    close_signal: watch::Receiver<bool>,
) {
    let connection_id = pump.connection_id();

    read_loop(&stream, &mut pump, close_signal).await;

    pump.close();
    sink.close();
    tracing::debug!(%connection_id, "connection finished");
}

async fn read_loop(
    stream: &TcpStream,
    pump: &mut ConnectionPump,
    mut close_signal: watch::Receiver<bool>,
) {
    let connection_id = pump.connection_id();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            ready = stream.readable() => {
                if let Err(e) = ready {
                    tracing::debug!(%connection_id, error = %e, "read failed");
                    return;
                }
                match stream.try_read(&mut buf) {
                    Ok(0) => {
                        tracing::debug!(%connection_id, "peer closed connection");
                        return;
                    },
                    Ok(n) => {
                        if pump.deliver(&buf[..n]) == Flow::Stop {
                            return;
                        }
                    },
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
                    Err(e) => {
                        tracing::debug!(%connection_id, error = %e, "read failed");
                        return;
                    },
                }
            },
            Ok(()) = close_signal.changed() => {
                if *close_signal.borrow() {
                    return;
                }
            },
        }
    }
}
