//! Stomplite broker server.
//!
//! Production glue around [`stomplite_core`]: binds a TCP listener and runs
//! connections with one of two interchangeable concurrency strategies.
//!
//! # Architecture
//!
//! The [`ServerCore`] owns the broker state and turns every accepted socket
//! into a [`ConnectionPump`] (codec + protocol engine). The strategy only
//! decides who reads the socket and how the outbound sink writes:
//!
//! - [`ConcurrencyMode::Tpc`]: one OS thread per connection, blocking I/O,
//!   writes performed synchronously under the target connection's lock
//! - [`ConcurrencyMode::Reactor`]: a fixed pool of tokio workers, one reader
//!   task per connection, writes performed synchronously under the same
//!   per-connection lock
//!
//! Given the same input, both strategies put the same bytes on the wire.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod error;
mod reactor;
mod tpc;

use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream},
    num::NonZeroUsize,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::JoinHandle,
};

pub use driver::{ConnectionPump, Flow, ServerCore};
pub use error::ServerError;
pub use stomplite_core::ProtocolConfig;

/// How connections are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ConcurrencyMode {
    /// One OS thread per connection
    Tpc,
    /// Fixed worker pool multiplexing every connection
    Reactor,
}

impl fmt::Display for ConcurrencyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tpc => f.write_str("tpc"),
            Self::Reactor => f.write_str("reactor"),
        }
    }
}

impl FromStr for ConcurrencyMode {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tpc" => Ok(Self::Tpc),
            "reactor" => Ok(Self::Reactor),
            other => Err(ServerError::Config(format!(
                "unknown server mode '{other}' (expected 'tpc' or 'reactor')"
            ))),
        }
    }
}

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:7777")
    pub bind_address: String,
    /// Concurrency strategy
    pub mode: ConcurrencyMode,
    /// Reactor worker threads. Defaults to the available parallelism
    pub reactor_threads: Option<usize>,
    /// Protocol settings handed to every connection
    pub protocol: ProtocolConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:7777".to_string(),
            mode: ConcurrencyMode::Tpc,
            reactor_threads: None,
            protocol: ProtocolConfig::default(),
        }
    }
}

/// Production stomplite server.
pub struct Server {
    listener: TcpListener,
    core: Arc<ServerCore>,
    mode: ConcurrencyMode,
    reactor_threads: usize,
    shutdown: Arc<AtomicBool>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("mode", &self.mode)
            .field("reactor_threads", &self.reactor_threads)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create and bind a new server.
    pub fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        Self::bind_with_core(config.clone(), Arc::new(ServerCore::new(config.protocol)))
    }

    /// Bind a server around existing broker state.
    pub fn bind_with_core(
        config: ServerRuntimeConfig,
        core: Arc<ServerCore>,
    ) -> Result<Self, ServerError> {
        let reactor_threads = match config.reactor_threads {
            Some(0) => {
                return Err(ServerError::Config("reactor threads must be at least 1".into()));
            },
            Some(n) => n,
            None => std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
        };

        let listener = TcpListener::bind(&config.bind_address).map_err(|e| {
            ServerError::Transport(format!("failed to bind '{}': {e}", config.bind_address))
        })?;

        Ok(Self {
            listener,
            core,
            mode: config.mode,
            reactor_threads,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Broker state shared by every connection.
    pub fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }

    /// Run the server on the calling thread.
    ///
    /// Returns once shutdown was requested through a [`ServerHandle`] and
    /// every connection is closed.
    pub fn run(self) -> Result<(), ServerError> {
        tracing::info!(
            addr = ?self.listener.local_addr().ok(),
            mode = %self.mode,
            "server starting"
        );

        let result = match self.mode {
            ConcurrencyMode::Tpc => tpc::run(self.listener, &self.core, &self.shutdown),
            ConcurrencyMode::Reactor => {
                reactor::run(self.listener, &self.core, self.reactor_threads, &self.shutdown)
            },
        };

        tracing::info!("server stopped");
        result
    }

    /// Run the server on a background thread.
    pub fn spawn(self) -> Result<ServerHandle, ServerError> {
        let local_addr = self.local_addr()?;
        let core = Arc::clone(&self.core);
        let shutdown = Arc::clone(&self.shutdown);

        let thread = std::thread::Builder::new()
            .name("stomplite-server".into())
            .spawn(move || self.run())
            .map_err(|e| ServerError::Runtime(format!("failed to spawn server thread: {e}")))?;

        Ok(ServerHandle { local_addr, core, shutdown, thread: Some(thread) })
    }
}

/// Handle to a server running on a background thread.
///
/// Dropping the handle shuts the server down.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    core: Arc<ServerCore>,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<(), ServerError>>>,
}

impl ServerHandle {
    /// Address the server accepts connections on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Broker state shared by every connection.
    pub fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }

    /// Stop accepting, close every connection and wait for the server thread.
    pub fn shutdown(mut self) -> Result<(), ServerError> {
        self.stop()
    }

    fn stop(&mut self) -> Result<(), ServerError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };

        self.shutdown.store(true, Ordering::Release);
        // Unblock the accept loop.
        let _ = TcpStream::connect(wake_address(self.local_addr));

        thread.join().map_err(|_| ServerError::Runtime("server thread panicked".into()))?
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "server shutdown failed");
        }
    }
}

/// Connectable address for a listener bound to `addr`.
fn wake_address(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        },
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        },
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_known_names() {
        assert_eq!("tpc".parse::<ConcurrencyMode>().unwrap(), ConcurrencyMode::Tpc);
        assert_eq!("reactor".parse::<ConcurrencyMode>().unwrap(), ConcurrencyMode::Reactor);
        assert_eq!(ConcurrencyMode::Reactor.to_string(), "reactor");
    }

    #[test]
    fn unknown_mode_is_config_error() {
        let err = "threads".parse::<ConcurrencyMode>().unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }

    #[test]
    fn zero_reactor_threads_rejected() {
        let config = ServerRuntimeConfig {
            bind_address: "127.0.0.1:0".into(),
            mode: ConcurrencyMode::Reactor,
            reactor_threads: Some(0),
            ..ServerRuntimeConfig::default()
        };
        assert!(matches!(Server::bind(config), Err(ServerError::Config(_))));
    }

    #[test]
    fn bad_bind_address_is_transport_error() {
        let config = ServerRuntimeConfig {
            bind_address: "not an address".into(),
            ..ServerRuntimeConfig::default()
        };
        assert!(matches!(Server::bind(config), Err(ServerError::Transport(_))));
    }

    #[test]
    fn wake_address_maps_unspecified_to_loopback() {
        let addr: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        assert_eq!(wake_address(addr), "127.0.0.1:4000".parse().unwrap());

        let addr: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        assert_eq!(wake_address(addr), addr);
    }
}
