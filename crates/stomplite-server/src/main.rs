//! Stomplite server binary.
//!
//! # Usage
//!
//! ```bash
//! # Thread-per-connection on port 7777
//! stomplite-server 7777 tpc
//!
//! # Reactor with four workers, debug logging
//! stomplite-server 7777 reactor --reactor-threads 4 --log-level debug
//! ```

use clap::Parser;
use stomplite_server::{ConcurrencyMode, ProtocolConfig, Server, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Stomplite pub/sub broker
#[derive(Parser, Debug)]
#[command(name = "stomplite-server")]
#[command(about = "STOMP-style publish/subscribe broker over TCP")]
#[command(version)]
struct Args {
    /// TCP port to listen on
    port: u16,

    /// Concurrency strategy
    #[arg(value_enum)]
    mode: ConcurrencyMode,

    /// Interface to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Reactor worker threads (defaults to available parallelism)
    #[arg(long)]
    reactor_threads: Option<usize>,

    /// Version announced in CONNECTED frames
    #[arg(long, default_value = stomplite_core::DEFAULT_PROTOCOL_VERSION)]
    protocol_version: String,

    /// Reject every command except CONNECT/DISCONNECT before login
    #[arg(long)]
    require_auth: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Stomplite server starting");

    let config = ServerRuntimeConfig {
        bind_address: format!("{}:{}", args.host, args.port),
        mode: args.mode,
        reactor_threads: args.reactor_threads,
        protocol: ProtocolConfig {
            version: args.protocol_version,
            require_authentication: args.require_auth,
        },
    };

    let server = Server::bind(config)?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server.run()?;

    Ok(())
}
