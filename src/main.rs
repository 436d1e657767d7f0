//! enet-server: demo host for the enet server core
//!
//! Echoes every message back to its sender prefixed with "Server: You said ".
//! Configuration via CLI arguments or TOML file.

use enet::{Config, ConnectionHandle, Disconnect, Handler, Server};
use std::net::SocketAddr;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Replies to each message and logs the server's lifecycle.
struct EchoServer;

impl Handler for EchoServer {
    fn on_started(&self, local_addr: SocketAddr) {
        info!(address = %local_addr, "Ready for clients");
    }

    fn on_stopped(&self) {
        info!("Listener closed");
    }

    fn on_data_received(&self, conn: &ConnectionHandle, data: &[u8]) {
        let message = String::from_utf8_lossy(data);
        let message = message.trim_end();
        info!(peer = %conn.peer_addr(), text = message, "Client said");

        // Failed writes are logged by the connection's writer
        let _ = conn.send(format!("Server: You said {message}\n").as_bytes());
    }

    fn on_disconnected(&self, conn: &ConnectionHandle, reason: &Disconnect) {
        info!(peer = %conn.peer_addr(), %reason, "Client left");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let workers = config.workers.unwrap_or_else(num_cpus);
    info!(
        host = %config.host,
        port = config.port,
        max_connections = config.max_connections,
        buffer_size = config.buffer_size,
        rate_limit_mb = config.rate_limit / 1024 / 1024,
        rate_window_secs = config.rate_window.as_secs(),
        workers,
        "Starting enet server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let server = Server::new(config, EchoServer);
        server
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for shutdown signal");
                }
                info!("Shutting down");
            })
            .await
    })?;

    Ok(())
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
