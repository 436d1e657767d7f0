//! enet: a minimal asynchronous TCP server core.
//!
//! The server accepts connections up to a fixed cap, reads from each one
//! into buffers rented from a shared pool, enforces a per-endpoint byte
//! ceiling over a time window, and hands admitted data to a host-supplied
//! [`Handler`]. Replies go back through [`ConnectionHandle::send`].
//!
//! ```no_run
//! use enet::{Config, ConnectionHandle, Handler, Server};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_data_received(&self, conn: &ConnectionHandle, data: &[u8]) {
//!         conn.send(data);
//!     }
//! }
//!
//! # async fn run() -> enet::Result<()> {
//! let server = Server::new(Config::default(), Echo);
//! server.run_until(async {
//!     let _ = tokio::signal::ctrl_c().await;
//! }).await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod handler;
pub mod runtime;
pub mod server;

pub use config::Config;
pub use error::{Result, ServerError};
pub use handler::Handler;
pub use runtime::{
    BufferPool, ConnectionHandle, ConnectionPool, Disconnect, ExhaustionPolicy, RateLimiter,
    SendReceipt,
};
pub use server::Server;
