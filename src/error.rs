//! Error types for the server core.
//!
//! Per-connection failures (`Transport`, `RateLimited`) are contained to the
//! connection they happen on. `Capacity` is returned to whoever tried to
//! acquire a connection slot. Lifecycle errors (`AlreadyRunning`,
//! `NotRunning`, `Bind`) are returned to the caller of start/stop.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::ConfigError;
use crate::runtime::BufferError;

/// Errors produced by the server core.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket-level failure during accept, receive or send.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The connection pool is already serving its maximum.
    #[error("connection pool is full ({max} connections)")]
    Capacity { max: usize },

    /// An endpoint sent more than its ceiling within one window.
    #[error("rate limit exceeded for {endpoint}: {bytes} bytes in window (limit {limit})")]
    RateLimited {
        endpoint: SocketAddr,
        bytes: u64,
        limit: u64,
    },

    #[error("server is already running")]
    AlreadyRunning,

    #[error("server is not running")]
    NotRunning,

    /// Binding or listening on the configured address failed.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

pub type Result<T> = std::result::Result<T, ServerError>;
