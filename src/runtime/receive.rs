//! Receive loop for one connection.
//!
//! Reads are strictly sequential: the loop owns the read half, awaits one
//! read, handles it, and only then issues the next. Each read lands in a
//! buffer rented from the shared pool for the duration of that read.

use std::fmt;
use std::io;
use tokio::io::AsyncReadExt;
use tracing::trace;

use crate::handler::Handler;
use crate::runtime::{BufferError, BufferPool, Connection, RateLimiter};

/// Why a connection's receive loop ended.
#[derive(Debug)]
pub enum Disconnect {
    /// The peer closed its side (zero-length read).
    PeerClosed,
    /// The host or the writer closed the connection.
    Closed,
    /// The endpoint exceeded its byte ceiling.
    RateLimited { bytes: u64, limit: u64 },
    /// No receive buffer could be rented.
    BufferUnavailable(BufferError),
    /// The socket failed.
    Transport(io::Error),
}

impl Disconnect {
    /// Whether the connection ended because of a failure rather than an
    /// orderly close.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Disconnect::PeerClosed | Disconnect::Closed)
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::PeerClosed => f.write_str("closed by peer"),
            Disconnect::Closed => f.write_str("closed locally"),
            Disconnect::RateLimited { bytes, limit } => {
                write!(f, "rate limit exceeded ({bytes} bytes, limit {limit})")
            }
            Disconnect::BufferUnavailable(e) => write!(f, "no receive buffer: {e}"),
            Disconnect::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// Receive driver borrowing the server's shared buffer pool and limiter.
pub struct ReceiveLoop<'a> {
    buffers: &'a BufferPool,
    limiter: &'a RateLimiter,
}

impl<'a> ReceiveLoop<'a> {
    pub fn new(buffers: &'a BufferPool, limiter: &'a RateLimiter) -> Self {
        Self { buffers, limiter }
    }

    /// Receive from `connection` until it ends, delivering every admitted
    /// read to `handler`.
    ///
    /// The connection is left attached; disconnecting it is up to the caller.
    pub async fn run<H: Handler + ?Sized>(&self, connection: &mut Connection, handler: &H) -> Disconnect {
        let Some(handle) = connection.handle().cloned() else {
            return Disconnect::Closed;
        };
        let peer = handle.peer_addr();
        let closed = handle.closed_token().clone();

        loop {
            let rented = tokio::select! {
                _ = closed.cancelled() => return Disconnect::Closed,
                rented = self.buffers.rent() => rented,
            };
            let mut buffer = match rented {
                Ok(buffer) => buffer,
                Err(e) => return Disconnect::BufferUnavailable(e),
            };

            let Some(reader) = connection.reader_mut() else {
                return Disconnect::Closed;
            };
            let read = tokio::select! {
                _ = closed.cancelled() => return Disconnect::Closed,
                read = reader.read(&mut buffer) => read,
            };

            let n = match read {
                Ok(0) => return Disconnect::PeerClosed,
                Ok(n) => n,
                Err(e) => return Disconnect::Transport(e),
            };
            connection.touch();
            trace!(peer = %peer, bytes = n, "Received data");

            if !self.limiter.admit(peer, n) {
                return Disconnect::RateLimited {
                    bytes: self.limiter.bytes_in_window(peer).unwrap_or(n as u64),
                    limit: self.limiter.limit(),
                };
            }

            handler.on_data_received(&handle, &buffer[..n]);

            // A buffer from this pool is never foreign
            let _ = self.buffers.release(buffer);
        }
    }
}
