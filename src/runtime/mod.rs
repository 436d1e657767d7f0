//! Connection runtime for the server core.
//!
//! Building blocks composed by [`Server`](crate::Server):
//! - `BufferPool`: shared fixed-size receive buffers
//! - `RateLimiter`: per-endpoint byte accounting
//! - `ConnectionPool`: reusable connection wrappers with a live cap
//! - `AcceptLoop` / `ReceiveLoop`: the two async drivers

mod accept;
mod buffer;
mod connection;
mod rate_limit;
mod receive;

pub use accept::{AcceptExit, AcceptLoop};
pub use buffer::{Buffer, BufferError, BufferPool, ExhaustionPolicy};
pub use connection::{Connection, ConnectionHandle, ConnectionPool, SendReceipt};
pub use rate_limit::{RateLimiter, RateWindow};
pub use receive::{Disconnect, ReceiveLoop};
