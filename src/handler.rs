//! Extension points for host applications.
//!
//! A [`Handler`] is passed to [`Server::new`](crate::Server::new) and called
//! synchronously from the server's tasks. Every method has a no-op default,
//! so hosts implement only what they need. Hooks should return quickly: a
//! slow `on_data_received` delays the next read on that connection.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::runtime::{ConnectionHandle, Disconnect};

pub trait Handler: Send + Sync + 'static {
    /// The listening socket is bound and about to start listening.
    fn on_starting(&self) {}

    /// The server is listening on `local_addr` and accepting connections.
    fn on_started(&self, _local_addr: SocketAddr) {}

    fn on_stopping(&self) {}

    /// The listening socket has been closed.
    fn on_stopped(&self) {}

    /// A connection was accepted; called before its first read.
    fn on_connected(&self, _conn: &ConnectionHandle) {}

    /// Bytes arrived on `conn` and passed the rate limiter.
    ///
    /// `data` is only valid for the duration of the call. Reply with
    /// [`ConnectionHandle::send`].
    fn on_data_received(&self, _conn: &ConnectionHandle, _data: &[u8]) {}

    /// The connection was closed, with the reason it ended.
    fn on_disconnected(&self, _conn: &ConnectionHandle, _reason: &Disconnect) {}
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn on_starting(&self) {
        (**self).on_starting()
    }

    fn on_started(&self, local_addr: SocketAddr) {
        (**self).on_started(local_addr)
    }

    fn on_stopping(&self) {
        (**self).on_stopping()
    }

    fn on_stopped(&self) {
        (**self).on_stopped()
    }

    fn on_connected(&self, conn: &ConnectionHandle) {
        (**self).on_connected(conn)
    }

    fn on_data_received(&self, conn: &ConnectionHandle, data: &[u8]) {
        (**self).on_data_received(conn, data)
    }

    fn on_disconnected(&self, conn: &ConnectionHandle, reason: &Disconnect) {
        (**self).on_disconnected(conn, reason)
    }
}
