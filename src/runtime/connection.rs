//! Connection wrappers and the pool that recycles them.
//!
//! A [`Connection`] is the reusable wrapper the server drives: it owns the
//! read half of an accepted socket and a [`ConnectionHandle`] that hooks use
//! to send data or close the connection. When a connection ends, the wrapper
//! is detached from its socket and parked in the [`ConnectionPool`] for the
//! next accept.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Result, ServerError};

/// Outbound payload queued for a connection's writer task.
struct Outgoing {
    payload: Bytes,
    done: oneshot::Sender<io::Result<usize>>,
}

struct HandleInner {
    id: u64,
    peer: SocketAddr,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    /// Hard close: the writer stops without flushing.
    closed: CancellationToken,
    /// Orderly close: the writer flushes what is queued, then stops.
    draining: CancellationToken,
}

/// Cloneable view of an active connection, handed to hooks.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    /// Server-unique connection id.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Remote address and port.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    /// Queue `data` for sending without waiting.
    ///
    /// Payloads are written in the order they were queued. The returned
    /// receipt resolves to the number of bytes written once the write
    /// completes; it can be ignored.
    pub fn send(&self, data: &[u8]) -> SendReceipt {
        let (done, receipt) = oneshot::channel();
        if self.is_closed() {
            let _ = done.send(Err(not_connected()));
            return SendReceipt(receipt);
        }

        let outgoing = Outgoing {
            payload: Bytes::copy_from_slice(data),
            done,
        };
        if let Err(mpsc::error::SendError(outgoing)) = self.inner.outgoing.send(outgoing) {
            let _ = outgoing.done.send(Err(not_connected()));
        }
        SendReceipt(receipt)
    }

    /// Ask the server to disconnect this connection.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled() || self.inner.draining.is_cancelled()
    }

    pub(crate) fn closed_token(&self) -> &CancellationToken {
        &self.inner.closed
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Completion of a [`ConnectionHandle::send`].
#[derive(Debug)]
pub struct SendReceipt(oneshot::Receiver<io::Result<usize>>);

impl SendReceipt {
    /// Wait for the write to finish and return the bytes transferred.
    pub async fn bytes_sent(self) -> io::Result<usize> {
        self.0.await.unwrap_or_else(|_| Err(not_connected()))
    }
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "connection closed")
}

/// Drain a connection's send queue onto its socket.
///
/// Once `draining` fires, payloads already queued are still written before
/// the write half is shut down. `closed` stops the writer immediately.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    closed: CancellationToken,
    draining: CancellationToken,
    peer: SocketAddr,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            next = queue.recv() => next,
            _ = draining.cancelled() => queue.try_recv().ok(),
        };
        let Some(Outgoing { payload, done }) = next else {
            break;
        };

        let result = tokio::select! {
            _ = closed.cancelled() => Err(not_connected()),
            written = writer.write_all(&payload) => written.map(|()| payload.len()),
        };

        let failed = result.is_err();
        match &result {
            Ok(bytes) => debug!(peer = %peer, bytes, "Sent data"),
            Err(e) => warn!(peer = %peer, error = %e, "Failed to send data"),
        }
        // The sender may not care about the outcome
        let _ = done.send(result);

        if failed {
            closed.cancel();
            break;
        }
    }

    let _ = writer.shutdown().await;
    trace!(peer = %peer, "Writer finished");
}

/// Socket-bound part of a connection.
struct Attached {
    reader: OwnedReadHalf,
    handle: ConnectionHandle,
}

/// Reusable connection wrapper.
#[derive(Debug)]
pub struct Connection {
    /// Pool-assigned, stable for the lifetime of the wrapper.
    slot: u64,
    /// How many sockets this wrapper has served.
    uses: u64,
    last_activity: Instant,
    attached: Option<Attached>,
}

impl std::fmt::Debug for Attached {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}

impl Connection {
    fn new(slot: u64) -> Self {
        Self {
            slot,
            uses: 0,
            last_activity: Instant::now(),
            attached: None,
        }
    }

    /// Bind the wrapper to a freshly accepted socket.
    ///
    /// Spawns the connection's writer task, so this must run inside a Tokio
    /// runtime.
    fn attach(&mut self, stream: TcpStream, peer: SocketAddr, id: u64) {
        let (reader, writer) = stream.into_split();
        let (outgoing, queue) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let draining = CancellationToken::new();

        tokio::spawn(write_loop(
            writer,
            queue,
            closed.clone(),
            draining.clone(),
            peer,
        ));

        self.uses += 1;
        self.last_activity = Instant::now();
        self.attached = Some(Attached {
            reader,
            handle: ConnectionHandle {
                inner: Arc::new(HandleInner {
                    id,
                    peer,
                    outgoing,
                    closed,
                    draining,
                }),
            },
        });
    }

    /// Close the socket and drop it from the wrapper.
    ///
    /// Returns `false` if the wrapper was already disconnected.
    pub fn disconnect(&mut self) -> bool {
        match self.attached.take() {
            Some(attached) => {
                // Stops the writer, which shuts down the write half
                attached.handle.close();
                true
            }
            None => false,
        }
    }

    /// Detach from the socket after flushing sends already queued.
    ///
    /// Used when the peer closed its side: replies queued by the last hook
    /// still reach it. Returns `false` if the wrapper was already
    /// disconnected.
    pub fn finish(&mut self) -> bool {
        match self.attached.take() {
            Some(attached) => {
                attached.handle.inner.draining.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.attached.is_some()
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.attached.as_ref().map(|a| &a.handle)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.handle().map(ConnectionHandle::peer_addr)
    }

    pub(crate) fn reader_mut(&mut self) -> Option<&mut OwnedReadHalf> {
        self.attached.as_mut().map(|a| &mut a.reader)
    }

    /// Record activity on the connection.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn slot(&self) -> u64 {
        self.slot
    }

    pub fn uses(&self) -> u64 {
        self.uses
    }
}

struct PoolState {
    /// Detached wrappers, oldest release first.
    idle: VecDeque<Connection>,
    live: usize,
    next_slot: u64,
}

/// Pool of reusable [`Connection`] wrappers with a cap on live connections.
pub struct ConnectionPool {
    state: Mutex<PoolState>,
    max_connections: usize,
    idle_timeout: Duration,
    next_id: AtomicU64,
}

impl ConnectionPool {
    /// Create a pool serving at most `max_connections` at once.
    pub fn new(max_connections: usize, idle_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(max_connections),
                live: 0,
                next_slot: 0,
            }),
            max_connections,
            idle_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a wrapper for a new socket and bind it.
    ///
    /// Fails with [`ServerError::Capacity`] when the pool is already serving
    /// its maximum, and with [`ServerError::Transport`] when the socket's
    /// peer address cannot be read.
    pub fn acquire(&self, stream: TcpStream) -> Result<Connection> {
        let peer = stream.peer_addr()?;
        let mut connection = self.checkout()?;
        connection.attach(stream, peer, self.next_id.fetch_add(1, Ordering::Relaxed));
        trace!(
            slot = connection.slot,
            uses = connection.uses,
            peer = %peer,
            "Connection acquired"
        );
        Ok(connection)
    }

    /// Reserve a live slot and hand out the oldest idle wrapper, or a new one.
    fn checkout(&self) -> Result<Connection> {
        let mut state = self.lock();
        if state.live >= self.max_connections {
            return Err(ServerError::Capacity {
                max: self.max_connections,
            });
        }
        state.live += 1;

        Ok(match state.idle.pop_front() {
            Some(connection) => connection,
            None => {
                let slot = state.next_slot;
                state.next_slot += 1;
                Connection::new(slot)
            }
        })
    }

    /// Return a wrapper to the pool.
    ///
    /// The wrapper is disconnected first if it still holds a socket. If the
    /// idle list is already full the wrapper is dropped.
    pub fn release(&self, mut connection: Connection) {
        connection.disconnect();
        connection.touch();

        let mut state = self.lock();
        state.live = state.live.saturating_sub(1);
        if state.idle.len() < self.max_connections {
            state.idle.push_back(connection);
        } else {
            trace!(slot = connection.slot, "Idle list full, dropping wrapper");
        }
    }

    /// Drop idle wrappers unused for longer than the idle timeout.
    ///
    /// Returns the number evicted.
    pub fn evict_stale(&self, now: Instant) -> usize {
        let mut state = self.lock();
        let before = state.idle.len();
        state
            .idle
            .retain(|c| now.saturating_duration_since(c.last_activity) <= self.idle_timeout);
        before - state.idle.len()
    }

    /// Connections currently being served.
    pub fn live(&self) -> usize {
        self.lock().live
    }

    /// Wrappers parked for reuse.
    pub fn idle(&self) -> usize {
        self.lock().idle.len()
    }

    /// Maximum concurrently served connections.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("max_connections", &self.max_connections)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Connected (client, server) socket pair over loopback.
    async fn socket_pair(listener: &TcpListener) -> (TcpStream, TcpStream) {
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn test_checkout_respects_capacity() {
        let pool = ConnectionPool::new(2, Duration::from_secs(60));

        let c1 = pool.checkout().unwrap();
        let c2 = pool.checkout().unwrap();
        assert!(matches!(
            pool.checkout(),
            Err(ServerError::Capacity { max: 2 })
        ));
        assert_eq!(pool.live(), 2);

        pool.release(c1);
        assert_eq!(pool.live(), 1);
        assert!(pool.checkout().is_ok());

        pool.release(c2);
    }

    #[test]
    fn test_idle_wrappers_reused_fifo() {
        let pool = ConnectionPool::new(3, Duration::from_secs(60));

        let c0 = pool.checkout().unwrap();
        let c1 = pool.checkout().unwrap();
        let c2 = pool.checkout().unwrap();
        assert_eq!((c0.slot(), c1.slot(), c2.slot()), (0, 1, 2));

        pool.release(c1);
        pool.release(c0);
        assert_eq!(pool.idle(), 2);

        // Oldest released first
        assert_eq!(pool.checkout().unwrap().slot(), 1);
        assert_eq!(pool.checkout().unwrap().slot(), 0);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_release_past_idle_capacity_drops_wrapper() {
        let pool = ConnectionPool::new(1, Duration::from_secs(60));

        let c0 = pool.checkout().unwrap();
        pool.release(c0);
        // A stray wrapper beyond what the pool handed out
        pool.release(Connection::new(99));

        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.checkout().unwrap().slot(), 0);
    }

    #[test]
    fn test_evict_stale_uses_strict_timeout() {
        let timeout = Duration::from_secs(60);
        let pool = ConnectionPool::new(3, timeout);

        let wrappers: Vec<_> = (0..3).map(|_| pool.checkout().unwrap()).collect();
        for connection in wrappers {
            pool.release(connection);
        }

        let base = Instant::now();
        let now = base + Duration::from_secs(61);
        {
            let mut state = pool.lock();
            state.idle[0].last_activity = base;
            state.idle[1].last_activity = now - timeout;
            state.idle[2].last_activity = now - Duration::from_secs(5);
        }

        // Idle for 61s, exactly 60s and 5s respectively
        assert_eq!(pool.evict_stale(now), 1);
        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.checkout().unwrap().slot(), 1);
    }

    #[tokio::test]
    async fn test_acquire_attaches_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (client, server) = socket_pair(&listener).await;
        let pool = ConnectionPool::new(2, Duration::from_secs(60));

        let connection = pool.acquire(server).unwrap();
        assert!(connection.is_connected());
        assert_eq!(connection.uses(), 1);
        assert_eq!(connection.peer_addr(), Some(client.local_addr().unwrap()));
        assert_eq!(pool.live(), 1);

        pool.release(connection);
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_acquire_reuses_wrapper_for_new_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = ConnectionPool::new(1, Duration::from_secs(60));

        let (_c1, s1) = socket_pair(&listener).await;
        let first = pool.acquire(s1).unwrap();
        let first_id = first.handle().unwrap().id();
        let slot = first.slot();
        pool.release(first);

        let (_c2, s2) = socket_pair(&listener).await;
        let second = pool.acquire(s2).unwrap();
        assert_eq!(second.slot(), slot);
        assert_eq!(second.uses(), 2);
        assert_ne!(second.handle().unwrap().id(), first_id);
    }

    #[tokio::test]
    async fn test_acquire_fails_at_capacity() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let pool = ConnectionPool::new(1, Duration::from_secs(60));

        let (_c1, s1) = socket_pair(&listener).await;
        let _held = pool.acquire(s1).unwrap();

        let (_c2, s2) = socket_pair(&listener).await;
        assert!(matches!(
            pool.acquire(s2),
            Err(ServerError::Capacity { max: 1 })
        ));
        assert_eq!(pool.live(), 1);
    }

    #[tokio::test]
    async fn test_send_reports_bytes_written() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut client, server) = socket_pair(&listener).await;
        let pool = ConnectionPool::new(1, Duration::from_secs(60));
        let connection = pool.acquire(server).unwrap();
        let handle = connection.handle().unwrap().clone();

        let first = handle.send(b"hello ");
        let second = handle.send(b"world");
        assert_eq!(first.bytes_sent().await.unwrap(), 6);
        assert_eq!(second.bytes_sent().await.unwrap(), 5);

        let mut received = [0u8; 11];
        client.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"hello world");
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut client, server) = socket_pair(&listener).await;
        let pool = ConnectionPool::new(1, Duration::from_secs(60));
        let mut connection = pool.acquire(server).unwrap();
        let handle = connection.handle().unwrap().clone();

        assert!(connection.disconnect());
        assert!(!connection.disconnect());
        assert!(handle.is_closed());

        let err = handle.send(b"late").bytes_sent().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        // Peer observes the close
        let mut buf = [0u8; 8];
        let n = client.read(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_finish_flushes_queued_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (mut client, server) = socket_pair(&listener).await;
        let pool = ConnectionPool::new(1, Duration::from_secs(60));
        let mut connection = pool.acquire(server).unwrap();
        let handle = connection.handle().unwrap().clone();

        let first = handle.send(b"queued ");
        let second = handle.send(b"before finish");
        assert!(connection.finish());
        assert!(!connection.finish());
        assert!(!connection.disconnect());
        assert!(handle.is_closed());

        let err = handle.send(b"late").bytes_sent().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);

        // Everything queued arrives, then the write half is shut down
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"queued before finish");
        assert_eq!(first.bytes_sent().await.unwrap(), 7);
        assert_eq!(second.bytes_sent().await.unwrap(), 13);
    }
}
