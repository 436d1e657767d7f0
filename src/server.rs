//! TCP server composing the runtime pieces.
//!
//! `start` binds the listener and spawns two tasks: the accept loop, which
//! spawns one task per connection, and a housekeeping task that evicts idle
//! pooled connections and forgets stale rate windows. `stop` closes the
//! listener; connections already established run until their peers leave.

use socket2::{Domain, Protocol, Socket, Type};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Result, ServerError};
use crate::handler::Handler;
use crate::runtime::{
    AcceptExit, AcceptLoop, BufferPool, Connection, ConnectionPool, Disconnect, RateLimiter,
    ReceiveLoop,
};

/// State shared by the server and all of its tasks.
struct Shared<H> {
    config: Config,
    handler: H,
    buffers: BufferPool,
    limiter: RateLimiter,
    connections: ConnectionPool,
}

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: JoinHandle<AcceptExit>,
    housekeeping_task: JoinHandle<()>,
}

enum State {
    Stopped,
    /// Binding; hooks may run, the lock is not held.
    Starting,
    Running(Running),
}

/// Server instance
pub struct Server<H: Handler> {
    shared: Arc<Shared<H>>,
    state: Mutex<State>,
}

impl<H: Handler> Server<H> {
    /// Create a new server instance
    pub fn new(config: Config, handler: H) -> Self {
        let buffers = BufferPool::new(config.buffer_size, config.max_buffers, config.buffer_policy);
        let limiter = RateLimiter::new(config.rate_window, config.rate_limit, config.rate_retention());
        let connections = ConnectionPool::new(config.max_connections, config.idle_timeout);

        Server {
            shared: Arc::new(Shared {
                config,
                handler,
                buffers,
                limiter,
                connections,
            }),
            state: Mutex::new(State::Stopped),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind, listen and start accepting connections.
    ///
    /// Returns the address actually bound, which differs from the configured
    /// one when port 0 is used. On error the server stays stopped.
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.lock();
            if !matches!(*state, State::Stopped) {
                return Err(ServerError::AlreadyRunning);
            }
            *state = State::Starting;
        }

        let (listener, local_addr) = match self.bind() {
            Ok(bound) => bound,
            Err(e) => {
                *self.lock() = State::Stopped;
                return Err(e);
            }
        };

        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_connections(
            Arc::clone(&self.shared),
            listener,
            shutdown.clone(),
        ));
        let housekeeping_task = tokio::spawn(housekeeping_task(
            Arc::clone(&self.shared),
            shutdown.clone(),
        ));

        *self.lock() = State::Running(Running {
            local_addr,
            shutdown,
            accept_task,
            housekeeping_task,
        });

        info!(
            address = %local_addr,
            max_connections = self.shared.config.max_connections,
            "Server listening"
        );
        self.shared.handler.on_started(local_addr);
        Ok(local_addr)
    }

    fn bind(&self) -> Result<(TcpListener, SocketAddr)> {
        self.shared.config.validate()?;
        let addr = self.shared.config.listen_addr()?;
        let listener = self.listen(addr)?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok((listener, local_addr))
    }

    /// Build the listening socket.
    ///
    /// `on_starting` fires between bind and listen.
    fn listen(&self, addr: SocketAddr) -> Result<TcpListener> {
        let bind_error = |source: io::Error| ServerError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(bind_error)?;
        socket.set_reuse_address(true).map_err(bind_error)?;
        socket.set_nonblocking(true).map_err(bind_error)?;
        socket.bind(&addr.into()).map_err(bind_error)?;

        self.shared.handler.on_starting();

        let backlog = i32::try_from(self.shared.config.max_connections).unwrap_or(i32::MAX);
        socket.listen(backlog).map_err(bind_error)?;

        TcpListener::from_std(socket.into()).map_err(bind_error)
    }

    /// Close the listening socket and wait for the accept loop to finish.
    pub async fn stop(&self) -> Result<()> {
        let previous = {
            let mut state = self.lock();
            if !matches!(*state, State::Running(_)) {
                return Err(ServerError::NotRunning);
            }
            std::mem::replace(&mut *state, State::Stopped)
        };
        let State::Running(running) = previous else {
            return Err(ServerError::NotRunning);
        };

        self.shared.handler.on_stopping();
        running.shutdown.cancel();

        match running.accept_task.await {
            Ok(exit) => debug!(?exit, "Accept loop finished"),
            Err(e) => error!(error = %e, "Accept task failed"),
        }
        if let Err(e) = running.housekeeping_task.await {
            error!(error = %e, "Housekeeping task failed");
        }

        info!(address = %running.local_addr, "Server stopped");
        self.shared.handler.on_stopped();
        Ok(())
    }

    /// Start, serve until `signal` resolves, then stop.
    pub async fn run_until<F: Future<Output = ()>>(&self, signal: F) -> Result<()> {
        self.start().await?;
        signal.await;
        self.stop().await
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock(), State::Running(_))
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lock() {
            State::Running(running) => Some(running.local_addr),
            State::Stopped | State::Starting => None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.shared.buffers
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.shared.limiter
    }

    pub fn connections(&self) -> &ConnectionPool {
        &self.shared.connections
    }
}

impl<H: Handler> Drop for Server<H> {
    fn drop(&mut self) {
        if let State::Running(running) = &*self.lock() {
            running.shutdown.cancel();
        }
    }
}

/// Accept connections and spawn a task for each one.
async fn accept_connections<H: Handler>(
    shared: Arc<Shared<H>>,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> AcceptExit {
    AcceptLoop::new(listener, shutdown)
        .run(|stream, peer| match shared.connections.acquire(stream) {
            Ok(connection) => {
                tokio::spawn(serve_connection(Arc::clone(&shared), connection));
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping connection");
            }
        })
        .await
}

/// Returns the wrapper to its pool however the connection task ends.
struct Lease<'a> {
    pool: &'a ConnectionPool,
    connection: Option<Connection>,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

/// Handle a single client connection
async fn serve_connection<H: Handler>(shared: Arc<Shared<H>>, connection: Connection) {
    let mut lease = Lease {
        pool: &shared.connections,
        connection: Some(connection),
    };
    let Some(connection) = lease.connection.as_mut() else {
        return;
    };
    let Some(handle) = connection.handle().cloned() else {
        return;
    };
    let peer = handle.peer_addr();

    info!(peer = %peer, id = handle.id(), "Client connected");
    shared.handler.on_connected(&handle);

    let reason = ReceiveLoop::new(&shared.buffers, &shared.limiter)
        .run(connection, &shared.handler)
        .await;
    // Replies to the peer's last message still go out after it half-closes
    if matches!(reason, Disconnect::PeerClosed) {
        connection.finish();
    } else {
        connection.disconnect();
    }

    match &reason {
        Disconnect::RateLimited { bytes, limit } => {
            let err = ServerError::RateLimited {
                endpoint: peer,
                bytes: *bytes,
                limit: *limit,
            };
            warn!(id = handle.id(), error = %err, "Connection closed");
        }
        reason if reason.is_failure() => {
            warn!(peer = %peer, id = handle.id(), %reason, "Connection closed");
        }
        reason => {
            info!(peer = %peer, id = handle.id(), %reason, "Connection closed");
        }
    }
    shared.handler.on_disconnected(&handle, &reason);
}

/// Background task evicting idle wrappers and stale rate windows
async fn housekeeping_task<H: Handler>(shared: Arc<Shared<H>>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(shared.config.housekeeping_interval);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let now = Instant::now();
        let evicted = shared.connections.evict_stale(now);
        let swept = shared.limiter.sweep(now);
        if evicted > 0 || swept > 0 {
            debug!(evicted, swept, "Housekeeping");
        }
    }
}
