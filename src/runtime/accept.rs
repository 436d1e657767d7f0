//! Accept loop over the listening socket.
//!
//! One accept is pending at a time. Whatever happens to an accepted socket
//! afterwards, the loop goes straight back to accepting; it only stops when
//! the shutdown token fires or the listening socket itself is gone.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

/// Pause after a failed accept, so errors like `EMFILE` don't spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Why an [`AcceptLoop`] returned.
#[derive(Debug)]
pub enum AcceptExit {
    /// The shutdown token was cancelled.
    Shutdown,
    /// The listening socket stopped being usable.
    ListenerClosed(io::Error),
}

/// Drives sequential accepts on one listener.
pub struct AcceptLoop {
    listener: TcpListener,
    shutdown: CancellationToken,
}

impl AcceptLoop {
    pub fn new(listener: TcpListener, shutdown: CancellationToken) -> Self {
        Self { listener, shutdown }
    }

    /// Accept until shut down, handing every new socket to `on_accept`.
    ///
    /// The listener is closed when this returns.
    pub async fn run<F>(self, mut on_accept: F) -> AcceptExit
    where
        F: FnMut(TcpStream, SocketAddr),
    {
        let local = self.listener.local_addr().ok();

        let exit = loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break AcceptExit::Shutdown,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");
                    on_accept(stream, peer);
                }
                Err(e) if listener_gone(&e) => {
                    error!(error = %e, "Listening socket closed");
                    break AcceptExit::ListenerClosed(e);
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break AcceptExit::Shutdown,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
            trace!("Re-arming accept");
        };

        if let Some(addr) = local {
            info!(address = %addr, "Stopped accepting");
        }
        exit
    }
}

/// Accept errors that mean the listening socket itself is unusable.
#[cfg(unix)]
fn listener_gone(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF) | Some(libc::EINVAL) | Some(libc::ENOTSOCK)
    )
}

#[cfg(not(unix))]
fn listener_gone(_err: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_accepts_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let task = tokio::spawn(AcceptLoop::new(listener, shutdown.clone()).run(
            move |stream, peer| {
                let _ = tx.send((stream, peer));
            },
        ));

        let c1 = TcpStream::connect(addr).await.unwrap();
        let c2 = TcpStream::connect(addr).await.unwrap();
        let (_, p1) = rx.recv().await.unwrap();
        let (_, p2) = rx.recv().await.unwrap();
        let mut peers = [p1, p2];
        peers.sort();
        let mut expected = [c1.local_addr().unwrap(), c2.local_addr().unwrap()];
        expected.sort();
        assert_eq!(peers, expected);

        shutdown.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(exit, AcceptExit::Shutdown));

        // Listener is closed once the loop returns
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_keeps_accepting_after_dropped_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut seen = 0;
        let task = tokio::spawn(AcceptLoop::new(listener, shutdown.clone()).run(
            move |stream, peer| {
                seen += 1;
                // Reject the first connection outright
                if seen == 1 {
                    drop(stream);
                } else {
                    let _ = tx.send(peer);
                }
            },
        ));

        let _first = TcpStream::connect(addr).await.unwrap();
        let second = TcpStream::connect(addr).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), second.local_addr().unwrap());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_exits_when_listener_shut_down() {
        use std::os::fd::AsRawFd;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let fd = listener.as_raw_fd();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(AcceptLoop::new(listener, shutdown.clone()).run(|_, _| {}));

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Accept on a shut down listening socket fails with EINVAL
        let rc = unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
        assert_eq!(rc, 0);

        let exit = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        match exit {
            AcceptExit::ListenerClosed(e) => assert_eq!(e.raw_os_error(), Some(libc::EINVAL)),
            other => panic!("unexpected exit: {other:?}"),
        }
        assert!(!shutdown.is_cancelled());
    }

    #[cfg(unix)]
    #[test]
    fn test_listener_gone_errors() {
        assert!(listener_gone(&io::Error::from_raw_os_error(libc::EBADF)));
        assert!(!listener_gone(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!listener_gone(&io::Error::new(io::ErrorKind::Other, "other")));
    }
}
