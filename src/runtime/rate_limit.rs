//! Per-endpoint inbound byte accounting.
//!
//! Each remote endpoint gets a fixed window: bytes are summed from the
//! moment the window opens, and once the window is older than the configured
//! length the next read starts a fresh one. The read that pushes an endpoint
//! over its ceiling is still counted before it is rejected.

use dashmap::DashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Accounting state for one endpoint.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    /// When the current window opened.
    pub started_at: Instant,
    /// Bytes accounted since `started_at`.
    pub bytes: u64,
}

/// Fixed-window byte limiter keyed by remote address and port.
///
/// Updates for one endpoint are serialized by the map's entry lock; endpoints
/// living in different shards never contend.
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<SocketAddr, RateWindow>,
    window: Duration,
    limit: u64,
    retention: Duration,
}

impl RateLimiter {
    /// Create a limiter allowing `limit` bytes per `window`.
    ///
    /// `retention` is how long a window may go without being reopened before
    /// [`sweep`](Self::sweep) forgets the endpoint.
    pub fn new(window: Duration, limit: u64, retention: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            limit,
            retention: retention.max(window),
        }
    }

    /// Account `bytes` received from `endpoint` and decide whether to admit.
    pub fn admit(&self, endpoint: SocketAddr, bytes: usize) -> bool {
        self.admit_at(endpoint, bytes, Instant::now())
    }

    /// [`admit`](Self::admit) with an explicit clock reading.
    pub fn admit_at(&self, endpoint: SocketAddr, bytes: usize, now: Instant) -> bool {
        let mut entry = self.windows.entry(endpoint).or_insert(RateWindow {
            started_at: now,
            bytes: 0,
        });

        if now.saturating_duration_since(entry.started_at) > self.window {
            trace!(endpoint = %endpoint, previous = entry.bytes, "Rate window reset");
            entry.started_at = now;
            entry.bytes = 0;
        }

        entry.bytes = entry.bytes.saturating_add(bytes as u64);

        let admitted = entry.bytes <= self.limit;
        if !admitted {
            debug!(
                endpoint = %endpoint,
                bytes = entry.bytes,
                limit = self.limit,
                "Rate limit exceeded"
            );
        }
        admitted
    }

    /// Bytes accounted to `endpoint` in its current window.
    pub fn bytes_in_window(&self, endpoint: SocketAddr) -> Option<u64> {
        self.windows.get(&endpoint).map(|w| w.bytes)
    }

    /// Forget endpoints whose window opened longer ago than the retention
    /// period. Returns the number removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started_at) <= self.retention);
        before.saturating_sub(self.windows.len())
    }

    /// Configured ceiling in bytes per window.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Configured window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of tracked endpoints.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}
