//! Shared pool of fixed-size receive buffers.
//!
//! Chunks are kept in an ordered list and rented first-free-first. When no
//! chunk is free the pool grows by one, unless a cap is configured, in which
//! case the [`ExhaustionPolicy`] decides between failing and waiting.
//!
//! A rented [`Buffer`] owns its memory until it is dropped or released, at
//! which point the memory goes back into the chunk it came from. Buffers
//! therefore cannot leak out of the pool, even if the task holding one
//! unwinds.

use serde::Deserialize;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::trace;

/// What [`BufferPool::rent`] does when a capped pool has no free chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionPolicy {
    /// Fail the rent with [`BufferError::Exhausted`].
    #[default]
    Reject,
    /// Suspend until another renter releases a buffer.
    Wait,
}

/// Error returned when buffer pool operations fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer pool exhausted ({max} chunks in use)")]
    Exhausted { max: usize },
    #[error("buffer was not rented from this pool")]
    Foreign,
}

struct Chunk {
    /// `None` while the chunk is lent out.
    memory: Option<Box<[u8]>>,
    in_use: bool,
}

struct PoolShared {
    chunk_size: usize,
    max_chunks: Option<usize>,
    policy: ExhaustionPolicy,
    chunks: Mutex<Vec<Chunk>>,
    available: Notify,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, Vec<Chunk>> {
        self.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, index: usize, memory: Box<[u8]>) {
        let mut chunks = self.lock();
        if let Some(chunk) = chunks.get_mut(index) {
            chunk.memory = Some(memory);
            chunk.in_use = false;
        }
        drop(chunks);
        self.available.notify_one();
    }
}

/// Thread-safe pool of fixed-size byte buffers.
///
/// Cloning the pool yields another handle to the same chunks.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Create an empty pool.
    ///
    /// # Arguments
    /// * `chunk_size` - Size of each buffer in bytes
    /// * `max_chunks` - Upper bound on allocated chunks (`None` = grow forever)
    /// * `policy` - Behaviour of [`rent`](Self::rent) once the bound is hit
    pub fn new(chunk_size: usize, max_chunks: Option<usize>, policy: ExhaustionPolicy) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                chunk_size,
                max_chunks,
                policy,
                chunks: Mutex::new(Vec::new()),
                available: Notify::new(),
            }),
        }
    }

    /// Rent a buffer without waiting.
    ///
    /// Claims the first free chunk, or allocates a new one if none is free and
    /// the pool is below its cap.
    pub fn try_rent(&self) -> Result<Buffer, BufferError> {
        let mut chunks = self.shared.lock();

        if let Some((index, chunk)) = chunks.iter_mut().enumerate().find(|(_, c)| !c.in_use) {
            chunk.in_use = true;
            let memory = chunk
                .memory
                .take()
                .unwrap_or_else(|| vec![0u8; self.shared.chunk_size].into_boxed_slice());
            return Ok(self.lend(index, memory));
        }

        if let Some(max) = self.shared.max_chunks {
            if chunks.len() >= max {
                return Err(BufferError::Exhausted { max });
            }
        }

        let index = chunks.len();
        chunks.push(Chunk {
            memory: None,
            in_use: true,
        });
        trace!(index, chunk_size = self.shared.chunk_size, "Allocated buffer chunk");
        Ok(self.lend(index, vec![0u8; self.shared.chunk_size].into_boxed_slice()))
    }

    /// Rent a buffer, applying the pool's exhaustion policy.
    pub async fn rent(&self) -> Result<Buffer, BufferError> {
        loop {
            match self.try_rent() {
                Err(BufferError::Exhausted { .. }) if self.shared.policy == ExhaustionPolicy::Wait => {
                    self.shared.available.notified().await;
                }
                result => return result,
            }
        }
    }

    /// Return a buffer to the pool.
    ///
    /// A buffer rented from another pool is handed back to its own pool and
    /// reported as [`BufferError::Foreign`].
    pub fn release(&self, buffer: Buffer) -> Result<(), BufferError> {
        let owned = buffer
            .pool
            .upgrade()
            .is_some_and(|pool| Arc::ptr_eq(&pool, &self.shared));
        drop(buffer);
        if owned {
            Ok(())
        } else {
            Err(BufferError::Foreign)
        }
    }

    /// Size of each buffer.
    pub fn chunk_size(&self) -> usize {
        self.shared.chunk_size
    }

    /// Number of chunks allocated so far.
    pub fn chunk_count(&self) -> usize {
        self.shared.lock().len()
    }

    /// Number of chunks currently rented out.
    pub fn in_use(&self) -> usize {
        self.shared.lock().iter().filter(|c| c.in_use).count()
    }

    fn lend(&self, index: usize, memory: Box<[u8]>) -> Buffer {
        Buffer {
            index,
            memory: Some(memory),
            pool: Arc::downgrade(&self.shared),
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("chunk_size", &self.shared.chunk_size)
            .field("max_chunks", &self.shared.max_chunks)
            .field("policy", &self.shared.policy)
            .finish_non_exhaustive()
    }
}

/// A chunk rented from a [`BufferPool`].
///
/// Dereferences to the full chunk (`chunk_size` bytes). Contents left by a
/// previous renter are not cleared.
pub struct Buffer {
    index: usize,
    memory: Option<Box<[u8]>>,
    pool: Weak<PoolShared>,
}

impl Buffer {
    /// Pool-assigned index of the underlying chunk.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.memory.as_deref().unwrap_or_default()
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.memory.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let (Some(memory), Some(pool)) = (self.memory.take(), self.pool.upgrade()) {
            pool.give_back(self.index, memory);
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("index", &self.index)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    #[test]
    fn test_rent_grows_on_demand() {
        let pool = BufferPool::new(1024, None, ExhaustionPolicy::Reject);
        assert_eq!(pool.chunk_count(), 0);

        let b0 = pool.try_rent().unwrap();
        let b1 = pool.try_rent().unwrap();

        assert_eq!(b0.len(), 1024);
        assert_eq!(b0.index(), 0);
        assert_eq!(b1.index(), 1);
        assert_eq!(pool.chunk_count(), 2);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn test_released_chunk_reused_before_growing() {
        let pool = BufferPool::new(64, None, ExhaustionPolicy::Reject);

        let b0 = pool.try_rent().unwrap();
        let b1 = pool.try_rent().unwrap();
        let b2 = pool.try_rent().unwrap();

        pool.release(b1).unwrap();
        assert_eq!(pool.in_use(), 2);

        // First free chunk wins over a fresh allocation
        let b3 = pool.try_rent().unwrap();
        assert_eq!(b3.index(), 1);
        assert_eq!(pool.chunk_count(), 3);

        drop((b0, b2, b3));
        assert_eq!(pool.in_use(), 0);
        assert_eq!(pool.chunk_count(), 3);
    }

    #[test]
    fn test_outstanding_never_exceeds_unmatched_rents() {
        let pool = BufferPool::new(16, None, ExhaustionPolicy::Reject);
        let mut held = Vec::new();

        for round in 0..5 {
            for _ in 0..3 {
                held.push(pool.try_rent().unwrap());
            }
            // Release two of every three
            for _ in 0..2 {
                let buffer = held.remove(0);
                pool.release(buffer).unwrap();
            }
            assert_eq!(pool.in_use(), held.len());
            assert!(pool.chunk_count() <= held.len() + 2, "round {round}");
        }
    }

    #[test]
    fn test_contents_survive_reuse() {
        let pool = BufferPool::new(8, None, ExhaustionPolicy::Reject);

        let mut buffer = pool.try_rent().unwrap();
        buffer[..5].copy_from_slice(b"hello");
        pool.release(buffer).unwrap();

        let buffer = pool.try_rent().unwrap();
        assert_eq!(&buffer[..5], b"hello");
    }

    #[test]
    fn test_capped_pool_rejects() {
        let pool = BufferPool::new(16, Some(2), ExhaustionPolicy::Reject);

        let _b0 = pool.try_rent().unwrap();
        let b1 = pool.try_rent().unwrap();
        assert_eq!(pool.try_rent().unwrap_err(), BufferError::Exhausted { max: 2 });

        drop(b1);
        assert!(pool.try_rent().is_ok());
    }

    #[tokio::test]
    async fn test_reject_policy_rent_fails_fast() {
        let pool = BufferPool::new(16, Some(1), ExhaustionPolicy::Reject);
        let _held = pool.rent().await.unwrap();

        let err = pool.rent().await.unwrap_err();
        assert_eq!(err, BufferError::Exhausted { max: 1 });
    }

    #[test]
    fn test_wait_policy_wakes_on_release() {
        let pool = BufferPool::new(16, Some(1), ExhaustionPolicy::Wait);
        let held = pool.try_rent().unwrap();

        let mut waiting = task::spawn(pool.rent());
        assert_pending!(waiting.poll());

        pool.release(held).unwrap();
        assert!(waiting.is_woken());
        let buffer = assert_ready_ok!(waiting.poll());
        assert_eq!(buffer.index(), 0);
    }

    #[test]
    fn test_release_foreign_buffer() {
        let pool_a = BufferPool::new(16, None, ExhaustionPolicy::Reject);
        let pool_b = BufferPool::new(16, None, ExhaustionPolicy::Reject);

        let buffer = pool_a.try_rent().unwrap();
        assert_eq!(pool_b.release(buffer), Err(BufferError::Foreign));

        // Still went home to the pool that owns it
        assert_eq!(pool_a.in_use(), 0);
        assert_eq!(pool_b.chunk_count(), 0);
    }

    #[test]
    fn test_buffer_outlives_pool() {
        let pool = BufferPool::new(16, None, ExhaustionPolicy::Reject);
        let mut buffer = pool.try_rent().unwrap();
        drop(pool);

        buffer[0] = 7;
        assert_eq!(buffer[0], 7);
    }

    #[test]
    fn test_concurrent_renters_get_distinct_chunks() {
        let pool = BufferPool::new(32, None, ExhaustionPolicy::Reject);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || (0..16).map(|_| pool.try_rent().unwrap()).collect::<Vec<_>>())
            })
            .collect();

        // Every buffer is still held, so no two renters may share a chunk
        let held: Vec<Buffer> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let mut indices: Vec<usize> = held.iter().map(Buffer::index).collect();
        indices.sort_unstable();
        indices.dedup();

        assert_eq!(indices.len(), 128);
        assert_eq!(pool.in_use(), 128);
        assert_eq!(pool.chunk_count(), 128);
    }
}
