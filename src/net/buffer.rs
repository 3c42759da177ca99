//! Shared pool of envelope capture buffers.
//!
//! # Responsibilities
//! - Hand out byte buffers with single-owner checkout
//! - Take buffers back (cleared, shrunk to their initial capacity) when the
//!   owner drops them
//! - Bound how many idle buffers are retained

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// Pool of reusable capture buffers.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
    initial_capacity: usize,
}

impl BufferPool {
    /// Create a pool retaining at most `max_pooled` idle buffers.
    pub fn new(max_pooled: usize, initial_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            initial_capacity,
        })
    }

    /// Check a buffer out of the pool, allocating if none is idle.
    pub fn checkout(self: &Arc<Self>) -> PooledBuffer {
        let reused = self.free.lock().ok().and_then(|mut free| free.pop());
        let buf = reused.unwrap_or_else(|| Vec::with_capacity(self.initial_capacity));
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle buffers currently retained.
    pub fn idle(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    fn checkin(&self, mut buf: Vec<u8>) {
        buf.clear();
        // A large body must not stay pinned by an idle buffer.
        buf.shrink_to(self.initial_capacity);
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_pooled {
                free.push(buf);
            }
        }
    }
}

/// A buffer checked out of a [`BufferPool`]. Returned on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Detach the bytes from the pool. The buffer is not returned.
    pub fn into_vec(mut self) -> Vec<u8> {
        self.buf.take().unwrap_or_default()
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        // Only `into_vec` and `drop` take the buffer, and both consume self.
        match &self.buf {
            Some(buf) => buf,
            None => unreachable!("pooled buffer accessed after release"),
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        match &mut self.buf {
            Some(buf) => buf,
            None => unreachable!("pooled buffer accessed after release"),
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.checkin(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_returns_to_pool_on_drop() {
        let pool = BufferPool::new(2, 64);
        assert_eq!(pool.idle(), 0);

        let mut buf = pool.checkout();
        buf.extend_from_slice(b"hello");
        drop(buf);
        assert_eq!(pool.idle(), 1);

        let again = pool.checkout();
        assert!(again.is_empty());
        assert!(again.capacity() >= 5);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn pool_retains_at_most_max() {
        let pool = BufferPool::new(1, 8);
        let a = pool.checkout();
        let b = pool.checkout();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn grown_buffer_is_shrunk_on_return() {
        let pool = BufferPool::new(2, 64);
        let mut buf = pool.checkout();
        buf.resize(4 * 1024 * 1024, b'x');
        drop(buf);

        let again = pool.checkout();
        assert!(again.is_empty());
        assert!(again.capacity() < 1024 * 1024, "{}", again.capacity());
    }

    #[test]
    fn into_vec_detaches() {
        let pool = BufferPool::new(4, 8);
        let mut buf = pool.checkout();
        buf.push(7);
        assert_eq!(buf.into_vec(), vec![7]);
        assert_eq!(pool.idle(), 0);
    }
}
