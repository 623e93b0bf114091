//! Buffer pool for composed frames.
//!
//! Every frame the engine originates is built in a pooled buffer and handed
//! to the transport. Buffers return to the pool when dropped, so every exit
//! path, including error paths, gives the buffer back.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use object_pool::Pool;

/// Default buffer size for pooled allocations (32KB).
///
/// Large enough for one payload chunk plus the frame header; bigger payloads
/// are split across chunks rather than grown in place.
const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Default pool capacity (number of buffers retained).
const DEFAULT_POOL_CAPACITY: usize = 64;

/// A pool of reusable send buffers.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Pool<Vec<u8>>>,
    buffer_size: usize,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .finish_non_exhaustive()
    }
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY, DEFAULT_BUFFER_SIZE)
    }

    /// Create a pool with a custom buffer count and per-buffer size.
    pub fn with_capacity(capacity: usize, buffer_size: usize) -> Self {
        let pool = Pool::new(capacity, move || Vec::with_capacity(buffer_size));
        Self {
            pool: Arc::new(pool),
            buffer_size,
        }
    }

    /// Allocate a buffer.
    ///
    /// The buffer is empty but pre-sized; it returns to the pool on drop.
    pub fn get(&self) -> PooledBuf {
        let mut buf = self.pool.pull_owned(|| Vec::with_capacity(self.buffer_size));
        // Returned buffers keep whatever the previous user wrote.
        buf.clear();
        PooledBuf { inner: buf }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A pooled buffer that returns to its pool when dropped.
pub struct PooledBuf {
    inner: object_pool::ReusableOwned<Vec<u8>>,
}

impl PooledBuf {
    /// Copy `data` into a fresh buffer from `pool`.
    pub fn from_slice(pool: &BufferPool, data: &[u8]) -> Self {
        let mut buf = pool.get();
        buf.extend_from_slice(data);
        buf
    }

    /// Convert into `Bytes` without copying.
    ///
    /// The underlying buffer returns to the pool once every `Bytes` clone is
    /// dropped.
    pub fn into_bytes(self) -> bytes::Bytes {
        bytes::Bytes::from_owner(self)
    }
}

impl Deref for PooledBuf {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        self.inner.as_slice()
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.inner.len())
            .field("capacity", &self.inner.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_empty_buffer() {
        let pool = BufferPool::new();
        let mut buf = pool.get();
        assert_eq!(buf.len(), 0);
        assert!(buf.capacity() >= DEFAULT_BUFFER_SIZE);

        buf.extend_from_slice(b"hello world");
        assert_eq!(&buf[..], b"hello world");
    }

    #[test]
    fn reused_buffer_is_cleared() {
        let pool = BufferPool::with_capacity(1, 128);
        {
            let mut buf = pool.get();
            buf.extend_from_slice(b"stale data");
        }
        let buf = pool.get();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn from_slice_copies() {
        let pool = BufferPool::new();
        let buf = PooledBuf::from_slice(&pool, b"payload");
        assert_eq!(&buf[..], b"payload");
    }

    #[test]
    fn into_bytes_is_zero_copy() {
        let pool = BufferPool::new();
        let mut buf = pool.get();
        buf.extend_from_slice(b"abc");
        let bytes = buf.into_bytes();
        let again = bytes.clone();
        assert_eq!(&bytes[..], b"abc");
        assert_eq!(bytes.as_ptr(), again.as_ptr());
    }
}
