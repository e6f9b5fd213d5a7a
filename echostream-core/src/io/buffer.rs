//! Pooled network buffers with recycle-once accounting.
//!
//! Input buffers are handed to the per-channel deserializers and must go
//! back to the pool exactly once. The pool tracks outstanding handles so a
//! leak shows up as a non-zero count rather than silent memory growth.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Source of network buffers for one task.
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Maximum payload size of buffers cut from this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Handles acquired and not yet recycled.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Acquire an empty buffer.
    pub fn request_buffer(self: &Arc<Self>) -> NetworkBuffer {
        self.request_buffer_with(Vec::with_capacity(self.buffer_size))
    }

    /// Acquire a buffer pre-filled with `data`.
    pub fn request_buffer_with(self: &Arc<Self>, data: Vec<u8>) -> NetworkBuffer {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        NetworkBuffer {
            data,
            pool: Arc::clone(self),
            recycled: false,
        }
    }
}

/// One pooled buffer. Must be recycled exactly once; dropping an
/// un-recycled buffer is reported as a leak and never returns the slot.
#[derive(Debug)]
pub struct NetworkBuffer {
    data: Vec<u8>,
    pool: Arc<BufferPool>,
    recycled: bool,
}

impl NetworkBuffer {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_recycled(&self) -> bool {
        self.recycled
    }

    /// Return the buffer to the pool.
    ///
    /// A second call is a no-op: the slot was already given back and must
    /// not be double counted.
    pub fn recycle(&mut self) {
        if self.recycled {
            return;
        }
        self.recycled = true;
        self.data.clear();
        self.pool.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for NetworkBuffer {
    fn drop(&mut self) {
        if !self.recycled {
            tracing::warn!("network buffer dropped without recycle ({} bytes)", self.data.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recycle_returns_slot_once() {
        let pool = BufferPool::new(1024);
        let mut buffer = pool.request_buffer_with(vec![1, 2, 3]);
        assert_eq!(pool.outstanding(), 1);

        buffer.recycle();
        assert!(buffer.is_recycled());
        assert_eq!(pool.outstanding(), 0);

        // Second recycle must not double count.
        buffer.recycle();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_dropped_buffer_counts_as_leak() {
        let pool = BufferPool::new(1024);
        {
            let _buffer = pool.request_buffer();
        }
        // The slot was never returned; the pool still reports it outstanding.
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_buffer_exposes_payload() {
        let pool = BufferPool::new(16);
        let mut buffer = pool.request_buffer_with(vec![9, 8]);
        assert_eq!(buffer.data(), &[9, 8]);
        assert_eq!(buffer.len(), 2);
        buffer.recycle();
    }
}
