//! Fixed-size relay buffer pool
//!
//! Pre-allocated buffers with lock-free acquire/release so steady-state
//! relaying does not allocate. All buffers share the configured relay
//! read size.

use crossbeam::queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::metrics::METRICS;

/// A buffer checked out of the pool; returns itself on drop.
pub struct Buffer {
    data: Box<[u8]>,
    pool: Arc<BufferPoolInner>,
}

impl Buffer {
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let data = std::mem::replace(&mut self.data, Box::new([]));
        self.pool.return_buffer(data);
    }
}

struct BufferPoolInner {
    buffers: ArrayQueue<Box<[u8]>>,
    buffer_size: usize,
    in_use: AtomicUsize,
}

impl BufferPoolInner {
    fn return_buffer(&self, data: Box<[u8]>) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        METRICS.buffer_released();
        let _ = self.buffers.push(data);
    }
}

/// Lock-free pool of relay read buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `buffer_size` bytes each.
    pub fn new(count: usize, buffer_size: usize) -> Self {
        let inner = BufferPoolInner {
            buffers: ArrayQueue::new(count.max(1)),
            buffer_size,
            in_use: AtomicUsize::new(0),
        };

        for _ in 0..count {
            let buf = vec![0u8; buffer_size].into_boxed_slice();
            let _ = inner.buffers.push(buf);
        }

        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Acquire a buffer, allocating a fresh one if the pool ran dry.
    pub fn acquire(&self) -> Buffer {
        let data = self.inner.buffers.pop().unwrap_or_else(|| {
            METRICS.buffer_miss();
            vec![0u8; self.inner.buffer_size].into_boxed_slice()
        });

        self.inner.in_use.fetch_add(1, Ordering::Relaxed);
        METRICS.buffer_acquired();
        Buffer {
            data,
            pool: self.inner.clone(),
        }
    }

    /// Number of buffers currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Relaxed)
    }
}
