//! Shared fixed-size byte-buffer pool.
//!
//! A free list of 32 KiB buffers amortizes allocation on the request path,
//! mainly for buffering request bodies when retries are enabled. Buffers
//! that grew past the slab size are dropped instead of returned.

use std::sync::Mutex;

pub const BUFFER_SIZE: usize = 32 * 1024;

const DEFAULT_MAX_POOLED: usize = 64;

pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_POOLED)
    }

    pub fn with_capacity(max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    /// Take an empty buffer with at least [`BUFFER_SIZE`] capacity.
    pub fn get(&self) -> Vec<u8> {
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        free.pop()
            .unwrap_or_else(|| Vec::with_capacity(BUFFER_SIZE))
    }

    /// Return a buffer to the free list.
    pub fn put(&self, mut buf: Vec<u8>) {
        if buf.capacity() > BUFFER_SIZE {
            return;
        }
        buf.clear();
        let mut free = self.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
