//! Fixed pool of chunk-sized buffers.
//!
//! The pool doubles as the upload concurrency limit: a transfer may only
//! start once it holds a buffer, so at most `capacity` transfers run at a
//! time and memory stays at `capacity * buffer_size`.

use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex},
};

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<Inner>,
}

struct Inner {
    permits: Arc<Semaphore>,
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        assert!(capacity > 0, "buffer pool needs at least one buffer");

        Self {
            inner: Arc::new(Inner {
                permits: Arc::new(Semaphore::new(capacity)),
                free: Mutex::new(Vec::with_capacity(capacity)),
                buffer_size,
            }),
        }
    }

    /// Buffers not currently handed out.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Waits until a buffer is free. Buffers are allocated lazily and
    /// recycled afterwards.
    pub async fn acquire(&self) -> Result<PooledBuffer, AcquireError> {
        let permit = self.inner.permits.clone().acquire_owned().await?;
        let buf = self
            .inner
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buffer_size]);

        Ok(PooledBuffer {
            buf,
            pool: self.inner.clone(),
            _permit: permit,
        })
    }
}

/// A buffer on loan from a [`BufferPool`]. Returned on drop.
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.pool
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(buf);
    }
}
