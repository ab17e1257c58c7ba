//! Reusable byte buffer pool.
//!
//! The outgoing byte stream and the inbound frame assembler churn through
//! short-lived buffers on every socket event. Instead of allocating each
//! time, buffers are drawn from a pool and returned to it on drop.
//!
//! The pool is single-threaded by contract: all connections of a runtime
//! instance run on one thread, so the handle is a cheap `Rc` clone and no
//! locking is involved.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

/// Upper bound on buffers retained per pool; beyond this, dropped buffers
/// are simply freed.
const MAX_FREE_BUFFERS: usize = 64;

struct PoolInner {
    free: Vec<Vec<u8>>,
}

/// A shared pool of reusable byte buffers.
///
/// Cloning the pool clones the handle, not the storage.
#[derive(Clone)]
pub struct BufferPool {
    inner: Rc<RefCell<PoolInner>>,
}

impl BufferPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(PoolInner { free: Vec::new() })),
        }
    }

    /// Take a buffer with at least `capacity` bytes of capacity.
    ///
    /// The returned buffer is empty (`len() == 0`); it returns itself to
    /// the pool when dropped.
    pub fn take(&self, capacity: usize) -> PooledBuffer {
        let mut inner = self.inner.borrow_mut();
        let data = match inner.free.iter().position(|b| b.capacity() >= capacity) {
            Some(idx) => inner.free.swap_remove(idx),
            None => Vec::with_capacity(capacity),
        };
        PooledBuffer {
            data,
            pool: Rc::downgrade(&self.inner),
        }
    }

    /// Take a buffer initialized with a copy of `src`.
    pub fn take_from(&self, src: &[u8]) -> PooledBuffer {
        let mut buf = self.take(src.len());
        buf.extend_from_slice(src);
        buf
    }

    /// Number of buffers currently parked in the pool.
    pub fn free_count(&self) -> usize {
        self.inner.borrow().free.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// An owned byte buffer that returns to its pool on drop.
///
/// Dereferences to `Vec<u8>` for writing and slicing.
pub struct PooledBuffer {
    data: Vec<u8>,
    pool: std::rc::Weak<RefCell<PoolInner>>,
}

impl PooledBuffer {
    /// Detach the underlying storage from the pool.
    pub fn into_vec(mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .field("capacity", &self.data.capacity())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if self.data.capacity() == 0 {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            let mut inner = pool.borrow_mut();
            if inner.free.len() < MAX_FREE_BUFFERS {
                let mut data = std::mem::take(&mut self.data);
                data.clear();
                inner.free.push(data);
            }
        }
    }
}
