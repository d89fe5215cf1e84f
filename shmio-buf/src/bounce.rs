use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{AlignedBuf, IoPtr};

/// A refcounted, page-aligned buffer from the shared bounce pool.
///
/// Bounce buffers back I/O whose natural memory is unsuitable for the chosen
/// driver (caller-private memory with the worker driver, unaligned memory
/// with direct I/O). The buffer itself never moves; the pool hands out
/// indices and tracks free ones. A reference is held by the slot that owns
/// the buffer and by any external holder that called [`BounceBuffer::retain`].
pub struct BounceBuffer {
    refs: AtomicUsize,
    buf: AlignedBuf,
}

impl BounceBuffer {
    /// Allocate one pool entry of `len` bytes with a zero refcount.
    pub fn new(len: usize) -> Self {
        Self {
            refs: AtomicUsize::new(0),
            buf: AlignedBuf::new(len),
        }
    }

    /// Reset the refcount to one when the buffer leaves the free list.
    pub fn activate(&self) {
        debug_assert_eq!(self.refs.load(Ordering::Relaxed), 0);
        self.refs.store(1, Ordering::Release);
    }

    /// Take an additional reference.
    pub fn retain(&self) {
        let prev = self.refs.fetch_add(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "retain on a free bounce buffer");
    }

    /// Drop one reference; returns true when the buffer became free and must
    /// go back on the pool free list.
    pub fn release(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "release on a free bounce buffer");
        prev == 1
    }

    /// Current reference count.
    pub fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// An [`IoPtr`] over the whole buffer. Bounce memory is always shared.
    pub fn io_ptr(&self) -> IoPtr {
        // SAFETY: the pool owns the allocation for the registry lifetime.
        unsafe { IoPtr::new_shared(self.buf.as_ptr(), self.buf.len()) }
    }

    /// The buffer length in bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer is empty. Always false.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcount_round_trip() {
        let bb = BounceBuffer::new(4096);
        bb.activate();
        bb.retain();
        assert_eq!(bb.refs(), 2);
        assert!(!bb.release());
        assert!(bb.release());
        assert_eq!(bb.refs(), 0);
    }

    #[test]
    fn io_ptr_is_shared() {
        let bb = BounceBuffer::new(4096);
        bb.activate();
        let ptr = bb.io_ptr();
        assert!(ptr.is_shared());
        assert_eq!(ptr.len(), 4096);
        bb.release();
    }
}
