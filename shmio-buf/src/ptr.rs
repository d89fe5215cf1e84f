use std::fmt;

use crate::AlignedBuf;

/// An unowned address range handed to a kernel driver.
///
/// The slot table stores these instead of borrows: the initiating backend, the
/// kernel, and the completing backend may all live in different processes, so
/// the engine cannot express the buffer lifetime through references. The
/// `shared` attribute records whether the range lies in memory every
/// cooperating backend can reach; drivers that execute I/O in another backend
/// (the worker driver) refuse non-shared ranges and fall back to the caller.
#[derive(Clone, Copy)]
pub struct IoPtr {
    ptr: *mut u8,
    len: usize,
    shared: bool,
}

impl IoPtr {
    /// Create a pointer to caller-private memory.
    ///
    /// # Safety
    ///
    /// `ptr..ptr + len` must stay valid and unaliased for writes until the
    /// operation referring to it completes or its slot is recycled.
    pub unsafe fn new(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr,
            len,
            shared: false,
        }
    }

    /// Create a pointer into memory reachable by every cooperating backend.
    ///
    /// # Safety
    ///
    /// Same contract as [`IoPtr::new`], plus the range must actually be
    /// shared; a worker backend will dereference it.
    pub unsafe fn new_shared(ptr: *mut u8, len: usize) -> Self {
        Self {
            ptr,
            len,
            shared: true,
        }
    }

    /// Point at an [`AlignedBuf`], private variant.
    ///
    /// The buffer must outlive the operation; the engine does not hold it.
    pub fn of_buf(buf: &AlignedBuf) -> Self {
        unsafe { Self::new(buf.as_ptr(), buf.len()) }
    }

    /// The start address.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// The range length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether every cooperating backend can dereference the range.
    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// The first address past the range; used for adjacency checks when
    /// fusing operations.
    pub fn end(&self) -> usize {
        self.ptr as usize + self.len
    }

    /// A sub-range starting `offset` bytes in.
    ///
    /// # Panics
    ///
    /// Panics if `offset > len`.
    pub fn advanced(&self, offset: usize) -> Self {
        assert!(offset <= self.len);
        Self {
            ptr: unsafe { self.ptr.add(offset) },
            len: self.len - offset,
            shared: self.shared,
        }
    }

    /// View the range as a byte slice.
    ///
    /// # Safety
    ///
    /// The range must currently be valid and not concurrently written.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    /// View the range as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The range must currently be valid and not otherwise aliased.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_slice_mut(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }
}

impl fmt::Debug for IoPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IoPtr({:p}+{}{})",
            self.ptr,
            self.len,
            if self.shared { ", shared" } else { "" }
        )
    }
}

// SAFETY: IoPtr is an address, not an access; every dereference site carries
// its own safety obligation.
unsafe impl Send for IoPtr {}
unsafe impl Sync for IoPtr {}
