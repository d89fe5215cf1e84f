//! The Linux ring driver.
//!
//! K independent ring contexts live in the registry; any backend may submit
//! to or drain any of them. Each context pairs its ring with two locks: the
//! submission lock covers the submission queue and the submission-side iovec
//! freelist, the completion lock covers the completion queue and the
//! reaped-side iovec freelist. When the submission side runs out of iovec
//! arrays it briefly takes the completion lock and moves the reaped ones
//! over.

use std::{cell::UnsafeCell, io, ptr, sync::atomic::Ordering, time::Duration};

use io_uring::{
    opcode,
    squeue,
    types::{Fd, FsyncFlags, SubmitArgs, Timespec},
    IoUring,
};
use parking_lot::{Mutex, MutexGuard};
use shmio_log::trace;

use crate::{
    backend::{BackendState, COMBINE_LIMIT},
    handle::IoHandle,
    op::Op,
    registry::AioRegistry,
    slot::IoFlags,
    sys, AioConfig,
};

/// Whether the host kernel offers rings at all.
pub(crate) fn available() -> bool {
    IoUring::new(2).is_ok()
}

/// One fixed iovec array, loaned to one kernel entry at a time.
struct IovecArray(UnsafeCell<[libc::iovec; COMBINE_LIMIT]>);

// SAFETY: an array is referenced either by the submission path (under the
// submission lock, before the entry is pushed) or by the kernel (until the
// completion is reaped under the completion lock); the freelists hand each
// array to one holder at a time.
unsafe impl Send for IovecArray {}
unsafe impl Sync for IovecArray {}

impl IovecArray {
    fn new() -> Self {
        Self(UnsafeCell::new(
            [libc::iovec {
                iov_base: ptr::null_mut(),
                iov_len: 0,
            }; COMBINE_LIMIT],
        ))
    }
}

struct SubmissionSide {
    free_iovecs: Vec<u32>,
}

struct CompletionSide {
    reaped_iovecs: Vec<u32>,
}

struct RingContext {
    ring: IoUring,
    iovec_arrays: Box<[IovecArray]>,
    submission: Mutex<SubmissionSide>,
    completion: Mutex<CompletionSide>,
}

pub(crate) struct Driver {
    contexts: Box<[RingContext]>,
}

impl Driver {
    pub fn new(config: &AioConfig) -> io::Result<Self> {
        let contexts = (0..config.ring_contexts.max(1))
            .map(|_| {
                let ring = IoUring::builder().build(config.max_in_flight as u32)?;
                Ok(RingContext {
                    ring,
                    iovec_arrays: (0..config.max_in_flight).map(|_| IovecArray::new()).collect(),
                    submission: Mutex::new(SubmissionSide {
                        free_iovecs: (0..config.max_in_flight as u32).collect(),
                    }),
                    completion: Mutex::new(CompletionSide {
                        reaped_iovecs: Vec::new(),
                    }),
                })
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self {
            contexts: contexts.into_boxed_slice(),
        })
    }

    /// Pick a context: start past the backend's last-used one and probe each
    /// without blocking; only when all are contended, block on the next.
    fn select_context(&self, state: &BackendState) -> (usize, MutexGuard<'_, SubmissionSide>) {
        let count = self.contexts.len();
        let last = state.last_context.load(Ordering::Relaxed) as usize % count;
        for step in 0..count {
            let index = (last + step) % count;
            if let Some(guard) = self.contexts[index].submission.try_lock() {
                state.last_context.store(index as u32, Ordering::Relaxed);
                return (index, guard);
            }
        }
        let index = (last + 1) % count;
        let guard = self.contexts[index].submission.lock();
        state.last_context.store(index as u32, Ordering::Relaxed);
        (index, guard)
    }

    fn take_iovec_array(
        &self,
        context: usize,
        submission: &mut SubmissionSide,
    ) -> u32 {
        if submission.free_iovecs.is_empty() {
            // Low water: pull back what completions have released.
            let mut completion = self.contexts[context].completion.lock();
            submission
                .free_iovecs
                .append(&mut completion.reaped_iovecs);
        }
        // One array exists per possible kernel entry, so a full submission
        // queue frees arrays before this can run dry.
        submission
            .free_iovecs
            .pop()
            .expect("iovec pool exhausted with submission queue room")
    }

    pub fn submit(
        &self,
        registry: &AioRegistry,
        backend: u32,
        heads: &[u32],
        _will_wait: bool,
    ) -> io::Result<usize> {
        let state = &registry.backends[backend as usize];
        let (context, mut submission) = self.select_context(state);
        let ctx = &self.contexts[context];
        for &head in heads {
            let entry = self.build_entry(registry, context, &mut submission, head)?;
            registry.slot(head).set_context(context as u32);
            // The kernel may complete the entry before push returns to us.
            sys::mark_inflight(registry, head);
            // SAFETY: the submission lock serializes access to the queue.
            let mut squeue = unsafe { ctx.ring.submission_shared() };
            loop {
                match unsafe { squeue.push(&entry) } {
                    Ok(()) => {
                        squeue.sync();
                        break;
                    }
                    Err(_) => {
                        drop(squeue);
                        submit_ring(ctx, 0, None)?;
                        // SAFETY: as above.
                        squeue = unsafe { ctx.ring.submission_shared() };
                    }
                }
            }
        }
        drop(submission);
        submit_ring(ctx, 0, None)?;
        trace!("ring context {context}: submitted {} entries", heads.len());
        Ok(heads.len())
    }

    fn build_entry(
        &self,
        registry: &AioRegistry,
        context: usize,
        submission: &mut SubmissionSide,
        head: u32,
    ) -> io::Result<squeue::Entry> {
        let slot = registry.slot(head);
        let members = sys::chain_members(registry, head);
        let data = slot.data();
        let no_reorder = data.op.no_reorder();
        let entry = match &data.op {
            Op::Nop => opcode::Nop::new().build(),
            Op::Fsync(f) | Op::FsyncWal(f) => {
                let mut flags = FsyncFlags::empty();
                if f.datasync {
                    flags |= FsyncFlags::DATASYNC;
                }
                opcode::Fsync::new(Fd(f.target.fd())).flags(flags).build()
            }
            Op::FlushRange(f) => opcode::SyncFileRange::new(Fd(f.target.fd()), f.len as u32)
                .offset(f.offset)
                .flags(libc::SYNC_FILE_RANGE_WRITE as u32)
                .build(),
            op => {
                let transfer = op.transfer().expect("transfer op expected");
                let fd = transfer.target.fd();
                let (offset, _) = transfer.view();
                let write = op.is_write();
                drop(data);
                let array = self.take_iovec_array(context, submission);
                // SAFETY: the array is loaned to this entry only; the
                // submission lock is held.
                let iovs = unsafe { &mut *self.contexts[context].iovec_arrays[array as usize].0.get() };
                for (slot_index, iov) in members.iter().zip(iovs.iter_mut()) {
                    let member = registry.slot(*slot_index).data();
                    let (_, view) = member.op.transfer().expect("merged non-transfer op").view();
                    iov.iov_base = view.as_ptr().cast();
                    iov.iov_len = view.len();
                }
                slot.set_driver_private(array as u64 + 1);
                let iov_ptr = iovs.as_ptr();
                let count = members.len() as u32;
                let entry = if write {
                    opcode::Writev::new(Fd(fd), iov_ptr, count).offset(offset).build()
                } else {
                    opcode::Readv::new(Fd(fd), iov_ptr, count).offset(offset).build()
                };
                return Ok(finish_entry(entry, head, no_reorder));
            }
        };
        drop(data);
        Ok(finish_entry(entry, head, no_reorder))
    }

    pub fn drain(&self, registry: &AioRegistry, backend: u32, block: bool) -> usize {
        let mut reaped = 0;
        for (index, ctx) in self.contexts.iter().enumerate() {
            if let Some(mut completion) = ctx.completion.try_lock() {
                reaped += self.drain_context(registry, backend, index, &mut completion);
            }
        }
        if reaped == 0 && block {
            let state = &registry.backends[backend as usize];
            let index = state.last_context.load(Ordering::Relaxed) as usize % self.contexts.len();
            let ctx = &self.contexts[index];
            let _ = submit_ring(ctx, 1, Some(Duration::from_millis(10)));
            let mut completion = ctx.completion.lock();
            reaped += self.drain_context(registry, backend, index, &mut completion);
        }
        reaped
    }

    fn drain_context(
        &self,
        registry: &AioRegistry,
        backend: u32,
        index: usize,
        completion: &mut CompletionSide,
    ) -> usize {
        let ctx = &self.contexts[index];
        // SAFETY: the completion lock serializes access to the queue.
        let mut cqueue = unsafe { ctx.ring.completion_shared() };
        cqueue.sync();
        let mut reaped = 0;
        for entry in &mut cqueue {
            let head = entry.user_data() as u32;
            let slot = registry.slot(head);
            let array = slot.driver_private();
            if array > 0 {
                completion.reaped_iovecs.push((array - 1) as u32);
                slot.set_driver_private(0);
            }
            sys::mark_reaped(registry, backend, head, entry.result() as i64);
            reaped += 1;
        }
        cqueue.sync();
        if reaped > 0 {
            registry.io_signal.notify();
        }
        reaped
    }

    pub fn wait_one(
        &self,
        registry: &AioRegistry,
        backend: u32,
        handle: IoHandle,
        timeout: Duration,
    ) {
        let Some(slot) = registry.deref_handle(handle) else {
            return;
        };
        if !slot.flags().contains(IoFlags::INFLIGHT) {
            return;
        }
        let index = slot.context() as usize % self.contexts.len();
        let ctx = &self.contexts[index];
        let _ = submit_ring(ctx, 1, Some(timeout));
        let mut completion = ctx.completion.lock();
        self.drain_context(registry, backend, index, &mut completion);
    }
}

fn finish_entry(entry: squeue::Entry, head: u32, no_reorder: bool) -> squeue::Entry {
    let entry = entry.user_data(head as u64);
    if no_reorder {
        // The drain bit keeps later entries in this ring from overtaking.
        entry.flags(squeue::Flags::IO_DRAIN)
    } else {
        entry
    }
}

/// Push staged entries into the kernel, optionally waiting for completions.
/// Transient submit errors are retried.
fn submit_ring(ctx: &RingContext, want: usize, timeout: Option<Duration>) -> io::Result<usize> {
    loop {
        let res = if let Some(timeout) = timeout {
            let timespec = Timespec::new()
                .sec(timeout.as_secs())
                .nsec(timeout.subsec_nanos());
            let args = SubmitArgs::new().timespec(&timespec);
            ctx.ring.submitter().submit_with_args(want, &args)
        } else {
            ctx.ring.submitter().submit_and_wait(want)
        };
        match res {
            Ok(n) => return Ok(n),
            Err(e) if e.raw_os_error() == Some(libc::ETIME) => return Ok(0),
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::EBUSY) | Some(libc::EAGAIN) | Some(libc::EINTR)
                ) =>
            {
                std::thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }
}
