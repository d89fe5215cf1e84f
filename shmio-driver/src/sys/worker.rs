//! The worker driver: a shared submission queue drained by worker backends
//! that execute the I/O synchronously.
//!
//! This is the portable fallback and the default. Submitting backends push
//! chain heads onto a bounded queue and wake a worker; the worker resolves
//! the target file from its tag (descriptors do not travel between
//! backends), performs the I/O, and completes the op in place — shared
//! callbacks run in the worker, results route back to the initiator through
//! the foreign-completed path.
//!
//! Two cases bypass the queue and run in the submitting backend itself: a
//! single staged op the caller is about to wait on (the round trip through a
//! worker would only add latency), and any op whose memory is not shared
//! (a worker cannot reach the caller's private buffers).

use std::{
    collections::VecDeque,
    fs::File,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use shmio_log::{trace, warn};

use crate::{
    handle::IoHandle,
    op::{FileTag, Op, RawFd},
    registry::AioRegistry,
    slot::IoFlags,
    sys, AioConfig,
};

const IDLE_POLL: Duration = Duration::from_millis(100);
const BLOCK_POLL: Duration = Duration::from_millis(10);

pub(crate) struct Driver {
    queue: Mutex<VecDeque<u32>>,
    capacity: usize,
    workers: usize,
    not_empty: Condvar,
    not_full: Condvar,
    stop: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Per-backend count of ops handed to workers and not yet kernel-complete.
    /// Barrier-like ops wait for this, not for the dispatch-side inflight
    /// gauge: an op that is reaped but not yet dispatched is already ordered.
    handed_off: Box<[std::sync::atomic::AtomicU64]>,
}

impl Driver {
    pub fn new(config: &AioConfig) -> io::Result<Self> {
        Ok(Self {
            queue: Mutex::new(VecDeque::with_capacity(config.worker_queue_size)),
            capacity: config.worker_queue_size,
            workers: config.workers,
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            stop: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            handed_off: (0..config.max_backends)
                .map(|_| std::sync::atomic::AtomicU64::new(0))
                .collect(),
        })
    }

    pub fn start(&self, registry: &Arc<AioRegistry>) -> io::Result<()> {
        let mut threads = self.threads.lock();
        for n in 0..self.workers {
            let registry = registry.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("shmio-worker-{n}"))
                    .spawn(move || worker_main(registry))?,
            );
        }
        Ok(())
    }

    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        self.not_empty.notify_all();
        self.not_full.notify_all();
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            let _ = thread.join();
        }
    }

    pub fn submit(
        &self,
        registry: &AioRegistry,
        backend: u32,
        heads: &[u32],
        will_wait: bool,
    ) -> io::Result<usize> {
        for &head in heads {
            sys::mark_inflight(registry, head);
            let no_reorder = registry.slot(head).data().op.no_reorder();
            let run_here = self.workers == 0
                || (will_wait && heads.len() == 1)
                || no_reorder
                || !chain_memory_shared(registry, head);
            if run_here {
                if no_reorder {
                    // Everything we handed to workers must be kernel-complete
                    // before a barrier-like op executes.
                    self.settle_handed_off(registry, backend);
                }
                registry.backends[backend as usize]
                    .stats
                    .synchronous
                    .fetch_add(1, Ordering::Relaxed);
                let call = snapshot_chain(registry, head);
                let result = execute_local(&call);
                sys::mark_reaped(registry, backend, head, result);
            } else {
                self.handed_off[backend as usize].fetch_add(1, Ordering::AcqRel);
                let mut queue = self.queue.lock();
                while queue.len() >= self.capacity {
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                    self.not_full.wait_for(&mut queue, IDLE_POLL);
                }
                queue.push_back(head);
                drop(queue);
                self.not_empty.notify_one();
            }
        }
        Ok(heads.len())
    }

    fn settle_handed_off(&self, registry: &AioRegistry, backend: u32) {
        while self.handed_off[backend as usize].load(Ordering::Acquire) > 0 {
            registry.io_signal.wait(BLOCK_POLL);
        }
    }

    pub fn drain(&self, registry: &AioRegistry, _backend: u32, block: bool) -> usize {
        // Workers complete in place; there is no completion queue to pump.
        // A blocking drain parks on the group-wide completion pulse.
        if block {
            registry.io_signal.wait(BLOCK_POLL);
        }
        0
    }

    pub fn wait_one(
        &self,
        registry: &AioRegistry,
        _backend: u32,
        handle: IoHandle,
        timeout: Duration,
    ) {
        if let Some(slot) = registry.deref_handle(handle) {
            slot.wait_until(Some(timeout), |s| {
                s.generation() != handle.generation() || !s.flags().contains(IoFlags::INFLIGHT)
            });
        }
    }
}

fn worker_main(registry: Arc<AioRegistry>) {
    let backend = match registry.attach() {
        Ok(backend) => backend,
        Err(e) => {
            warn!("worker could not attach: {e}");
            return;
        }
    };
    let sys::Driver::Worker(driver) = &registry.driver else {
        unreachable!("worker thread without worker driver")
    };
    trace!("worker backend {} running", backend.id());
    // Lazily opened descriptor, one entry: WAL traffic hits the same segment
    // over and over, everything else re-opens.
    let mut cached: Option<(FileTag, File)> = None;
    loop {
        let head = {
            let mut queue = driver.queue.lock();
            loop {
                if let Some(head) = queue.pop_front() {
                    driver.not_full.notify_one();
                    break Some(head);
                }
                if driver.stop.load(Ordering::Acquire) {
                    break None;
                }
                driver.not_empty.wait_for(&mut queue, IDLE_POLL);
            }
        };
        let Some(head) = head else {
            break;
        };
        let initiator = registry.slot(head).owner();
        let call = snapshot_chain(&registry, head);
        let result = execute_remote(&registry, &call, &mut cached);
        sys::mark_reaped(&registry, backend.id(), head, result);
        driver.handed_off[initiator as usize].fetch_sub(1, Ordering::AcqRel);
        registry.io_signal.notify();
        // Run the shared callbacks right here; the results route back to the
        // initiators through their completion lists.
        backend.drain(false);
    }
    backend.drain(false);
    if let Err(e) = backend.close() {
        warn!("worker close failed: {e}");
    }
}

/// A chain flattened into one kernel call.
struct ChainCall {
    tag: FileTag,
    fd: RawFd,
    kind: CallKind,
    no_reorder: bool,
}

enum CallKind {
    Nop,
    Fsync { datasync: bool },
    FlushRange { offset: u64, len: u64 },
    Read { offset: u64, parts: Vec<(usize, usize)> },
    Write { offset: u64, parts: Vec<(usize, usize)> },
}

fn snapshot_chain(registry: &AioRegistry, head: u32) -> ChainCall {
    let members = sys::chain_members(registry, head);
    let head_data = registry.slot(head).data();
    let no_reorder = head_data.op.no_reorder();
    let (tag, fd) = head_data
        .op
        .target()
        .map(|t| (t.tag(), t.fd()))
        .unwrap_or((FileTag(0), invalid_fd()));
    let kind = match &head_data.op {
        Op::Nop => CallKind::Nop,
        Op::Fsync(f) | Op::FsyncWal(f) => CallKind::Fsync {
            datasync: f.datasync,
        },
        Op::FlushRange(f) => CallKind::FlushRange {
            offset: f.offset,
            len: f.len,
        },
        op => {
            let write = op.is_write();
            let (offset, _) = op.transfer().expect("chain head without transfer").view();
            drop(head_data);
            let mut parts = Vec::with_capacity(members.len());
            for &member in &members {
                let data = registry.slot(member).data();
                let (_, view) = data.op.transfer().expect("merged non-transfer op").view();
                parts.push((view.as_ptr() as usize, view.len()));
            }
            return ChainCall {
                tag,
                fd,
                kind: if write {
                    CallKind::Write { offset, parts }
                } else {
                    CallKind::Read { offset, parts }
                },
                no_reorder,
            };
        }
    };
    ChainCall {
        tag,
        fd,
        kind,
        no_reorder,
    }
}

fn chain_memory_shared(registry: &AioRegistry, head: u32) -> bool {
    sys::chain_members(registry, head).iter().all(|&member| {
        registry
            .slot(member)
            .data()
            .op
            .transfer()
            .map(|t| t.buf.is_shared())
            .unwrap_or(true)
    })
}

fn invalid_fd() -> RawFd {
    -1
}

/// Execute in the submitting backend, on the descriptor captured at prepare
/// time.
#[cfg(unix)]
fn execute_local(call: &ChainCall) -> i64 {
    perform(call, call.fd)
}

/// Execute in the submitting backend, on the handle captured at prepare
/// time. The handle is borrowed, never closed.
#[cfg(windows)]
fn execute_local(call: &ChainCall) -> i64 {
    use std::os::windows::io::FromRawHandle;
    let file = std::mem::ManuallyDrop::new(unsafe { File::from_raw_handle(call.fd as _) });
    perform(call, &file)
}

/// Execute in a worker backend, resolving the descriptor from the tag.
fn execute_remote(
    registry: &AioRegistry,
    call: &ChainCall,
    cached: &mut Option<(FileTag, File)>,
) -> i64 {
    if matches!(call.kind, CallKind::Nop) {
        return 0;
    }
    if cached.as_ref().map(|(tag, _)| *tag) != Some(call.tag) {
        match registry.reopen.reopen(call.tag) {
            Ok(file) => *cached = Some((call.tag, file)),
            Err(e) => {
                warn!("worker could not open {:?}: {e}", call.tag);
                return -(e.raw_os_error().unwrap_or(5) as i64);
            }
        }
    }
    perform_on(call, &cached.as_ref().unwrap().1)
}

#[cfg(unix)]
fn perform_on(call: &ChainCall, file: &File) -> i64 {
    use std::os::fd::AsRawFd;
    perform(call, file.as_raw_fd())
}

#[cfg(windows)]
fn perform_on(call: &ChainCall, file: &File) -> i64 {
    perform(call, file)
}

#[cfg(unix)]
fn errno() -> i64 {
    -(io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) as i64)
}

#[cfg(datasync)]
fn sync_file(fd: RawFd, datasync: bool) -> libc::c_int {
    if datasync {
        unsafe { libc::fdatasync(fd) }
    } else {
        unsafe { libc::fsync(fd) }
    }
}

#[cfg(all(unix, not(datasync)))]
fn sync_file(fd: RawFd, _datasync: bool) -> libc::c_int {
    unsafe { libc::fsync(fd) }
}

#[cfg(target_os = "linux")]
fn flush_file_range(fd: RawFd, offset: u64, len: u64) -> i64 {
    let res = unsafe {
        libc::sync_file_range(
            fd,
            offset as libc::off64_t,
            len as libc::off64_t,
            libc::SYNC_FILE_RANGE_WRITE,
        )
    };
    if res < 0 {
        let err = errno();
        // A writeback hint on a filesystem that cannot take one is not a
        // failed I/O.
        if err == -(libc::EOPNOTSUPP as i64) || err == -(libc::ENOSYS as i64) {
            return 0;
        }
        return err;
    }
    0
}

// No asynchronous writeback hint elsewhere.
#[cfg(all(unix, not(target_os = "linux")))]
fn flush_file_range(_fd: RawFd, _offset: u64, _len: u64) -> i64 {
    0
}

#[cfg(unix)]
fn perform(call: &ChainCall, fd: RawFd) -> i64 {
    match &call.kind {
        CallKind::Nop => 0,
        CallKind::Fsync { datasync } => {
            let res = sync_file(fd, *datasync);
            if res < 0 { errno() } else { 0 }
        }
        CallKind::FlushRange { offset, len } => flush_file_range(fd, *offset, *len),
        CallKind::Read { offset, parts } => {
            let iovs: Vec<libc::iovec> = parts
                .iter()
                .map(|&(ptr, len)| libc::iovec {
                    iov_base: ptr as *mut libc::c_void,
                    iov_len: len,
                })
                .collect();
            let res = unsafe {
                libc::preadv(fd, iovs.as_ptr(), iovs.len() as libc::c_int, *offset as libc::off_t)
            };
            if res < 0 { errno() } else { res as i64 }
        }
        CallKind::Write { offset, parts } => {
            let iovs: Vec<libc::iovec> = parts
                .iter()
                .map(|&(ptr, len)| libc::iovec {
                    iov_base: ptr as *mut libc::c_void,
                    iov_len: len,
                })
                .collect();
            let res = unsafe {
                libc::pwritev(fd, iovs.as_ptr(), iovs.len() as libc::c_int, *offset as libc::off_t)
            };
            if res < 0 { errno() } else { res as i64 }
        }
    }
}

#[cfg(windows)]
fn perform(call: &ChainCall, file: &File) -> i64 {
    use std::os::windows::fs::FileExt;

    fn errno(e: &io::Error) -> i64 {
        -(e.raw_os_error().unwrap_or(5) as i64)
    }

    match &call.kind {
        CallKind::Nop => 0,
        CallKind::Fsync { datasync } => {
            let res = if *datasync {
                file.sync_data()
            } else {
                file.sync_all()
            };
            match res {
                Ok(()) => 0,
                Err(e) => errno(&e),
            }
        }
        // No writeback hint on this platform.
        CallKind::FlushRange { .. } => 0,
        CallKind::Read { offset, parts } => {
            let mut total = 0i64;
            let mut at = *offset;
            for &(ptr, len) in parts {
                let buf = unsafe { std::slice::from_raw_parts_mut(ptr as *mut u8, len) };
                match file.seek_read(buf, at) {
                    Ok(n) => {
                        total += n as i64;
                        at += n as u64;
                        if n < len {
                            break;
                        }
                    }
                    Err(e) => return if total > 0 { total } else { errno(&e) },
                }
            }
            total
        }
        CallKind::Write { offset, parts } => {
            let mut total = 0i64;
            let mut at = *offset;
            for &(ptr, len) in parts {
                let buf = unsafe { std::slice::from_raw_parts(ptr as *const u8, len) };
                match file.seek_write(buf, at) {
                    Ok(n) => {
                        total += n as i64;
                        at += n as u64;
                        if n < len {
                            break;
                        }
                    }
                    Err(e) => return if total > 0 { total } else { errno(&e) },
                }
            }
            total
        }
    }
}
