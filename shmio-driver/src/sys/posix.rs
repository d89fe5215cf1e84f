//! The POSIX AIO driver.
//!
//! Every slot owns a kernel control block in a fixed arena. Submission
//! registers the slot in a dense inflight-index array and arms a per-op
//! completion signal; the handler is async-signal-safe — it only polls
//! `aio_error` over the dense array and pushes finished slot indices into a
//! fixed lock-free completion ring (single producer per process, multiple
//! consumers). Draining claims a completion through its dense-array cell, so
//! the ring and the scan backstop can never both reap the same op.
//!
//! Contiguous transfers batch through `lio_listio`; the batch is flushed
//! whenever the opcode changes or an op forbids reordering.

use std::{
    cell::UnsafeCell,
    io, ptr,
    sync::atomic::{AtomicPtr, AtomicU32, Ordering},
    sync::Arc,
    time::Duration,
};

use shmio_log::{trace, warn};

use crate::{
    handle::IoHandle,
    list::NO_SLOT,
    op::Op,
    registry::AioRegistry,
    slot::IoFlags,
    sys, AioConfig,
};

/// Dense-array tag: the completion was pushed to the ring already.
const ENQUEUED: u32 = 1 << 31;
const INDEX_MASK: u32 = ENQUEUED - 1;

const BLOCK_POLL: Duration = Duration::from_millis(2);

#[cfg(target_os = "linux")]
fn completion_signal() -> libc::c_int {
    libc::SIGRTMIN() + 6
}

#[cfg(not(target_os = "linux"))]
fn completion_signal() -> libc::c_int {
    libc::SIGIO
}

struct AiocbCell(UnsafeCell<libc::aiocb>);

// SAFETY: a cell is written by the submitting backend before the op is
// armed and read back by exactly one claimant after completion; the dense
// array CAS is the ownership token in between.
unsafe impl Send for AiocbCell {}
unsafe impl Sync for AiocbCell {}

/// Fixed lock-free ring carrying completed slot indices out of the signal
/// handler. One producer (the handler; the signal is not re-entered), many
/// consumers. A full ring drops the push — the dense-array scan backstop
/// picks the completion up on the next drain.
struct CompletionRing {
    cells: Box<[AtomicU32]>,
    head: AtomicU32,
    tail: AtomicU32,
}

impl CompletionRing {
    fn new(capacity: usize) -> Self {
        Self {
            cells: (0..capacity.next_power_of_two())
                .map(|_| AtomicU32::new(NO_SLOT))
                .collect(),
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    /// Producer side; async-signal-safe (atomics only).
    fn push(&self, index: u32) {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(self.head.load(Ordering::Acquire)) >= self.cells.len() as u32 {
            return;
        }
        self.cells[tail as usize & (self.cells.len() - 1)].store(index, Ordering::Release);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
    }

    fn pop(&self) -> Option<u32> {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            // Read before claiming: the producer cannot overwrite this cell
            // until head has moved past it.
            let value = self.cells[head as usize & (self.cells.len() - 1)].load(Ordering::Acquire);
            if self
                .head
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(value);
            }
        }
    }
}

pub(crate) struct Driver {
    aiocbs: Box<[AiocbCell]>,
    ring: CompletionRing,
    /// Dense inflight-index array; a cell holds a slot index (possibly
    /// tagged ENQUEUED) while that slot's control block is armed.
    inflight_index: Box<[AtomicU32]>,
    /// Non-zero while a waiter sits in `aio_suspend`; the handler stays out.
    no_check: AtomicU32,
}

/// The handler has no context argument; the active driver parks a pointer
/// to itself here for the duration of `start`..`stop`.
static ACTIVE: AtomicPtr<Driver> = AtomicPtr::new(ptr::null_mut());

extern "C" fn on_completion(
    _signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    let driver = ACTIVE.load(Ordering::Acquire);
    if driver.is_null() {
        return;
    }
    // SAFETY: `stop` clears ACTIVE and blocks the signal before the driver
    // is dropped.
    let driver = unsafe { &*driver };
    if driver.no_check.load(Ordering::Acquire) != 0 {
        return;
    }
    // Only aio_error (async-signal-safe) and atomics from here on.
    for cell in driver.inflight_index.iter() {
        let value = cell.load(Ordering::Acquire);
        if value == NO_SLOT || value & ENQUEUED != 0 {
            continue;
        }
        let index = value & INDEX_MASK;
        let status =
            unsafe { libc::aio_error(driver.aiocbs[index as usize].0.get()) };
        if status == libc::EINPROGRESS {
            continue;
        }
        if cell
            .compare_exchange(value, value | ENQUEUED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            driver.ring.push(index);
        }
    }
}

impl Driver {
    pub fn new(config: &AioConfig) -> io::Result<Self> {
        Ok(Self {
            aiocbs: (0..config.max_in_progress)
                .map(|_| AiocbCell(UnsafeCell::new(unsafe { std::mem::zeroed() })))
                .collect(),
            ring: CompletionRing::new(config.max_in_progress),
            inflight_index: (0..config.max_in_flight)
                .map(|_| AtomicU32::new(NO_SLOT))
                .collect(),
            no_check: AtomicU32::new(0),
        })
    }

    pub fn start(&self, _registry: &Arc<AioRegistry>) -> io::Result<()> {
        ACTIVE.store(self as *const Driver as *mut Driver, Ordering::Release);
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            on_completion;
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        if unsafe { libc::sigaction(completion_signal(), &action, ptr::null_mut()) } != 0 {
            ACTIVE.store(ptr::null_mut(), Ordering::Release);
            return Err(io::Error::last_os_error());
        }
        trace!("posix driver armed on signal {}", completion_signal());
        Ok(())
    }

    pub fn stop(&self) {
        if ACTIVE
            .compare_exchange(
                self as *const Driver as *mut Driver,
                ptr::null_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigaction(completion_signal(), &action, ptr::null_mut());
            }
        }
    }

    fn aiocb(&self, index: u32) -> *mut libc::aiocb {
        self.aiocbs[index as usize].0.get()
    }

    /// Claim a dense-array cell for `index`. Running out is a protocol
    /// violation: the concurrency limiter bounds inflight ops below the
    /// array size.
    fn claim_index_cell(&self, index: u32) {
        for cell in self.inflight_index.iter() {
            if cell
                .compare_exchange(NO_SLOT, index, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
        panic!("no free cell in the inflight-index array");
    }

    pub fn submit(
        &self,
        registry: &AioRegistry,
        backend: u32,
        heads: &[u32],
        _will_wait: bool,
    ) -> io::Result<usize> {
        // Batched list submission: contiguous transfers of one opcode per
        // flush.
        let mut batch: Vec<*mut libc::aiocb> = Vec::with_capacity(heads.len());
        let mut batch_opcode: Option<libc::c_int> = None;
        for &head in heads {
            let slot = registry.slot(head);
            let members = sys::chain_members(registry, head);
            let data = slot.data();
            let no_reorder = data.op.no_reorder();
            match &data.op {
                Op::Nop => {
                    drop(data);
                    sys::mark_inflight(registry, head);
                    sys::mark_reaped(registry, backend, head, 0);
                    continue;
                }
                Op::FlushRange(_) => {
                    // No asynchronous form; complete it in place.
                    drop(data);
                    sys::mark_inflight(registry, head);
                    sys::mark_reaped(registry, backend, head, 0);
                    continue;
                }
                Op::Fsync(f) | Op::FsyncWal(f) => {
                    let fd = f.target.fd();
                    let op = if f.datasync { libc::O_DSYNC } else { libc::O_SYNC };
                    drop(data);
                    self.flush_batch(&mut batch, &mut batch_opcode);
                    self.arm(registry, head, fd, 0, ptr::null_mut(), 0);
                    sys::mark_inflight(registry, head);
                    let res = unsafe { libc::aio_fsync(op, self.aiocb(head)) };
                    if res != 0 {
                        self.submission_failed(registry, backend, head);
                    }
                }
                op => {
                    let transfer = op.transfer().expect("transfer op expected");
                    let fd = transfer.target.fd();
                    let (offset, view) = transfer.view();
                    let write = op.is_write();
                    drop(data);
                    // Chains are buffer-adjacent (no scatter/gather here), so
                    // the chain is one contiguous range starting at the head.
                    let total: usize = members
                        .iter()
                        .map(|&m| {
                            registry
                                .slot(m)
                                .data()
                                .op
                                .transfer()
                                .map(|t| t.remaining())
                                .unwrap_or(0)
                        })
                        .sum();
                    let opcode = if write { libc::LIO_WRITE } else { libc::LIO_READ };
                    if no_reorder || batch_opcode.is_some_and(|code| code != opcode) {
                        self.flush_batch(&mut batch, &mut batch_opcode);
                    }
                    self.arm(registry, head, fd, offset, view.as_ptr(), total);
                    let cb = self.aiocb(head);
                    unsafe { (*cb).aio_lio_opcode = opcode };
                    sys::mark_inflight(registry, head);
                    if no_reorder {
                        // Issue alone and synchronously order it.
                        let res = unsafe {
                            if write {
                                libc::aio_write(cb)
                            } else {
                                libc::aio_read(cb)
                            }
                        };
                        if res != 0 {
                            self.submission_failed(registry, backend, head);
                        }
                    } else {
                        batch_opcode = Some(opcode);
                        batch.push(cb);
                    }
                }
            }
        }
        self.flush_batch(&mut batch, &mut batch_opcode);
        Ok(heads.len())
    }

    /// Fill the slot's control block and register it in the dense array.
    fn arm(
        &self,
        _registry: &AioRegistry,
        head: u32,
        fd: crate::op::RawFd,
        offset: u64,
        buf: *mut u8,
        len: usize,
    ) {
        let cb = self.aiocb(head);
        unsafe {
            *cb = std::mem::zeroed();
            (*cb).aio_fildes = fd;
            (*cb).aio_offset = offset as libc::off_t;
            (*cb).aio_buf = buf as *mut libc::c_void;
            (*cb).aio_nbytes = len;
            (*cb).aio_sigevent.sigev_notify = libc::SIGEV_SIGNAL;
            (*cb).aio_sigevent.sigev_signo = completion_signal();
            (*cb).aio_sigevent.sigev_value = libc::sigval {
                sival_ptr: head as usize as *mut libc::c_void,
            };
        }
        self.claim_index_cell(head);
    }

    fn flush_batch(&self, batch: &mut Vec<*mut libc::aiocb>, batch_opcode: &mut Option<libc::c_int>) {
        if batch.is_empty() {
            return;
        }
        let res = unsafe {
            libc::lio_listio(
                libc::LIO_NOWAIT,
                batch.as_ptr() as *const *mut libc::aiocb,
                batch.len() as libc::c_int,
                ptr::null_mut(),
            )
        };
        if res != 0 {
            // Individual failures surface through aio_error on each block;
            // the scan backstop reaps them as immediate completions.
            warn!("lio_listio: {}", io::Error::last_os_error());
        }
        batch.clear();
        *batch_opcode = None;
    }

    /// A rejected submission is an immediate completion with the error.
    fn submission_failed(&self, registry: &AioRegistry, backend: u32, head: u32) {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        self.unregister(head);
        sys::mark_reaped(registry, backend, head, -(errno as i64));
        registry.io_signal.notify();
    }

    fn unregister(&self, index: u32) -> bool {
        for cell in self.inflight_index.iter() {
            let value = cell.load(Ordering::Acquire);
            if value != NO_SLOT
                && value & INDEX_MASK == index
                && cell
                    .compare_exchange(value, NO_SLOT, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                return true;
            }
        }
        false
    }

    pub fn drain(&self, registry: &AioRegistry, backend: u32, block: bool) -> usize {
        let mut reaped = self.collect(registry, backend);
        if reaped == 0 && block {
            std::thread::sleep(BLOCK_POLL);
            reaped = self.collect(registry, backend);
        }
        reaped
    }

    fn collect(&self, registry: &AioRegistry, backend: u32) -> usize {
        let mut reaped = 0;
        // Fast path: what the handler already found.
        while let Some(index) = self.pop_claimed() {
            self.reap(registry, backend, index);
            reaped += 1;
        }
        // Backstop: poll everything still registered. Covers completions the
        // handler missed while a waiter held the no-check flag, and rejected
        // list entries.
        for cell in self.inflight_index.iter() {
            let value = cell.load(Ordering::Acquire);
            if value == NO_SLOT {
                continue;
            }
            let index = value & INDEX_MASK;
            let status = unsafe { libc::aio_error(self.aiocb(index)) };
            if status == libc::EINPROGRESS {
                continue;
            }
            if cell
                .compare_exchange(value, NO_SLOT, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.reap(registry, backend, index);
                reaped += 1;
            }
        }
        if reaped > 0 {
            registry.io_signal.notify();
        }
        reaped
    }

    /// Pop ring entries, claiming each through its dense cell; an entry
    /// whose cell is already empty lost the race to the scan backstop.
    fn pop_claimed(&self) -> Option<u32> {
        while let Some(index) = self.ring.pop() {
            for cell in self.inflight_index.iter() {
                let value = cell.load(Ordering::Acquire);
                if value != NO_SLOT
                    && value & INDEX_MASK == index
                    && cell
                        .compare_exchange(value, NO_SLOT, Ordering::AcqRel, Ordering::Relaxed)
                        .is_ok()
                {
                    return Some(index);
                }
            }
        }
        None
    }

    fn reap(&self, registry: &AioRegistry, backend: u32, index: u32) {
        let cb = self.aiocb(index);
        let status = unsafe { libc::aio_error(cb) };
        let result = match status {
            0 => unsafe { libc::aio_return(cb) as i64 },
            errno => {
                unsafe { libc::aio_return(cb) };
                -(errno as i64)
            }
        };
        sys::mark_reaped(registry, backend, index, result);
    }

    pub fn wait_one(
        &self,
        registry: &AioRegistry,
        backend: u32,
        handle: IoHandle,
        timeout: Duration,
    ) {
        // Keep the handler from stealing the completion between our check
        // and the suspend.
        self.no_check.fetch_add(1, Ordering::AcqRel);
        if let Some(slot) = registry.deref_handle(handle) {
            if slot.flags().contains(IoFlags::INFLIGHT) {
                let cb = self.aiocb(handle.index());
                if unsafe { libc::aio_error(cb) } == libc::EINPROGRESS {
                    let timespec = libc::timespec {
                        tv_sec: timeout.as_secs() as libc::time_t,
                        tv_nsec: timeout.subsec_nanos() as _,
                    };
                    let list = [cb as *const libc::aiocb];
                    unsafe { libc::aio_suspend(list.as_ptr(), 1, &timespec) };
                }
            }
        }
        self.no_check.fetch_sub(1, Ordering::AcqRel);
        self.drain(registry, backend, false);
    }
}
