//! The Windows completion-port driver.
//!
//! One process-wide port serves every file. Each slot owns an OVERLAPPED
//! record in a fixed arena; the record address comes back from the port and
//! resolves to the slot by layout. Scatter/gather would require files opened
//! for unbuffered I/O, so the driver reports no scatter/gather support and
//! the merge layer keeps chains buffer-adjacent instead.

use std::{
    cell::UnsafeCell,
    collections::HashSet,
    io,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use shmio_log::trace;
use windows_sys::Win32::{
    Foundation::{GetLastError, ERROR_HANDLE_EOF, ERROR_IO_PENDING, INVALID_HANDLE_VALUE},
    Storage::FileSystem::{FlushFileBuffers, ReadFile, WriteFile},
    System::IO::{
        CreateIoCompletionPort, GetOverlappedResult, GetQueuedCompletionStatusEx, OVERLAPPED,
        OVERLAPPED_ENTRY,
    },
};

use crate::{
    handle::IoHandle,
    op::{Op, RawFd},
    registry::AioRegistry,
    slot::IoFlags,
    sys, AioConfig,
};

const BLOCK_POLL_MS: u32 = 10;

/// Per-slot overlapped record. The base OVERLAPPED must stay the first
/// field: the port hands its address back and we recover the record (and the
/// slot index) from it.
#[repr(C)]
struct OverlappedCell {
    base: OVERLAPPED,
    slot: u32,
    fd: RawFd,
}

struct CellArena(Box<[UnsafeCell<OverlappedCell>]>);

// SAFETY: a cell belongs to its slot; the slot state machine gives it one
// writer at a time (the submitter until inflight, the kernel until the
// completion is dequeued).
unsafe impl Send for CellArena {}
unsafe impl Sync for CellArena {}

pub(crate) struct Driver {
    port: isize,
    cells: CellArena,
    attached: Mutex<HashSet<RawFd>>,
    /// Per-backend count of packets the port still owes us. Barrier-like
    /// ops wait on this; an op that is reaped but not yet dispatched is
    /// already ordered.
    kernel_pending: Box<[std::sync::atomic::AtomicU64]>,
}

impl Driver {
    pub fn new(config: &AioConfig) -> io::Result<Self> {
        let port =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, std::ptr::null_mut(), 0, 0) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            port: port as isize,
            kernel_pending: (0..config.max_backends)
                .map(|_| std::sync::atomic::AtomicU64::new(0))
                .collect(),
            cells: CellArena(
                (0..config.max_in_progress as u32)
                    .map(|slot| {
                        UnsafeCell::new(OverlappedCell {
                            base: unsafe { std::mem::zeroed() },
                            slot,
                            fd: 0,
                        })
                    })
                    .collect(),
            ),
            attached: Mutex::new(HashSet::new()),
        })
    }

    pub fn start(&self, _registry: &Arc<AioRegistry>) -> io::Result<()> {
        Ok(())
    }

    pub fn stop(&self) {}

    /// A handle attaches to the port once for its lifetime.
    fn attach(&self, fd: RawFd) -> io::Result<()> {
        let mut attached = self.attached.lock();
        if attached.contains(&fd) {
            return Ok(());
        }
        let res = unsafe {
            CreateIoCompletionPort(fd as _, self.port as _, 0, 0)
        };
        if res.is_null() {
            return Err(io::Error::last_os_error());
        }
        attached.insert(fd);
        Ok(())
    }

    pub fn submit(
        &self,
        registry: &AioRegistry,
        backend: u32,
        heads: &[u32],
        _will_wait: bool,
    ) -> io::Result<usize> {
        for &head in heads {
            let slot = registry.slot(head);
            let members = sys::chain_members(registry, head);
            let data = slot.data();
            let no_reorder = data.op.no_reorder();
            if no_reorder {
                drop(data);
                // One at a time: everything of ours already submitted must
                // come back before a barrier-like op goes out.
                self.settle(registry, backend);
                let data = slot.data();
                self.issue(registry, backend, head, &members, &data.op)?;
            } else {
                self.issue(registry, backend, head, &members, &data.op)?;
            }
        }
        Ok(heads.len())
    }

    fn issue(
        &self,
        registry: &AioRegistry,
        backend: u32,
        head: u32,
        members: &[u32],
        op: &Op,
    ) -> io::Result<usize> {
        match op {
            Op::Nop | Op::FlushRange(_) => {
                sys::mark_inflight(registry, head);
                sys::mark_reaped(registry, backend, head, 0);
            }
            Op::Fsync(f) | Op::FsyncWal(f) => {
                // No overlapped form; complete inline.
                let fd = f.target.fd();
                sys::mark_inflight(registry, head);
                let ok = unsafe { FlushFileBuffers(fd as _) };
                let result = if ok == 0 {
                    -(io::Error::last_os_error().raw_os_error().unwrap_or(5) as i64)
                } else {
                    0
                };
                sys::mark_reaped(registry, backend, head, result);
            }
            op => {
                let transfer = op.transfer().expect("transfer op expected");
                let fd = transfer.target.fd();
                let (offset, view) = transfer.view();
                let write = op.is_write();
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
                if let Err(e) = self.attach(fd) {
                    sys::mark_inflight(registry, head);
                    sys::mark_reaped(
                        registry,
                        backend,
                        head,
                        -(e.raw_os_error().unwrap_or(5) as i64),
                    );
                    return Ok(1);
                }
                // SAFETY: the slot is ours until it goes inflight.
                let cell = unsafe { &mut *self.cells.0[head as usize].get() };
                cell.base = unsafe { std::mem::zeroed() };
                cell.base.Anonymous.Anonymous.Offset = offset as u32;
                cell.base.Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
                cell.fd = fd;
                sys::mark_inflight(registry, head);
                let optr = &mut cell.base as *mut OVERLAPPED;
                let ok = unsafe {
                    if write {
                        WriteFile(
                            fd as _,
                            view.as_ptr(),
                            total as u32,
                            std::ptr::null_mut(),
                            optr,
                        )
                    } else {
                        ReadFile(
                            fd as _,
                            view.as_ptr(),
                            total as u32,
                            std::ptr::null_mut(),
                            optr,
                        )
                    }
                };
                if ok == 0 {
                    let code = unsafe { GetLastError() };
                    if code != ERROR_IO_PENDING {
                        // A failed non-pending submission completes inline.
                        let result = if code == ERROR_HANDLE_EOF {
                            0
                        } else {
                            -(code as i64)
                        };
                        sys::mark_reaped(registry, backend, head, result);
                        return Ok(1);
                    }
                }
                // Pending, or a synchronous success that still posts a
                // packet; either way the port owes us one.
                self.kernel_pending[registry.slot(head).owner() as usize]
                    .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            }
        }
        Ok(1)
    }

    fn settle(&self, registry: &AioRegistry, backend: u32) {
        while self.kernel_pending[backend as usize].load(std::sync::atomic::Ordering::Acquire) > 0
        {
            self.drain(registry, backend, true);
        }
    }

    pub fn drain(&self, registry: &AioRegistry, backend: u32, block: bool) -> usize {
        let mut entries: [OVERLAPPED_ENTRY; 64] = unsafe { std::mem::zeroed() };
        let mut removed: u32 = 0;
        let timeout = if block { BLOCK_POLL_MS } else { 0 };
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port as _,
                entries.as_mut_ptr(),
                entries.len() as u32,
                &mut removed,
                timeout,
                0,
            )
        };
        if ok == 0 {
            return 0;
        }
        let mut reaped = 0;
        for entry in entries.iter().take(removed as usize) {
            if entry.lpOverlapped.is_null() {
                continue;
            }
            let cell = unsafe { &*(entry.lpOverlapped as *const OverlappedCell) };
            let mut bytes: u32 = 0;
            let ok = unsafe {
                GetOverlappedResult(cell.fd as _, entry.lpOverlapped, &mut bytes, 0)
            };
            let result = if ok == 0 {
                let code = unsafe { GetLastError() };
                if code == ERROR_HANDLE_EOF {
                    0
                } else {
                    -(code as i64)
                }
            } else {
                bytes as i64
            };
            self.kernel_pending[registry.slot(cell.slot).owner() as usize]
                .fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
            sys::mark_reaped(registry, backend, cell.slot, result);
            reaped += 1;
        }
        if reaped > 0 {
            trace!("completion port delivered {reaped} entries");
            registry.io_signal.notify();
        }
        reaped
    }

    pub fn wait_one(
        &self,
        registry: &AioRegistry,
        backend: u32,
        handle: IoHandle,
        _timeout: Duration,
    ) {
        let Some(slot) = registry.deref_handle(handle) else {
            return;
        };
        if !slot.flags().contains(IoFlags::INFLIGHT) {
            return;
        }
        self.drain(registry, backend, true);
    }
}
