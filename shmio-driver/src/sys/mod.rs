//! Kernel drivers.
//!
//! Every driver speaks the same four-operation surface: submit a batch of
//! chain heads, drain completions, wait for one handle, and capability
//! probes. Which drivers exist differs by compilation target; which one runs
//! is picked by configuration.

use std::{io, sync::Arc, time::Duration};

use crate::{
    handle::IoHandle,
    registry::AioRegistry,
    slot::IoFlags,
};

pub(crate) mod worker;

#[cfg(io_uring)]
pub(crate) mod ring;

#[cfg(posix_aio)]
pub(crate) mod posix;

#[cfg(windows)]
pub(crate) mod iocp;

/// Which kernel interface carries the I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// Worker backends executing synchronously; works everywhere.
    Worker,
    /// Linux ring-based submission/completion queues.
    Ring,
    /// POSIX per-request asynchronous I/O with signal completion.
    Posix,
    /// Windows I/O completion port.
    CompletionPort,
}

impl DriverKind {
    /// Short display name.
    pub fn name(&self) -> &'static str {
        match self {
            DriverKind::Worker => "worker",
            DriverKind::Ring => "ring",
            DriverKind::Posix => "posix",
            DriverKind::CompletionPort => "completion-port",
        }
    }

    /// The preferred driver for this build and host.
    pub fn suggest() -> DriverKind {
        #[cfg(io_uring)]
        {
            if ring::available() {
                return DriverKind::Ring;
            }
        }
        DriverKind::Worker
    }
}

pub(crate) enum Driver {
    Worker(worker::Driver),
    #[cfg(io_uring)]
    Ring(ring::Driver),
    #[cfg(posix_aio)]
    Posix(posix::Driver),
    #[cfg(windows)]
    Iocp(iocp::Driver),
}

impl Driver {
    pub fn new(config: &crate::AioConfig) -> io::Result<Self> {
        match config.kind {
            DriverKind::Worker => Ok(Self::Worker(worker::Driver::new(config)?)),
            #[cfg(io_uring)]
            DriverKind::Ring => Ok(Self::Ring(ring::Driver::new(config)?)),
            #[cfg(posix_aio)]
            DriverKind::Posix => Ok(Self::Posix(posix::Driver::new(config)?)),
            #[cfg(windows)]
            DriverKind::CompletionPort => Ok(Self::Iocp(iocp::Driver::new(config)?)),
            #[allow(unreachable_patterns)]
            kind => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("driver {} is not compiled in", kind.name()),
            )),
        }
    }

    pub fn start(&self, registry: &Arc<AioRegistry>) -> io::Result<()> {
        match self {
            Self::Worker(d) => d.start(registry),
            #[cfg(io_uring)]
            Self::Ring(_) => Ok(()),
            #[cfg(posix_aio)]
            Self::Posix(d) => d.start(registry),
            #[cfg(windows)]
            Self::Iocp(d) => d.start(registry),
        }
    }

    pub fn stop(&self) {
        match self {
            Self::Worker(d) => d.stop(),
            #[cfg(io_uring)]
            Self::Ring(_) => {}
            #[cfg(posix_aio)]
            Self::Posix(d) => d.stop(),
            #[cfg(windows)]
            Self::Iocp(d) => d.stop(),
        }
    }

    pub fn kind(&self) -> DriverKind {
        match self {
            Self::Worker(_) => DriverKind::Worker,
            #[cfg(io_uring)]
            Self::Ring(_) => DriverKind::Ring,
            #[cfg(posix_aio)]
            Self::Posix(_) => DriverKind::Posix,
            #[cfg(windows)]
            Self::Iocp(_) => DriverKind::CompletionPort,
        }
    }

    /// Whether the driver takes non-contiguous buffers in one kernel entry.
    /// When false, the merge stage additionally requires buffer adjacency.
    pub fn scatter_gather(&self) -> bool {
        match self {
            Self::Worker(_) => true,
            #[cfg(io_uring)]
            Self::Ring(_) => true,
            #[cfg(posix_aio)]
            Self::Posix(_) => false,
            #[cfg(windows)]
            Self::Iocp(_) => false,
        }
    }

    /// Issue a batch of chain heads. Returns the number of kernel entries
    /// issued; individual submission failures surface as immediate
    /// completions with a negative result, not as an error here.
    pub fn submit(
        &self,
        registry: &AioRegistry,
        backend: u32,
        heads: &[u32],
        will_wait: bool,
    ) -> io::Result<usize> {
        match self {
            Self::Worker(d) => d.submit(registry, backend, heads, will_wait),
            #[cfg(io_uring)]
            Self::Ring(d) => d.submit(registry, backend, heads, will_wait),
            #[cfg(posix_aio)]
            Self::Posix(d) => d.submit(registry, backend, heads, will_wait),
            #[cfg(windows)]
            Self::Iocp(d) => d.submit(registry, backend, heads, will_wait),
        }
    }

    /// Collect completions into `backend`'s reaped list. Returns how many
    /// kernel entries were reaped.
    pub fn drain(&self, registry: &AioRegistry, backend: u32, block: bool) -> usize {
        match self {
            Self::Worker(d) => d.drain(registry, backend, block),
            #[cfg(io_uring)]
            Self::Ring(d) => d.drain(registry, backend, block),
            #[cfg(posix_aio)]
            Self::Posix(d) => d.drain(registry, backend, block),
            #[cfg(windows)]
            Self::Iocp(d) => d.drain(registry, backend, block),
        }
    }

    /// Block until the referenced slot is no longer inflight, its generation
    /// moved on, or `timeout` elapsed.
    pub fn wait_one(
        &self,
        registry: &AioRegistry,
        backend: u32,
        handle: IoHandle,
        timeout: Duration,
    ) {
        match self {
            Self::Worker(d) => d.wait_one(registry, backend, handle, timeout),
            #[cfg(io_uring)]
            Self::Ring(d) => d.wait_one(registry, backend, handle, timeout),
            #[cfg(posix_aio)]
            Self::Posix(d) => d.wait_one(registry, backend, handle, timeout),
            #[cfg(windows)]
            Self::Iocp(d) => d.wait_one(registry, backend, handle, timeout),
        }
    }
}

/// Transition a chain to inflight and charge the initiator's window.
///
/// Every member flips `PENDING → INFLIGHT` and its condvar is broadcast
/// (merged tails included); the window is charged once per chain head, since
/// that is what reaches the kernel.
pub(crate) fn mark_inflight(registry: &AioRegistry, head: u32) {
    let slot = registry.slot(head);
    let owner = slot.owner();
    registry.backends[owner as usize]
        .inflight
        .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
    let mut cursor = Some(head);
    while let Some(index) = cursor {
        let member = registry.slot(index);
        member.update_flags(IoFlags::PENDING, IoFlags::INFLIGHT | IoFlags::DRIVER_RETURNED);
        member.notify_waiters();
        cursor = member.merge_next();
    }
}

/// Record a completion for a chain head and park it on `backend`'s reaped
/// list for dispatch.
pub(crate) fn mark_reaped(registry: &AioRegistry, backend: u32, head: u32, result: i64) {
    let slot = registry.slot(head);
    slot.set_result(result);
    slot.update_flags(IoFlags::INFLIGHT, IoFlags::REAPED);
    registry.backends[backend as usize]
        .local
        .lock()
        .reaped
        .push_tail(&registry.slots, head);
    slot.notify_waiters();
}

/// The members of a chain, head first.
pub(crate) fn chain_members(registry: &AioRegistry, head: u32) -> Vec<u32> {
    let mut members = vec![head];
    while let Some(next) = registry.slot(*members.last().unwrap()).merge_next() {
        members.push(next);
    }
    members
}
