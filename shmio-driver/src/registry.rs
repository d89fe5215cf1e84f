//! The shared registry: slot arena, central lists, bounce pool, callback
//! table, and the driver instance.
//!
//! One registry serves a whole cooperating group. Its lifetime is the
//! lifetime of the shared region; backends attach to it and detach before it
//! is torn down.

use std::{io, sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};
use shmio_buf::BounceBuffer;
use shmio_log::{trace, warn};

use crate::{
    backend::BackendState,
    handle::IoHandle,
    list::{ListRole, SlotList},
    op::{default_callbacks, PathReopen, ReopenFile, SharedCompletion},
    slot::IoSlot,
    sys, AioBuilder, DriverKind,
};

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct AioConfig {
    /// Size of the shared slot table.
    pub max_in_progress: usize,
    /// Maximum number of attached backends, worker backends included.
    pub max_backends: usize,
    /// Per-backend cap on submitted-but-not-reaped kernel entries.
    pub io_concurrency: usize,
    /// Per-driver-context kernel queue depth.
    pub max_in_flight: usize,
    /// Number of shared bounce buffers.
    pub bounce_buffers: usize,
    /// Size of one bounce buffer in bytes.
    pub bounce_buffer_size: usize,
    /// Worker driver submission queue capacity.
    pub worker_queue_size: usize,
    /// Worker backend count.
    pub workers: usize,
    /// Ring driver context count.
    pub ring_contexts: usize,
    /// Soft-failure retry bound per op.
    pub max_retries: u32,
    /// Which kernel driver to use.
    pub kind: DriverKind,
}

/// State guarded by the central mutex: the free pool, the bounce free list,
/// the centrally parked uncompleted ops, and issued-abandoned membership
/// (the lists themselves hang off the backends).
pub(crate) struct Central {
    pub free: SlotList,
    pub uncompleted: SlotList,
    pub free_bounce: Vec<u32>,
    pub used: usize,
}

/// Group-wide "something completed" pulse. Block-drain paths without a
/// kernel queue of their own (the worker driver, empty-pool waits) park
/// here.
pub(crate) struct IoSignal {
    seq: Mutex<u64>,
    cond: Condvar,
}

impl IoSignal {
    fn new() -> Self {
        Self {
            seq: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        *self.seq.lock() += 1;
        self.cond.notify_all();
    }

    pub fn wait(&self, timeout: Duration) {
        let mut seq = self.seq.lock();
        self.cond.wait_for(&mut seq, timeout);
    }
}

/// The shared core of the engine.
///
/// Created once per cooperating group via [`AioBuilder`](crate::AioBuilder);
/// participants call [`attach`](AioRegistry::attach) to get their
/// [`Backend`](crate::Backend).
pub struct AioRegistry {
    pub(crate) config: AioConfig,
    pub(crate) slots: Box<[IoSlot]>,
    pub(crate) backends: Box<[BackendState]>,
    pub(crate) central: Mutex<Central>,
    pub(crate) bounce: Box<[BounceBuffer]>,
    pub(crate) callbacks: Box<[Arc<dyn SharedCompletion>]>,
    pub(crate) reopen: Arc<dyn ReopenFile>,
    pub(crate) driver: sys::Driver,
    pub(crate) io_signal: IoSignal,
}

impl AioRegistry {
    pub(crate) fn build(builder: &AioBuilder) -> io::Result<Arc<Self>> {
        let config = builder.resolve()?;
        trace!("building registry: {config:?}");

        let slots: Box<[IoSlot]> = (0..config.max_in_progress as u32)
            .map(IoSlot::new)
            .collect();
        let backends: Box<[BackendState]> = (0..config.max_backends)
            .map(|_| BackendState::new())
            .collect();

        let central = Central {
            free: SlotList::new(ListRole::Io),
            uncompleted: SlotList::new(ListRole::Io),
            free_bounce: (0..config.bounce_buffers as u32).rev().collect(),
            used: 0,
        };
        for slot in slots.iter() {
            central.free.push_tail(&slots, slot.index());
        }

        let bounce: Box<[BounceBuffer]> = (0..config.bounce_buffers)
            .map(|_| BounceBuffer::new(config.bounce_buffer_size))
            .collect();

        let mut callbacks = default_callbacks();
        callbacks.extend(builder.callbacks.iter().cloned());

        let reopen = builder
            .reopen
            .clone()
            .unwrap_or_else(|| Arc::new(PathReopen::new()) as Arc<dyn ReopenFile>);

        let driver = sys::Driver::new(&config)?;

        let registry = Arc::new(Self {
            config,
            slots,
            backends,
            central: Mutex::new(central),
            bounce,
            callbacks: callbacks.into_boxed_slice(),
            reopen,
            driver,
            io_signal: IoSignal::new(),
        });
        registry.driver.start(&registry)?;
        Ok(registry)
    }

    /// The resolved configuration.
    pub fn config(&self) -> &AioConfig {
        &self.config
    }

    /// The driver actually in use.
    pub fn driver_kind(&self) -> DriverKind {
        self.driver.kind()
    }

    pub(crate) fn slot(&self, index: u32) -> &IoSlot {
        &self.slots[index as usize]
    }

    /// Dereference a handle; `None` means the slot has moved on to another
    /// generation and the referenced op is complete from the observer's view.
    pub(crate) fn deref_handle(&self, handle: IoHandle) -> Option<&IoSlot> {
        let slot = self.slot(handle.index());
        (slot.generation() == handle.generation()).then_some(slot)
    }

    /// Drop one bounce reference, returning the buffer to the free list when
    /// it was the last. Caller must hold the central mutex.
    pub(crate) fn release_bounce_locked(&self, central: &mut Central, index: u32) {
        if self.bounce[index as usize].release() {
            central.free_bounce.push(index);
        }
    }

    /// Tear the group down. Every backend must have detached; complains (and
    /// debug-asserts) about anything left behind.
    pub fn shutdown(&self) {
        self.driver.stop();
        let central = self.central.lock();
        if central.used != 0 {
            warn!("shutdown with {} slots still in use", central.used);
            debug_assert_eq!(central.used, 0);
        }
        if !central.uncompleted.is_empty() {
            warn!(
                "shutdown with {} uncompleted retryable ops",
                central.uncompleted.len()
            );
            debug_assert!(central.uncompleted.is_empty());
        }
        if central.free_bounce.len() != self.config.bounce_buffers {
            warn!(
                "shutdown with {} bounce buffers unreturned",
                self.config.bounce_buffers - central.free_bounce.len()
            );
        }
    }
}

impl Drop for AioRegistry {
    fn drop(&mut self) {
        self.driver.stop();
    }
}

/// RAII reference to a shared bounce buffer.
///
/// Dropping the guard releases the reference; the buffer returns to the pool
/// once the owning slot (if any) has dropped its reference too.
pub struct BounceBufferRef {
    registry: Arc<AioRegistry>,
    index: u32,
}

impl BounceBufferRef {
    pub(crate) fn new(registry: Arc<AioRegistry>, index: u32) -> Self {
        Self { registry, index }
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    /// The buffer memory. Bounce memory is shared by construction.
    pub fn io_ptr(&self) -> shmio_buf::IoPtr {
        self.registry.bounce[self.index as usize].io_ptr()
    }
}

impl Drop for BounceBufferRef {
    fn drop(&mut self) {
        let mut central = self.registry.central.lock();
        self.registry.release_bounce_locked(&mut central, self.index);
        drop(central);
        self.registry.io_signal.notify();
    }
}
