//! The shmio engine: a shared slot table of I/O operations, per-backend
//! staging and merging, cross-backend completion routing, and pluggable
//! kernel drivers.
//!
//! Some drivers differ by compilation target; the worker driver exists
//! everywhere.
//!
//! ```no_run
//! use std::sync::Arc;
//! use shmio_driver::{AioBuilder, FileTag, IoTarget, Op, PathReopen};
//!
//! # fn main() -> std::io::Result<()> {
//! let reopen = Arc::new(PathReopen::new());
//! reopen.register(FileTag(1), "data/segment.0");
//! let registry = AioBuilder::new().reopen_with(reopen.clone()).build()?;
//!
//! let backend = registry.attach()?;
//! let file = std::fs::File::open("data/segment.0")?;
//! let mut page = vec![0u8; 8192];
//! let buf = unsafe { shmio_buf::IoPtr::new(page.as_mut_ptr(), page.len()) };
//!
//! let io = backend.acquire()?;
//! backend.prepare(io, Op::read_buffer(IoTarget::new(&file, FileTag(1)), 0, buf))?;
//! backend.submit()?;
//! let n = backend.wait(io)?;
//! backend.release(io);
//! assert_eq!(n, 8192);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

use std::{io, sync::Arc};

mod backend;
mod handle;
mod introspect;
mod list;
mod op;
mod registry;
mod slot;
mod spin;
mod sys;

pub use backend::Backend;
pub use handle::IoHandle;
pub use introspect::{BackendSnapshot, SlotSnapshot};
pub use op::{
    CallbackId, Completion, FileTag, FlushRangeOp, FsyncOp, IoTarget, Op, OpKind, PathReopen,
    RawFd, ReopenFile, SharedCompletion, SharedIo, TransferOp,
};
pub use registry::{AioConfig, AioRegistry, BounceBufferRef};
pub use slot::{IoFlags, IoSlot, LocalCallback, LocalIo};
pub use sys::DriverKind;

/// Builder for [`AioRegistry`].
#[derive(Clone)]
pub struct AioBuilder {
    max_in_progress: usize,
    max_backends: usize,
    io_concurrency: usize,
    max_in_flight: usize,
    bounce_buffers: usize,
    bounce_buffer_size: usize,
    worker_queue_size: usize,
    workers: usize,
    ring_contexts: usize,
    max_retries: u32,
    kind: Option<DriverKind>,
    pub(crate) callbacks: Vec<Arc<dyn SharedCompletion>>,
    pub(crate) reopen: Option<Arc<dyn ReopenFile>>,
}

impl Default for AioBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AioBuilder {
    /// Create the builder with default config.
    pub fn new() -> Self {
        Self {
            max_in_progress: 256,
            max_backends: 32,
            io_concurrency: 10,
            max_in_flight: 128,
            bounce_buffers: 64,
            bounce_buffer_size: 8192,
            worker_queue_size: 128,
            workers: 3,
            ring_contexts: 1,
            max_retries: 8,
            kind: None,
            callbacks: Vec::new(),
            reopen: None,
        }
    }

    /// Size of the shared slot table. Default 256.
    pub fn max_in_progress(&mut self, value: usize) -> &mut Self {
        self.max_in_progress = value;
        self
    }

    /// Maximum attached backends, workers included. Default 32.
    pub fn max_backends(&mut self, value: usize) -> &mut Self {
        self.max_backends = value;
        self
    }

    /// Per-backend cap on kernel entries in the air. Default 10.
    pub fn io_concurrency(&mut self, value: usize) -> &mut Self {
        self.io_concurrency = value;
        self
    }

    /// Per-context kernel queue depth. Default 128.
    pub fn max_in_flight(&mut self, value: usize) -> &mut Self {
        self.max_in_flight = value;
        self
    }

    /// Shared bounce buffer count. Default 64.
    pub fn bounce_buffers(&mut self, value: usize) -> &mut Self {
        self.bounce_buffers = value;
        self
    }

    /// Size of one bounce buffer. Default 8192.
    pub fn bounce_buffer_size(&mut self, value: usize) -> &mut Self {
        self.bounce_buffer_size = value;
        self
    }

    /// Worker driver queue capacity. Default 128.
    pub fn worker_queue_size(&mut self, value: usize) -> &mut Self {
        self.worker_queue_size = value;
        self
    }

    /// Worker backend count. Default 3. Zero makes the worker driver execute
    /// everything in the submitting backend.
    pub fn workers(&mut self, value: usize) -> &mut Self {
        self.workers = value;
        self
    }

    /// Ring driver context count. Default 1.
    pub fn ring_contexts(&mut self, value: usize) -> &mut Self {
        self.ring_contexts = value;
        self
    }

    /// Soft-failure retry bound per op. Default 8.
    pub fn max_retries(&mut self, value: u32) -> &mut Self {
        self.max_retries = value;
        self
    }

    /// Force a driver. The default asks [`DriverKind::suggest`].
    pub fn driver(&mut self, kind: DriverKind) -> &mut Self {
        self.kind = Some(kind);
        self
    }

    /// Append a shared callback to the table, after the per-kind defaults.
    ///
    /// Every cooperating backend must register the same callbacks in the
    /// same order; the returned id is what names the callback group-wide.
    pub fn register_callback(&mut self, callback: Arc<dyn SharedCompletion>) -> CallbackId {
        self.callbacks.push(callback);
        CallbackId((OpKind::COUNT + self.callbacks.len() - 1) as u32)
    }

    /// Install the file re-opener used by workers and the retry path.
    pub fn reopen_with(&mut self, reopen: Arc<dyn ReopenFile>) -> &mut Self {
        self.reopen = Some(reopen);
        self
    }

    pub(crate) fn resolve(&self) -> io::Result<AioConfig> {
        fn invalid(what: &str) -> io::Error {
            io::Error::new(io::ErrorKind::InvalidInput, what.to_string())
        }
        if self.max_in_progress == 0 || self.max_in_progress >= u32::MAX as usize {
            return Err(invalid("max_in_progress out of range"));
        }
        if self.max_backends == 0 {
            return Err(invalid("max_backends must be positive"));
        }
        if self.io_concurrency == 0 {
            return Err(invalid("io_concurrency must be positive"));
        }
        if self.max_in_flight < self.io_concurrency {
            return Err(invalid("max_in_flight below io_concurrency"));
        }
        if self.worker_queue_size == 0 {
            return Err(invalid("worker_queue_size must be positive"));
        }
        let kind = self.kind.unwrap_or_else(DriverKind::suggest);
        if kind == DriverKind::Worker && self.workers >= self.max_backends {
            return Err(invalid("workers must leave room for user backends"));
        }
        Ok(AioConfig {
            max_in_progress: self.max_in_progress,
            max_backends: self.max_backends,
            io_concurrency: self.io_concurrency,
            max_in_flight: self.max_in_flight,
            bounce_buffers: self.bounce_buffers,
            bounce_buffer_size: self.bounce_buffer_size,
            worker_queue_size: self.worker_queue_size,
            workers: if kind == DriverKind::Worker {
                self.workers
            } else {
                0
            },
            ring_contexts: self.ring_contexts.max(1),
            max_retries: self.max_retries,
            kind,
        })
    }

    /// Build the registry and start its driver.
    pub fn build(&self) -> io::Result<Arc<AioRegistry>> {
        AioRegistry::build(self)
    }
}

impl std::fmt::Debug for AioBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioBuilder")
            .field("max_in_progress", &self.max_in_progress)
            .field("max_backends", &self.max_backends)
            .field("io_concurrency", &self.io_concurrency)
            .field("max_in_flight", &self.max_in_flight)
            .field("bounce_buffers", &self.bounce_buffers)
            .field("workers", &self.workers)
            .field("ring_contexts", &self.ring_contexts)
            .field("max_retries", &self.max_retries)
            .field("kind", &self.kind)
            .field("callbacks", &self.callbacks.len())
            .finish()
    }
}
