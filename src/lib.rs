//! shmio — a shared-memory asynchronous I/O engine for cooperating process
//! groups.
//!
//! Any attached backend may stage file I/O on a shared slot table, fuse
//! adjacent operations into fewer kernel calls, wait on a generation-tagged
//! handle, and observe completions — including completions reaped by a
//! different backend than the one that started the operation.
//!
//! This crate re-exports the engine ([`shmio_driver`]) and the buffer
//! primitives ([`shmio_buf`]). The registry is built once per group; each
//! participant attaches for a [`Backend`]:
//!
//! ```no_run
//! use shmio::{AioBuilder, DriverKind};
//!
//! # fn main() -> std::io::Result<()> {
//! let registry = AioBuilder::new()
//!     .driver(DriverKind::Worker)
//!     .build()?;
//! let backend = registry.attach()?;
//! # let _ = backend;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub use shmio_buf::{AlignedBuf, BounceBuffer, IoPtr, IO_ALIGN};
pub use shmio_driver::{
    AioBuilder, AioConfig, AioRegistry, Backend, BackendSnapshot, BounceBufferRef, CallbackId,
    Completion, DriverKind, FileTag, FlushRangeOp, FsyncOp, IoFlags, IoHandle, IoTarget, LocalIo,
    Op, OpKind, PathReopen, ReopenFile, SharedCompletion, SharedIo, SlotSnapshot, TransferOp,
};
