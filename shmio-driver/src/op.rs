//! The I/O operations.
//!
//! Types in this mod describe the operations carried by slots in the shared
//! table. An operation holds plain parameters only; submitting, waiting and
//! completing all go through a [`Backend`](crate::Backend).

use std::{collections::HashMap, fmt, fs::File, io, path::PathBuf, sync::Arc};

use parking_lot::Mutex;
use shmio_buf::IoPtr;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Raw descriptor of the platform.
        pub type RawFd = std::os::fd::RawFd;

        pub(crate) const ERR_INTR: i64 = -(libc::EINTR as i64);
        pub(crate) const ERR_AGAIN: i64 = -(libc::EAGAIN as i64);
        pub(crate) const ERR_IO: i64 = -(libc::EIO as i64);
    } else {
        /// Raw descriptor of the platform. Handles and sockets share the
        /// representation, as both attach to a completion port.
        pub type RawFd = isize;

        pub(crate) const ERR_INTR: i64 = -4;
        pub(crate) const ERR_AGAIN: i64 = -11;
        pub(crate) const ERR_IO: i64 = -5;
    }
}

/// Whether a negative result is worth re-issuing as-is.
pub(crate) fn is_transient(result: i64) -> bool {
    result == ERR_INTR || result == ERR_AGAIN
}

/// Identifying tag of an I/O target, stable across processes.
///
/// Raw descriptors are process-local; the tag is what survives. The retry
/// path re-opens the file from the tag through the registered [`ReopenFile`],
/// independent of whichever descriptor the initiator used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileTag(pub u64);

/// Re-opens files from their identifying tags.
///
/// Served by the embedder's storage layer; [`PathReopen`] is a plain
/// path-table implementation for tests and simple embeddings.
pub trait ReopenFile: Send + Sync {
    /// Open a fresh descriptor for `tag`.
    fn reopen(&self, tag: FileTag) -> io::Result<File>;
}

/// [`ReopenFile`] backed by a tag → path table.
#[derive(Default)]
pub struct PathReopen {
    paths: Mutex<HashMap<FileTag, PathBuf>>,
}

impl PathReopen {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `tag` with `path`.
    pub fn register(&self, tag: FileTag, path: impl Into<PathBuf>) {
        self.paths.lock().insert(tag, path.into());
    }
}

impl ReopenFile for PathReopen {
    fn reopen(&self, tag: FileTag) -> io::Result<File> {
        let path = self.paths.lock().get(&tag).cloned().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no path for {tag:?}"))
        })?;
        File::options().read(true).write(true).open(path)
    }
}

/// The file an operation acts on: a process-local descriptor for the
/// submitting side plus the cross-process tag.
#[derive(Debug)]
pub struct IoTarget {
    tag: FileTag,
    fd: RawFd,
    // Keeps a retry-time reopen alive for as long as the op references its fd.
    owned: Option<File>,
}

#[cfg(unix)]
fn raw_of(file: &File) -> RawFd {
    use std::os::fd::AsRawFd;
    file.as_raw_fd()
}

#[cfg(windows)]
fn raw_of(file: &File) -> RawFd {
    use std::os::windows::io::AsRawHandle;
    file.as_raw_handle() as RawFd
}

impl IoTarget {
    /// Capture `file`'s descriptor together with its tag.
    pub fn new(file: &File, tag: FileTag) -> Self {
        Self {
            tag,
            fd: raw_of(file),
            owned: None,
        }
    }

    /// Build a target from a raw descriptor.
    ///
    /// The descriptor must stay open until the operation completes.
    pub fn from_raw(fd: RawFd, tag: FileTag) -> Self {
        Self {
            tag,
            fd,
            owned: None,
        }
    }

    /// The process-local descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The cross-process tag.
    pub fn tag(&self) -> FileTag {
        self.tag
    }

    /// Replace the descriptor with a freshly opened file, keeping the file
    /// alive inside the target. Used by the retry path.
    pub(crate) fn adopt(&mut self, file: File) {
        self.fd = raw_of(&file);
        self.owned = Some(file);
    }
}

/// Parameters of a data transfer (read or write).
#[derive(Debug)]
pub struct TransferOp {
    /// Target file.
    pub target: IoTarget,
    /// Byte offset of the whole transfer.
    pub offset: u64,
    /// Total length in bytes.
    pub len: usize,
    /// Bytes already transferred by earlier, short attempts.
    pub done: usize,
    /// Memory the transfer reads from or writes into.
    pub buf: IoPtr,
    /// Later operations in the same context must not overtake this one.
    pub no_reorder: bool,
}

impl TransferOp {
    /// Bytes still outstanding.
    pub fn remaining(&self) -> usize {
        self.len - self.done
    }

    /// The offset and memory range of the next attempt, past any bytes an
    /// earlier short attempt already moved.
    pub(crate) fn view(&self) -> (u64, IoPtr) {
        (self.offset + self.done as u64, self.buf.advanced(self.done))
    }
}

/// Parameters of a durability barrier.
#[derive(Debug)]
pub struct FsyncOp {
    /// Target file.
    pub target: IoTarget,
    /// Skip flushing file metadata where the platform allows it.
    pub datasync: bool,
    /// Later operations in the same context must not overtake this one.
    pub barrier: bool,
}

/// Parameters of an asynchronous writeback hint.
#[derive(Debug)]
pub struct FlushRangeOp {
    /// Target file.
    pub target: IoTarget,
    /// Start of the range.
    pub offset: u64,
    /// Length of the range.
    pub len: u64,
}

/// Operation kind, used to index the shared callback table.
///
/// The table is built in the same order by every cooperating backend, so a
/// kind (or any callback id) names the same completion logic everywhere even
/// when code segments are mapped differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OpKind {
    /// No kernel action; completes with result 0.
    Nop = 0,
    /// Flush a data file.
    Fsync,
    /// Flush a WAL segment.
    FsyncWal,
    /// Initiate writeback of a file range.
    FlushRange,
    /// Read into a buffer-pool page.
    ReadBuffer,
    /// Write out a buffer-pool page.
    WriteBuffer,
    /// Append to the write-ahead log.
    WriteWal,
    /// Any other write.
    WriteGeneric,
}

impl OpKind {
    /// Number of kinds; the default callback table has one entry per kind.
    pub const COUNT: usize = 8;

    /// Short display name.
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Nop => "nop",
            OpKind::Fsync => "fsync",
            OpKind::FsyncWal => "fsync-wal",
            OpKind::FlushRange => "flush-range",
            OpKind::ReadBuffer => "read-buffer",
            OpKind::WriteBuffer => "write-buffer",
            OpKind::WriteWal => "write-wal",
            OpKind::WriteGeneric => "write-generic",
        }
    }
}

/// One staged I/O operation.
#[derive(Debug)]
pub enum Op {
    /// No kernel action.
    Nop,
    /// Flush a data file.
    Fsync(FsyncOp),
    /// Flush a WAL segment.
    FsyncWal(FsyncOp),
    /// Initiate writeback of a file range.
    FlushRange(FlushRangeOp),
    /// Read into a buffer-pool page.
    ReadBuffer(TransferOp),
    /// Write out a buffer-pool page.
    WriteBuffer(TransferOp),
    /// Append to the write-ahead log. Never merged: WAL submits short writes
    /// on purpose and fusing them would undo that.
    WriteWal(TransferOp),
    /// Any other write.
    WriteGeneric(TransferOp),
}

impl Op {
    fn transfer_of(target: IoTarget, offset: u64, buf: IoPtr) -> TransferOp {
        TransferOp {
            target,
            offset,
            len: buf.len(),
            done: 0,
            buf,
            no_reorder: false,
        }
    }

    /// Read `buf.len()` bytes at `offset` into `buf`.
    pub fn read_buffer(target: IoTarget, offset: u64, buf: IoPtr) -> Self {
        Op::ReadBuffer(Self::transfer_of(target, offset, buf))
    }

    /// Write `buf` at `offset`.
    pub fn write_buffer(target: IoTarget, offset: u64, buf: IoPtr) -> Self {
        Op::WriteBuffer(Self::transfer_of(target, offset, buf))
    }

    /// Append `buf` to the WAL at `offset`.
    pub fn write_wal(target: IoTarget, offset: u64, buf: IoPtr, no_reorder: bool) -> Self {
        let mut t = Self::transfer_of(target, offset, buf);
        t.no_reorder = no_reorder;
        Op::WriteWal(t)
    }

    /// Write `buf` at `offset` outside the buffer pool and WAL.
    pub fn write_generic(target: IoTarget, offset: u64, buf: IoPtr) -> Self {
        Op::WriteGeneric(Self::transfer_of(target, offset, buf))
    }

    /// Flush `target`.
    pub fn fsync(target: IoTarget, datasync: bool, barrier: bool) -> Self {
        Op::Fsync(FsyncOp {
            target,
            datasync,
            barrier,
        })
    }

    /// Flush a WAL segment.
    pub fn fsync_wal(target: IoTarget, datasync: bool, barrier: bool) -> Self {
        Op::FsyncWal(FsyncOp {
            target,
            datasync,
            barrier,
        })
    }

    /// Hint writeback of a file range.
    pub fn flush_range(target: IoTarget, offset: u64, len: u64) -> Self {
        Op::FlushRange(FlushRangeOp {
            target,
            offset,
            len,
        })
    }

    /// The kind of this operation.
    pub fn kind(&self) -> OpKind {
        match self {
            Op::Nop => OpKind::Nop,
            Op::Fsync(_) => OpKind::Fsync,
            Op::FsyncWal(_) => OpKind::FsyncWal,
            Op::FlushRange(_) => OpKind::FlushRange,
            Op::ReadBuffer(_) => OpKind::ReadBuffer,
            Op::WriteBuffer(_) => OpKind::WriteBuffer,
            Op::WriteWal(_) => OpKind::WriteWal,
            Op::WriteGeneric(_) => OpKind::WriteGeneric,
        }
    }

    /// The transfer parameters, when the op moves data.
    pub fn transfer(&self) -> Option<&TransferOp> {
        match self {
            Op::ReadBuffer(t) | Op::WriteBuffer(t) | Op::WriteWal(t) | Op::WriteGeneric(t) => {
                Some(t)
            }
            _ => None,
        }
    }

    pub(crate) fn transfer_mut(&mut self) -> Option<&mut TransferOp> {
        match self {
            Op::ReadBuffer(t) | Op::WriteBuffer(t) | Op::WriteWal(t) | Op::WriteGeneric(t) => {
                Some(t)
            }
            _ => None,
        }
    }

    /// The file target, when there is one.
    pub fn target(&self) -> Option<&IoTarget> {
        match self {
            Op::Nop => None,
            Op::Fsync(f) | Op::FsyncWal(f) => Some(&f.target),
            Op::FlushRange(f) => Some(&f.target),
            Op::ReadBuffer(t) | Op::WriteBuffer(t) | Op::WriteWal(t) | Op::WriteGeneric(t) => {
                Some(&t.target)
            }
        }
    }

    /// Whether the op writes to the file.
    pub fn is_write(&self) -> bool {
        matches!(self, Op::WriteBuffer(_) | Op::WriteWal(_) | Op::WriteGeneric(_))
    }

    /// Whether later ops in the same context must not overtake this one.
    pub fn no_reorder(&self) -> bool {
        match self {
            Op::Fsync(f) | Op::FsyncWal(f) => f.barrier,
            _ => self.transfer().is_some_and(|t| t.no_reorder),
        }
    }

    /// Whether the merge layer may consider fusing this op at all. WAL writes
    /// are categorically excluded; partially-done ops must finish alone.
    pub(crate) fn may_merge(&self) -> bool {
        match self {
            Op::ReadBuffer(t) | Op::WriteBuffer(t) | Op::WriteGeneric(t) => t.done == 0,
            _ => false,
        }
    }

    /// Whether the retry path accepts this op after a soft failure.
    pub(crate) fn retryable(&self) -> bool {
        matches!(self, Op::ReadBuffer(_) | Op::WriteBuffer(_))
    }

    /// Render the op parameters for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Op::Nop => "nop".into(),
            Op::Fsync(f) | Op::FsyncWal(f) => format!(
                "{} fd {} tag {:#x}{}{}",
                self.kind().name(),
                f.target.fd(),
                f.target.tag().0,
                if f.datasync { " datasync" } else { "" },
                if f.barrier { " barrier" } else { "" },
            ),
            Op::FlushRange(f) => format!(
                "flush-range fd {} tag {:#x} off {} len {}",
                f.target.fd(),
                f.target.tag().0,
                f.offset,
                f.len
            ),
            Op::ReadBuffer(t) | Op::WriteBuffer(t) | Op::WriteWal(t) | Op::WriteGeneric(t) => {
                format!(
                    "{} fd {} tag {:#x} off {} len {} done {}{}",
                    self.kind().name(),
                    t.target.fd(),
                    t.target.tag().0,
                    t.offset,
                    t.len,
                    t.done,
                    if t.no_reorder { " no-reorder" } else { "" },
                )
            }
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Index into the shared callback table.
///
/// Callbacks are addressed by index, not pointer: the table is rebuilt in
/// identical order by every process, so the index names the same logic even
/// across differing code-segment layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(pub u32);

/// Verdict of a shared completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The op is finished — success, or a hard failure carried in the result.
    Finished,
    /// The failure is transient; re-queue and re-issue the op.
    Retry,
}

/// What a shared callback sees and may edit.
pub struct SharedIo<'a> {
    /// The op parameters; a callback accounting a short transfer advances
    /// `done` here.
    pub op: &'a mut Op,
    /// The raw driver result: negative error code or transferred byte count
    /// for this attempt. A callback may rewrite it, e.g. to surface an
    /// unexpected EOF as an error.
    pub result: i64,
    /// Soft-failure retries already taken by this op.
    pub retries: u32,
    /// Configured retry bound.
    pub retry_cap: u32,
}

/// Operation-type-specific completion logic, run in whichever backend reaps
/// the completion.
pub trait SharedCompletion: Send + Sync {
    /// Inspect a reaped op and decide whether it is finished.
    fn io_completed(&self, io: &mut SharedIo<'_>) -> Completion;
}

/// Default completion for ops without transfer accounting: always finished.
struct PlainCompletion;

impl SharedCompletion for PlainCompletion {
    fn io_completed(&self, _io: &mut SharedIo<'_>) -> Completion {
        Completion::Finished
    }
}

/// Default completion for buffer reads and writes: accounts short transfers
/// and asks for a bounded number of retries.
struct TransferCompletion;

impl SharedCompletion for TransferCompletion {
    fn io_completed(&self, io: &mut SharedIo<'_>) -> Completion {
        if io.result < 0 {
            if is_transient(io.result) && io.retries < io.retry_cap {
                return Completion::Retry;
            }
            return Completion::Finished;
        }
        let t = io
            .op
            .transfer_mut()
            .expect("transfer completion on a non-transfer op");
        let n = (io.result as usize).min(t.remaining());
        t.done += n;
        if t.done == t.len {
            io.result = t.len as i64;
            return Completion::Finished;
        }
        if n == 0 || io.retries >= io.retry_cap {
            // Zero progress or out of retries: report an I/O error rather
            // than spin on the remainder.
            io.result = ERR_IO;
            return Completion::Finished;
        }
        Completion::Retry
    }
}

/// Default completion for WAL writes. Short WAL writes are deliberate and
/// the WAL layer tracks durability itself, so anything non-negative is final.
struct WalCompletion;

impl SharedCompletion for WalCompletion {
    fn io_completed(&self, _io: &mut SharedIo<'_>) -> Completion {
        Completion::Finished
    }
}

/// The default callback table: entry `k` serves `OpKind` with discriminant
/// `k`. Embedders append their own callbacks after these.
pub(crate) fn default_callbacks() -> Vec<Arc<dyn SharedCompletion>> {
    vec![
        Arc::new(PlainCompletion),    // Nop
        Arc::new(PlainCompletion),    // Fsync
        Arc::new(PlainCompletion),    // FsyncWal
        Arc::new(PlainCompletion),    // FlushRange
        Arc::new(TransferCompletion), // ReadBuffer
        Arc::new(TransferCompletion), // WriteBuffer
        Arc::new(WalCompletion),      // WriteWal
        Arc::new(TransferCompletion), // WriteGeneric
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(len: usize) -> Op {
        let buf = vec![0u8; len].leak();
        Op::read_buffer(
            IoTarget::from_raw(-1, FileTag(1)),
            0,
            unsafe { IoPtr::new(buf.as_mut_ptr(), buf.len()) },
        )
    }

    #[test]
    fn short_transfer_retries_then_finishes() {
        let cb = TransferCompletion;
        let mut op = transfer(8192);
        let mut io = SharedIo {
            op: &mut op,
            result: 4096,
            retries: 0,
            retry_cap: 8,
        };
        assert_eq!(cb.io_completed(&mut io), Completion::Retry);
        assert_eq!(io.op.transfer().unwrap().done, 4096);

        let mut io = SharedIo {
            op: &mut op,
            result: 4096,
            retries: 1,
            retry_cap: 8,
        };
        assert_eq!(cb.io_completed(&mut io), Completion::Finished);
        assert_eq!(io.result, 8192);
    }

    #[test]
    fn zero_progress_is_hard() {
        let cb = TransferCompletion;
        let mut op = transfer(8192);
        let mut io = SharedIo {
            op: &mut op,
            result: 0,
            retries: 0,
            retry_cap: 8,
        };
        assert_eq!(cb.io_completed(&mut io), Completion::Finished);
        assert_eq!(io.result, ERR_IO);
    }

    #[test]
    fn transient_error_respects_cap() {
        let cb = TransferCompletion;
        let mut op = transfer(4096);
        let mut io = SharedIo {
            op: &mut op,
            result: ERR_INTR,
            retries: 8,
            retry_cap: 8,
        };
        assert_eq!(cb.io_completed(&mut io), Completion::Finished);
        assert!(io.result < 0);
    }

    #[test]
    fn wal_never_merges() {
        let buf = vec![0u8; 512].leak();
        let op = Op::write_wal(
            IoTarget::from_raw(-1, FileTag(2)),
            0,
            unsafe { IoPtr::new(buf.as_mut_ptr(), buf.len()) },
            false,
        );
        assert!(!op.may_merge());
        assert!(!op.retryable());
    }
}
