#![allow(dead_code)]

use std::{
    fs::File,
    io::Write,
    sync::Arc,
    time::{Duration, Instant},
};

use shmio::{AioBuilder, AioRegistry, AlignedBuf, DriverKind, FileTag, IoPtr, PathReopen};
use tempfile::NamedTempFile;

pub const PAGE: usize = 8192;

/// A registry on the worker driver with a path-backed reopen table.
pub fn setup(configure: impl FnOnce(&mut AioBuilder)) -> (Arc<AioRegistry>, Arc<PathReopen>) {
    let reopen = Arc::new(PathReopen::new());
    let mut builder = AioBuilder::new();
    builder
        .driver(DriverKind::Worker)
        .workers(2)
        .reopen_with(reopen.clone());
    configure(&mut builder);
    let registry = builder.build().unwrap();
    (registry, reopen)
}

/// A temp file of `pages` pages, each filled with its page number, with its
/// path registered under `tag`.
pub fn data_file(reopen: &PathReopen, tag: FileTag, pages: usize) -> (NamedTempFile, File) {
    let mut tmp = NamedTempFile::new().unwrap();
    for page in 0..pages {
        tmp.write_all(&vec![page as u8; PAGE]).unwrap();
    }
    tmp.flush().unwrap();
    reopen.register(tag, tmp.path());
    let file = File::options()
        .read(true)
        .write(true)
        .open(tmp.path())
        .unwrap();
    (tmp, file)
}

/// A page-aligned buffer whose memory is declared shared: every backend in
/// these tests lives in this address space.
pub fn shared_buf(len: usize) -> (AlignedBuf, IoPtr) {
    let buf = AlignedBuf::new(len);
    let ptr = unsafe { IoPtr::new_shared(buf.as_ptr(), buf.len()) };
    (buf, ptr)
}

/// Poll `pred` until it holds or five seconds pass.
pub fn eventually(mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
