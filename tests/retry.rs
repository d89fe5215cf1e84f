use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use shmio::{Completion, FileTag, IoTarget, Op, SharedCompletion, SharedIo};

mod utils;

use utils::{data_file, setup, shared_buf, PAGE};

/// Rejects the first `failures` completions as soft, then accepts.
struct Flaky {
    failures: AtomicU32,
}

impl Flaky {
    fn new(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
        }
    }
}

impl SharedCompletion for Flaky {
    fn io_completed(&self, _io: &mut SharedIo<'_>) -> Completion {
        let remaining = self.failures.load(Ordering::Acquire);
        if remaining > 0
            && self
                .failures
                .compare_exchange(remaining, remaining - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            Completion::Retry
        } else {
            Completion::Finished
        }
    }
}

#[test]
fn soft_failure_retries_and_succeeds() {
    let reopen = Arc::new(shmio::PathReopen::new());
    let mut builder = shmio::AioBuilder::new();
    builder
        .driver(shmio::DriverKind::Worker)
        .workers(2)
        .reopen_with(reopen.clone());
    let flaky = builder.register_callback(Arc::new(Flaky::new(2)));
    let registry = builder.build().unwrap();

    let (_tmp, file) = data_file(&reopen, FileTag(20), 1);
    let backend = registry.attach().unwrap();
    let (_buf, ptr) = shared_buf(PAGE);

    let io = backend.acquire().unwrap();
    backend
        .prepare_with(
            io,
            Op::read_buffer(IoTarget::new(&file, FileTag(20)), 0, ptr),
            flaky,
        )
        .unwrap();
    backend.submit().unwrap();
    assert_eq!(backend.wait(io).unwrap(), PAGE as i64);

    let retries: u64 = registry
        .backend_snapshots()
        .iter()
        .map(|snapshot| snapshot.retries)
        .sum();
    assert_eq!(retries, 2);
    backend.release(io);
    backend.close().unwrap();
    registry.shutdown();
}

#[test]
fn retries_are_bounded() {
    let reopen = Arc::new(shmio::PathReopen::new());
    let mut builder = shmio::AioBuilder::new();
    builder
        .driver(shmio::DriverKind::Worker)
        .workers(2)
        .max_retries(2)
        .reopen_with(reopen.clone());
    let flaky = builder.register_callback(Arc::new(Flaky::new(u32::MAX)));
    let registry = builder.build().unwrap();

    let (_tmp, file) = data_file(&reopen, FileTag(21), 1);
    let backend = registry.attach().unwrap();
    let (_buf, ptr) = shared_buf(PAGE);

    let io = backend.acquire().unwrap();
    backend
        .prepare_with(
            io,
            Op::read_buffer(IoTarget::new(&file, FileTag(21)), 0, ptr),
            flaky,
        )
        .unwrap();
    backend.submit().unwrap();
    let err = backend.wait(io).expect_err("the retry cap must fail the op");
    assert!(err.raw_os_error().is_some());
    backend.release(io);
    backend.close().unwrap();
    registry.shutdown();
}

#[test]
fn retry_reopens_from_the_tag() {
    // The retried attempt runs on a descriptor re-opened from the tag; the
    // initiator's descriptor plays no part in it.
    let reopen = Arc::new(shmio::PathReopen::new());
    let mut builder = shmio::AioBuilder::new();
    builder
        .driver(shmio::DriverKind::Worker)
        .workers(2)
        .reopen_with(reopen.clone());
    let flaky = builder.register_callback(Arc::new(Flaky::new(1)));
    let registry = builder.build().unwrap();

    let (_tmp, file) = data_file(&reopen, FileTag(22), 1);
    let backend = registry.attach().unwrap();
    let (_buf, ptr) = shared_buf(PAGE);

    let io = backend.acquire().unwrap();
    backend
        .prepare_with(
            io,
            Op::read_buffer(IoTarget::new(&file, FileTag(22)), 0, ptr),
            flaky,
        )
        .unwrap();
    backend.submit().unwrap();
    assert_eq!(backend.wait(io).unwrap(), PAGE as i64);
    drop(file);
    backend.release(io);
    backend.close().unwrap();
    registry.shutdown();
}

#[test]
fn cancel_prepared_returns_the_slot_to_idle() {
    let (registry, reopen) = setup(|_| {});
    let (_tmp, file) = data_file(&reopen, FileTag(23), 1);
    let backend = registry.attach().unwrap();
    let (_buf, ptr) = shared_buf(PAGE);

    let io = backend.acquire().unwrap();
    backend
        .prepare(io, Op::read_buffer(IoTarget::new(&file, FileTag(23)), 0, ptr))
        .unwrap();
    backend.cancel_prepared(io).unwrap();
    let snapshot = registry.slot_snapshots()[io.index() as usize].clone();
    assert!(snapshot.flags.contains("IDLE"));

    // The slot is reusable in place.
    backend
        .prepare(io, Op::read_buffer(IoTarget::new(&file, FileTag(23)), 0, ptr))
        .unwrap();
    backend.submit().unwrap();
    assert_eq!(backend.wait(io).unwrap(), PAGE as i64);
    backend.release(io);
    backend.close().unwrap();
}
