use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use shmio::{FileTag, IoTarget, Op};

mod utils;

use utils::{data_file, eventually, setup, shared_buf, PAGE};

#[test]
fn simple_read() {
    let (registry, reopen) = setup(|_| {});
    let (_tmp, file) = data_file(&reopen, FileTag(1), 2);
    let backend = registry.attach().unwrap();
    let (buf, ptr) = shared_buf(PAGE);

    let io = backend.acquire().unwrap();
    backend
        .prepare(io, Op::read_buffer(IoTarget::new(&file, FileTag(1)), 0, ptr))
        .unwrap();
    backend.submit().unwrap();
    let n = backend.wait(io).unwrap();
    assert_eq!(n, PAGE as i64);
    assert!(buf.iter().all(|&b| b == 0));
    backend.release(io);

    // The slot was recycled: its generation moved past the handle's.
    let snapshot = registry.slot_snapshots()[io.index() as usize].clone();
    assert_eq!(snapshot.generation, io.generation() + 1);

    backend.close().unwrap();
    registry.shutdown();
}

#[test]
fn read_sees_file_content() {
    let (registry, reopen) = setup(|_| {});
    let (_tmp, file) = data_file(&reopen, FileTag(2), 4);
    let backend = registry.attach().unwrap();
    let (buf, ptr) = shared_buf(PAGE);

    let io = backend.acquire().unwrap();
    backend
        .prepare(
            io,
            Op::read_buffer(
                IoTarget::new(&file, FileTag(2)),
                3 * PAGE as u64,
                ptr,
            ),
        )
        .unwrap();
    backend.submit().unwrap();
    assert_eq!(backend.wait(io).unwrap(), PAGE as i64);
    assert!(buf.iter().all(|&b| b == 3));
    backend.release(io);
    backend.close().unwrap();
}

#[test]
fn merge_of_four_sequential_reads() {
    let (registry, reopen) = setup(|_| {});
    let (_tmp, file) = data_file(&reopen, FileTag(3), 4);
    let backend = registry.attach().unwrap();
    let (buf, ptr) = shared_buf(4 * PAGE);

    let mut handles = Vec::new();
    for page in 0..4 {
        let io = backend.acquire().unwrap();
        backend
            .prepare(
                io,
                Op::read_buffer(
                    IoTarget::new(&file, FileTag(3)),
                    (page * PAGE) as u64,
                    ptr.advanced(page * PAGE),
                ),
            )
            .unwrap();
        handles.push(io);
    }
    backend.submit().unwrap();
    for io in &handles {
        assert_eq!(backend.wait(*io).unwrap(), PAGE as i64);
    }

    // One driver submission carried one fused chain of all four ops.
    let stats = registry.backend_snapshots()[backend.id() as usize].clone();
    assert_eq!(stats.submissions, 1);
    assert_eq!(stats.merged, 4);
    assert_eq!(stats.issued, 4);

    for (page, chunk) in buf.chunks(PAGE).enumerate() {
        assert!(chunk.iter().all(|&b| b == page as u8));
    }
    for io in handles {
        backend.release(io);
    }
    backend.close().unwrap();
    registry.shutdown();
}

#[test]
fn wal_writes_never_merge() {
    let (registry, reopen) = setup(|_| {});
    let (tmp, file) = data_file(&reopen, FileTag(4), 2);
    let backend = registry.attach().unwrap();
    let (buf, ptr) = shared_buf(2 * PAGE);

    let a = backend.acquire().unwrap();
    backend
        .prepare(
            a,
            Op::write_wal(
                IoTarget::new(&file, FileTag(4)),
                0,
                ptr.advanced(0),
                false,
            ),
        )
        .unwrap();
    let b = backend.acquire().unwrap();
    backend
        .prepare(
            b,
            Op::write_wal(
                IoTarget::new(&file, FileTag(4)),
                PAGE as u64,
                ptr.advanced(PAGE),
                false,
            ),
        )
        .unwrap();
    backend.submit().unwrap();
    assert_eq!(backend.wait(a).unwrap(), PAGE as i64);
    assert_eq!(backend.wait(b).unwrap(), PAGE as i64);

    let stats = registry.backend_snapshots()[backend.id() as usize].clone();
    assert_eq!(stats.merged, 0, "WAL writes must stay unfused");
    backend.release(a);
    backend.release(b);
    backend.close().unwrap();
    drop(tmp);
}

#[test]
fn cross_backend_completion_of_abandoned_write() {
    let (registry, reopen) = setup(|_| {});
    let (_tmp, file) = data_file(&reopen, FileTag(5), 1);
    let backend = registry.attach().unwrap();
    let (_buf, ptr) = shared_buf(PAGE);

    let io = backend.acquire().unwrap();
    backend
        .prepare(io, Op::write_buffer(IoTarget::new(&file, FileTag(5)), 0, ptr))
        .unwrap();
    backend.submit().unwrap();
    // Walk away: a worker backend observes the completion and the slot goes
    // straight back to the pool.
    backend.release(io);

    assert!(eventually(|| {
        backend.drain(false);
        let slots = registry.slot_snapshots();
        let slot = &slots[io.index() as usize];
        slot.generation > io.generation() && slot.flags.contains("UNUSED")
    }));
    let stats = registry.backend_snapshots()[backend.id() as usize].clone();
    assert_eq!(stats.inflight, 0);
    backend.close().unwrap();
    registry.shutdown();
}

#[test]
fn concurrency_cap_is_never_exceeded() {
    let (registry, reopen) = setup(|builder| {
        builder.io_concurrency(2);
    });
    let (_tmp, file) = data_file(&reopen, FileTag(6), 8);
    let backend = registry.attach().unwrap();
    let backend_id = backend.id();

    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let monitor = {
        let registry = registry.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut max = 0;
            while !stop.load(Ordering::Acquire) {
                let inflight = registry.backend_snapshots()[backend_id as usize].inflight;
                max = max.max(inflight);
                std::thread::yield_now();
            }
            max
        })
    };

    let (_buf, ptr) = shared_buf(32 * PAGE);
    let mut handles = Vec::new();
    for i in 0..30 {
        let io = backend.acquire().unwrap();
        backend
            .prepare(
                io,
                Op::read_buffer(
                    IoTarget::new(&file, FileTag(6)),
                    ((i % 8) * PAGE) as u64,
                    ptr.advanced(i * PAGE % (32 * PAGE)),
                ),
            )
            .unwrap();
        handles.push(io);
        // Stagger submissions so chains stay short and the limiter engages.
        if i % 2 == 1 {
            backend.submit().unwrap();
        }
    }
    backend.submit().unwrap();
    for io in handles {
        backend.wait(io).unwrap();
        backend.release(io);
    }
    stop.store(true, Ordering::Release);
    let max_inflight = monitor.join().unwrap();
    assert!(
        max_inflight <= 2,
        "inflight peaked at {max_inflight} with a cap of 2"
    );
    backend.close().unwrap();
    registry.shutdown();
}

#[test]
fn handle_outlives_slot_reuse() {
    let (registry, reopen) = setup(|_| {});
    let (_tmp, file) = data_file(&reopen, FileTag(7), 1);
    let backend = registry.attach().unwrap();
    let (_buf, ptr) = shared_buf(PAGE);

    let first = backend.acquire().unwrap();
    backend
        .prepare(first, Op::read_buffer(IoTarget::new(&file, FileTag(7)), 0, ptr))
        .unwrap();
    backend.submit().unwrap();
    backend.wait(first).unwrap();
    backend.release(first);

    // Reacquire; the local cache hands the same slot back with a new
    // generation.
    let second = backend.acquire().unwrap();
    assert_eq!(second.index(), first.index());
    assert_ne!(second.generation(), first.generation());

    // The stale handle reports completion immediately and the new op is
    // untouched.
    assert_eq!(backend.wait(first).unwrap(), 0);
    let snapshot = registry.slot_snapshots()[second.index() as usize].clone();
    assert!(snapshot.flags.contains("IDLE"));

    backend.release(second);
    backend.close().unwrap();
}

#[test]
fn local_callback_runs_in_initiator() {
    let (registry, reopen) = setup(|_| {});
    let (_tmp, file) = data_file(&reopen, FileTag(8), 1);
    let backend = registry.attach().unwrap();
    let (_buf, ptr) = shared_buf(PAGE);

    let seen = Arc::new(AtomicI64::new(-1));
    let io = backend.acquire().unwrap();
    backend
        .prepare(io, Op::read_buffer(IoTarget::new(&file, FileTag(8)), 0, ptr))
        .unwrap();
    let seen_by_cb = seen.clone();
    backend
        .set_local_callback(
            io,
            Box::new(move |done| {
                assert!(!done.failed);
                seen_by_cb.store(done.result, Ordering::Release);
            }),
        )
        .unwrap();
    backend.submit().unwrap();
    backend.wait(io).unwrap();
    assert_eq!(seen.load(Ordering::Acquire), PAGE as i64);
    backend.release(io);
    backend.close().unwrap();
}

#[test]
fn bounce_buffer_write_round_trip() {
    let (registry, reopen) = setup(|_| {});
    let (_tmp, file) = data_file(&reopen, FileTag(9), 1);
    let backend = registry.attach().unwrap();

    let bounce = backend.acquire_bounce().unwrap();
    let ptr = bounce.io_ptr();
    unsafe { ptr.as_slice_mut() }.fill(0xAB);

    let io = backend.acquire().unwrap();
    backend.associate_bounce(io, &bounce).unwrap();
    backend
        .prepare(io, Op::write_buffer(IoTarget::new(&file, FileTag(9)), 0, ptr))
        .unwrap();
    drop(bounce);
    backend.submit().unwrap();
    assert_eq!(backend.wait(io).unwrap(), ptr.len() as i64);
    backend.release(io);

    let written = std::fs::read(_tmp.path()).unwrap();
    assert!(written[..ptr.len()].iter().all(|&b| b == 0xAB));
    backend.close().unwrap();
    registry.shutdown();
}

#[test]
fn acquire_blocks_until_a_slot_frees() {
    let (registry, reopen) = setup(|builder| {
        builder.max_in_progress(2);
    });
    let (_tmp, _file) = data_file(&reopen, FileTag(10), 1);

    let hoarder = registry.attach().unwrap();
    let first = hoarder.acquire().unwrap();
    let second = hoarder.acquire().unwrap();

    let releaser = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(100));
        hoarder.release(first);
        hoarder.release(second);
        hoarder.close().unwrap();
    });

    let backend = registry.attach().unwrap();
    let io = backend.acquire().unwrap();
    backend.release(io);
    releaser.join().unwrap();
    backend.close().unwrap();
    registry.shutdown();
}

#[test]
fn fsync_and_nop_and_flush_range() {
    let (registry, reopen) = setup(|_| {});
    let (_tmp, file) = data_file(&reopen, FileTag(11), 1);
    let backend = registry.attach().unwrap();

    let nop = backend.acquire().unwrap();
    backend.prepare(nop, Op::Nop).unwrap();
    let flush = backend.acquire().unwrap();
    backend
        .prepare(
            flush,
            Op::flush_range(IoTarget::new(&file, FileTag(11)), 0, PAGE as u64),
        )
        .unwrap();
    let sync = backend.acquire().unwrap();
    backend
        .prepare(sync, Op::fsync(IoTarget::new(&file, FileTag(11)), false, true))
        .unwrap();
    backend.submit().unwrap();
    assert_eq!(backend.wait(nop).unwrap(), 0);
    assert_eq!(backend.wait(flush).unwrap(), 0);
    assert_eq!(backend.wait(sync).unwrap(), 0);
    for io in [nop, flush, sync] {
        backend.release(io);
    }
    backend.close().unwrap();
}

#[test]
fn recycle_reuses_a_finished_slot() {
    let (registry, reopen) = setup(|_| {});
    let (_tmp, file) = data_file(&reopen, FileTag(12), 2);
    let backend = registry.attach().unwrap();
    let (_buf, ptr) = shared_buf(PAGE);

    let io = backend.acquire().unwrap();
    backend
        .prepare(io, Op::read_buffer(IoTarget::new(&file, FileTag(12)), 0, ptr))
        .unwrap();
    backend.submit().unwrap();
    backend.wait(io).unwrap();

    let next = backend.recycle(io).unwrap();
    assert_eq!(next.index(), io.index());
    assert_ne!(next.generation(), io.generation());
    backend
        .prepare(
            next,
            Op::read_buffer(IoTarget::new(&file, FileTag(12)), PAGE as u64, ptr),
        )
        .unwrap();
    backend.submit().unwrap();
    assert_eq!(backend.wait(next).unwrap(), PAGE as i64);
    backend.release(next);
    backend.close().unwrap();
}

#[test]
fn snapshots_render() {
    let (registry, _reopen) = setup(|_| {});
    let backend = registry.attach().unwrap();
    let rows = registry.backend_snapshots();
    assert!(rows[backend.id() as usize].attached);
    let text = format!("{}", rows[backend.id() as usize]);
    assert!(text.starts_with(&backend.id().to_string()));
    let slots = registry.slot_snapshots();
    assert_eq!(slots.len(), registry.config().max_in_progress);
    assert!(format!("{}", slots[0]).contains("UNUSED"));
    backend.close().unwrap();
}
