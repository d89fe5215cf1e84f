//! Per-backend engine: staging, merging, the concurrency limiter, completion
//! dispatch and retry.
//!
//! A [`Backend`] is one participant's view of the shared registry. It is not
//! `Sync`: each participant drives its own backend, and everything shared
//! lives in [`BackendState`] inside the registry where other participants can
//! reach it (inflight counts, the foreign-completed list, abandoned ops).

use std::{
    cell::Cell,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use shmio_log::{debug, trace, warn};

use crate::{
    handle::IoHandle,
    list::{ListRole, SlotList},
    op::{Completion, Op, SharedIo},
    registry::{AioRegistry, BounceBufferRef, Central},
    slot::{IoFlags, IoSlot, LocalCallback, LocalIo, NO_BACKEND},
    spin::SpinLock,
    CallbackId,
};

/// Staged ops are pushed to the driver once this many accumulate.
pub(crate) const SUBMIT_BATCH_LIMIT: usize = 32;
/// Longest chain the merge stage will build.
pub(crate) const COMBINE_LIMIT: usize = 16;
/// Released slots kept on the backend-local free cache.
const UNUSED_CACHE: usize = 8;
/// Wait slice for sleeps whose wakeup may only arrive via another backend.
pub(crate) const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Which owner-role list a slot is currently linked on. Kept on the slot so
/// that a completer which is not the owner can unlink it under the right
/// lock.
pub(crate) mod owner_list {
    pub const NONE: u8 = 0;
    pub const UNUSED: u8 = 1;
    pub const OUTSTANDING: u8 = 2;
    pub const PENDING: u8 = 3;
    pub const ISSUED: u8 = 4;
    pub const ABANDONED: u8 = 5;
}

/// Per-backend counters, all monotonic except the gauges derived from lists.
#[derive(Default)]
pub(crate) struct BackendStats {
    pub executed: AtomicU64,
    pub issued: AtomicU64,
    pub submissions: AtomicU64,
    pub merged: AtomicU64,
    pub foreign: AtomicU64,
    pub retries: AtomicU64,
    pub synchronous: AtomicU64,
    pub short_transfers: AtomicU64,
}

/// Owner-side queues, touched only with the backend's local mutex held.
/// The owner holds it on its fast paths; a completer takes it for the one
/// cross-backend unlink of an abandoned slot.
pub(crate) struct OwnerQueues {
    pub unused: SlotList,
    pub outstanding: SlotList,
    pub pending: SlotList,
    pub issued: SlotList,
    pub reaped: SlotList,
    pub local_completed: SlotList,
}

/// The shared per-backend record inside the registry.
pub(crate) struct BackendState {
    pub attached: AtomicBool,
    pub local: Mutex<OwnerQueues>,
    /// Guarded by the central mutex.
    pub issued_abandoned: SlotList,
    pub foreign_completed: SpinLock<SlotList>,
    pub inflight: AtomicU64,
    pub stats: BackendStats,
    pub last_context: AtomicU32,
}

impl BackendState {
    pub fn new() -> Self {
        Self {
            attached: AtomicBool::new(false),
            local: Mutex::new(OwnerQueues {
                unused: SlotList::new(ListRole::Owner),
                outstanding: SlotList::new(ListRole::Owner),
                pending: SlotList::new(ListRole::Owner),
                issued: SlotList::new(ListRole::Owner),
                reaped: SlotList::new(ListRole::Io),
                local_completed: SlotList::new(ListRole::Io),
            }),
            issued_abandoned: SlotList::new(ListRole::Owner),
            foreign_completed: SpinLock::new(SlotList::new(ListRole::Io)),
            inflight: AtomicU64::new(0),
            stats: BackendStats::default(),
            last_context: AtomicU32::new(0),
        }
    }
}

impl AioRegistry {
    /// Attach the calling participant, claiming a backend id.
    pub fn attach(self: &Arc<Self>) -> io::Result<Backend> {
        for (id, state) in self.backends.iter().enumerate() {
            if state
                .attached
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                trace!("backend {id} attached");
                return Ok(Backend {
                    registry: self.clone(),
                    id: id as u32,
                    in_local_dispatch: Cell::new(false),
                    closed: Cell::new(false),
                });
            }
        }
        Err(io::Error::new(
            io::ErrorKind::Other,
            "all backend slots are attached",
        ))
    }
}

/// One participant's interface to the engine.
pub struct Backend {
    registry: Arc<AioRegistry>,
    id: u32,
    in_local_dispatch: Cell<bool>,
    closed: Cell<bool>,
}

fn stale() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, "stale I/O handle")
}

fn err_result(e: &io::Error) -> i64 {
    -(e.raw_os_error().unwrap_or(5) as i64)
}

impl Backend {
    /// This backend's id within the group.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// The registry this backend is attached to.
    pub fn registry(&self) -> &Arc<AioRegistry> {
        &self.registry
    }

    pub(crate) fn state(&self) -> &BackendState {
        &self.registry.backends[self.id as usize]
    }

    fn slots(&self) -> &[IoSlot] {
        &self.registry.slots
    }

    // ------------------------------------------------------------------
    // Slot acquisition and release
    // ------------------------------------------------------------------

    /// Get an idle slot, blocking on completions when the pool is dry.
    pub fn acquire(&self) -> io::Result<IoHandle> {
        let slots = self.slots();
        loop {
            let cached = {
                let local = self.state().local.lock();
                local.unused.pop_head(slots).map(|index| {
                    local.outstanding.push_tail(slots, index);
                    index
                })
            };
            if let Some(index) = cached {
                return Ok(self.init_acquired(index));
            }
            let fresh = {
                let mut central = self.registry.central.lock();
                central.free.pop_head(slots).map(|index| {
                    central.used += 1;
                    index
                })
            };
            if let Some(index) = fresh {
                let local = self.state().local.lock();
                local.outstanding.push_tail(slots, index);
                drop(local);
                return Ok(self.init_acquired(index));
            }
            trace!("slot pool empty, draining");
            self.drain(true);
        }
    }

    fn init_acquired(&self, index: u32) -> IoHandle {
        let slot = self.registry.slot(index);
        debug_assert!(slot.flags().contains(IoFlags::UNUSED));
        slot.set_owner(self.id);
        slot.set_owner_list(owner_list::OUTSTANDING);
        slot.set_user_referenced(true);
        slot.set_system_referenced(false);
        slot.set_result(0);
        slot.reset_retries();
        slot.set_merge_next(None);
        slot.set_context(0);
        slot.set_flags(IoFlags::IDLE);
        slot.handle()
    }

    /// Drop the user reference. A slot nobody references any more goes back
    /// to the free pool with its generation bumped.
    pub fn release(&self, handle: IoHandle) {
        let slots = self.slots();
        let mut central = self.registry.central.lock();
        let Some(slot) = self.registry.deref_handle(handle) else {
            return;
        };
        debug_assert_eq!(slot.owner(), self.id, "release by a non-owner");
        if !slot.user_referenced() {
            return;
        }
        slot.set_user_referenced(false);
        let flags = slot.flags();
        if flags.contains(IoFlags::IDLE)
            || (flags.contains(IoFlags::DONE) && !slot.system_referenced())
        {
            // Not in the machinery: take it out of circulation right now.
            {
                let local = self.state().local.lock();
                local.outstanding.remove(slots, handle.index());
            }
            slot.set_owner_list(owner_list::NONE);
            self.surrender(&mut central, handle.index());
            drop(central);
            self.registry.io_signal.notify();
        } else if flags.contains(IoFlags::IN_PROGRESS)
            && !flags.contains(IoFlags::PENDING)
            && slot.owner_list() == owner_list::ISSUED
        {
            // Submitted and walked away from: completion routing now owns it.
            {
                let local = self.state().local.lock();
                local.issued.remove(slots, handle.index());
            }
            self.state().issued_abandoned.push_tail(slots, handle.index());
            slot.set_owner_list(owner_list::ABANDONED);
        }
        // Pending or completion-routed slots stay where they are; the
        // machinery frees them once the system reference drops.
    }

    /// Return a terminated slot to the local cache, or the central pool when
    /// the cache is full. Central mutex held by the caller.
    fn surrender(&self, central: &mut Central, index: u32) {
        let slots = self.slots();
        let slot = self.registry.slot(index);
        let local = self.state().local.lock();
        // Keep the cache only while the central pool has stock; a dry pool
        // means someone may be blocked in acquire right now.
        if local.unused.len() < UNUSED_CACHE && !central.free.is_empty() {
            self.scrub(central, index);
            slot.advance_generation();
            slot.set_flags(IoFlags::UNUSED);
            local.unused.push_tail(slots, index);
            slot.set_owner_list(owner_list::UNUSED);
        } else {
            drop(local);
            self.free_slot_locked(central, index);
        }
    }

    /// Drop a slot's payload: bounce reference, local callback, op (and with
    /// it any retry-opened file). Central mutex held by the caller.
    fn scrub(&self, central: &mut Central, index: u32) {
        let slot = self.registry.slot(index);
        let mut data = slot.data();
        if let Some(bounce) = data.bounce.take() {
            self.registry.release_bounce_locked(central, bounce);
        }
        data.local_cb = None;
        data.op = Op::Nop;
        drop(data);
        slot.set_result(0);
        slot.reset_retries();
        slot.set_merge_next(None);
        slot.set_system_referenced(false);
        slot.set_user_referenced(false);
    }

    /// Free a slot into the central pool. Central mutex held by the caller;
    /// the slot must be off every list.
    fn free_slot_locked(&self, central: &mut Central, index: u32) {
        let slot = self.registry.slot(index);
        self.scrub(central, index);
        slot.set_owner(NO_BACKEND);
        slot.set_owner_list(owner_list::NONE);
        slot.advance_generation();
        slot.set_flags(IoFlags::UNUSED);
        central.free.push_tail(self.slots(), index);
        central.used -= 1;
    }

    /// Reset a completed, locally-finished slot back to idle for reuse,
    /// keeping the user reference. Returns the handle of the new incarnation.
    pub fn recycle(&self, handle: IoHandle) -> io::Result<IoHandle> {
        let slot = self.registry.deref_handle(handle).ok_or_else(stale)?;
        let flags = slot.flags();
        if slot.owner() != self.id
            || !flags.contains(IoFlags::DONE)
            || !flags.contains(IoFlags::LOCAL_CB_CALLED)
            || !slot.user_referenced()
            || slot.system_referenced()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "recycle of a slot that is not locally finished",
            ));
        }
        {
            let mut central = self.registry.central.lock();
            self.scrub(&mut central, handle.index());
        }
        let slot = self.registry.slot(handle.index());
        slot.set_user_referenced(true);
        slot.advance_generation();
        slot.set_flags(IoFlags::IDLE);
        Ok(slot.handle())
    }

    // ------------------------------------------------------------------
    // Staging
    // ------------------------------------------------------------------

    /// Stage `op` on an idle slot, with the default callback for its kind.
    pub fn prepare(&self, handle: IoHandle, op: Op) -> io::Result<()> {
        let callback = CallbackId(op.kind() as u32);
        self.prepare_with(handle, op, callback)
    }

    /// Stage `op` with an explicit shared callback.
    pub fn prepare_with(&self, handle: IoHandle, op: Op, callback: CallbackId) -> io::Result<()> {
        if callback.0 as usize >= self.registry.callbacks.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unregistered shared callback",
            ));
        }
        let slot = self.registry.deref_handle(handle).ok_or_else(stale)?;
        if slot.owner() != self.id || !slot.flags().contains(IoFlags::IDLE) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "prepare on a slot that is not idle here",
            ));
        }
        trace!("prepare slot {}: {}", handle.index(), op.describe());
        slot.data().op = op;
        slot.set_callback(callback);
        slot.set_result(0);
        slot.set_system_referenced(true);
        let slots = self.slots();
        {
            let local = self.state().local.lock();
            local.outstanding.remove(slots, handle.index());
            local.pending.push_tail(slots, handle.index());
        }
        slot.set_owner_list(owner_list::PENDING);
        slot.update_flags(IoFlags::IDLE, IoFlags::IN_PROGRESS | IoFlags::PENDING);
        if self.state().local.lock().pending.len() >= SUBMIT_BATCH_LIMIT {
            self.submit_pending(false)?;
        }
        Ok(())
    }

    /// Undo a prepare that has not been submitted: back to idle.
    pub fn cancel_prepared(&self, handle: IoHandle) -> io::Result<()> {
        let slot = self.registry.deref_handle(handle).ok_or_else(stale)?;
        if slot.owner() != self.id || !slot.flags().contains(IoFlags::PENDING) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cancel of a slot that is not pending here",
            ));
        }
        let slots = self.slots();
        {
            let local = self.state().local.lock();
            local.pending.remove(slots, handle.index());
            local.outstanding.push_tail(slots, handle.index());
        }
        slot.set_owner_list(owner_list::OUTSTANDING);
        slot.set_system_referenced(false);
        slot.update_flags(
            IoFlags::IN_PROGRESS | IoFlags::PENDING | IoFlags::RETRY,
            IoFlags::IDLE,
        );
        slot.data().op = Op::Nop;
        Ok(())
    }

    /// Install a local completion callback, run in this backend only.
    pub fn set_local_callback(&self, handle: IoHandle, callback: LocalCallback) -> io::Result<()> {
        let slot = self.registry.deref_handle(handle).ok_or_else(stale)?;
        if slot.owner() != self.id || !slot.user_referenced() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "local callback on a slot not held here",
            ));
        }
        slot.data().local_cb = Some(callback);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Bounce buffers
    // ------------------------------------------------------------------

    /// Take a bounce buffer from the shared pool, blocking on completions
    /// while the pool is empty.
    pub fn acquire_bounce(&self) -> io::Result<BounceBufferRef> {
        loop {
            let popped = self.registry.central.lock().free_bounce.pop();
            if let Some(index) = popped {
                self.registry.bounce[index as usize].activate();
                return Ok(BounceBufferRef::new(self.registry.clone(), index));
            }
            trace!("bounce pool empty, draining");
            self.drain(true);
        }
    }

    /// Pin `buffer` to the slot; the slot holds its own reference until it
    /// terminates.
    pub fn associate_bounce(&self, handle: IoHandle, buffer: &BounceBufferRef) -> io::Result<()> {
        let slot = self.registry.deref_handle(handle).ok_or_else(stale)?;
        if slot.owner() != self.id || !slot.user_referenced() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "bounce buffer for a slot not held here",
            ));
        }
        self.registry.bounce[buffer.index() as usize].retain();
        let old = slot.data().bounce.replace(buffer.index());
        if let Some(old) = old {
            let mut central = self.registry.central.lock();
            self.registry.release_bounce_locked(&mut central, old);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// Push every staged op to the driver, fusing adjacent ones.
    pub fn submit(&self) -> io::Result<usize> {
        self.submit_pending(false)
    }

    pub(crate) fn submit_pending(&self, will_wait: bool) -> io::Result<usize> {
        let slots = self.slots();
        let pending = { self.state().local.lock().pending.drain(slots) };
        if pending.is_empty() {
            return Ok(0);
        }
        let heads = self.build_chains(&pending);
        {
            let local = self.state().local.lock();
            for &index in &pending {
                local.issued.push_tail(slots, index);
                self.registry.slot(index).set_owner_list(owner_list::ISSUED);
            }
        }
        self.state()
            .stats
            .issued
            .fetch_add(pending.len() as u64, Ordering::Relaxed);

        let cap = self.registry.config.io_concurrency;
        let mut submitted = 0;
        let mut next = 0;
        while next < heads.len() {
            let room = loop {
                let inflight = self.state().inflight.load(Ordering::Acquire) as usize;
                if inflight < cap {
                    break cap - inflight;
                }
                self.wait_for_oldest_inflight();
            };
            let batch = &heads[next..heads.len().min(next + room)];
            self.state().stats.submissions.fetch_add(1, Ordering::Relaxed);
            submitted += self.registry.driver.submit(
                &self.registry,
                self.id,
                batch,
                will_wait && heads.len() == 1,
            )?;
            next += batch.len();
        }
        Ok(submitted)
    }

    /// Fuse adjacent compatible ops from the drained pending list into
    /// chains, returning the chain heads in submission order.
    fn build_chains(&self, pending: &[u32]) -> Vec<u32> {
        struct Tail {
            index: u32,
            kind: crate::OpKind,
            tag: u64,
            next_offset: u64,
            buf_end: usize,
            len: usize,
            mergeable: bool,
        }

        let scatter_gather = self.registry.driver.scatter_gather();
        let mut heads: Vec<u32> = Vec::with_capacity(pending.len());
        let mut tail: Option<Tail> = None;
        for &index in pending {
            let slot = self.registry.slot(index);
            let flags = slot.flags();
            let data = slot.data();
            let op = &data.op;
            let mergeable = op.may_merge() && !flags.contains(IoFlags::RETRY);
            let facts = op.transfer().map(|t| {
                (
                    op.kind(),
                    t.target.tag().0,
                    t.offset,
                    t.len,
                    t.buf.as_ptr() as usize,
                    t.buf.end(),
                )
            });
            drop(data);

            if let (Some(prev), Some((kind, tag, offset, len, buf_start, buf_end))) =
                (&mut tail, facts)
            {
                if prev.mergeable
                    && mergeable
                    && prev.kind == kind
                    && prev.tag == tag
                    && prev.next_offset == offset
                    && prev.len < COMBINE_LIMIT
                    && (scatter_gather || prev.buf_end == buf_start)
                {
                    // Joins the current chain.
                    let joined = prev.len == 1;
                    self.registry
                        .slot(prev.index)
                        .set_merge_next(Some(index));
                    slot.update_flags(IoFlags::empty(), IoFlags::MERGE);
                    if joined {
                        self.registry
                            .slot(heads[heads.len() - 1])
                            .update_flags(IoFlags::empty(), IoFlags::MERGE);
                    }
                    self.state().stats.merged.fetch_add(
                        if joined { 2 } else { 1 },
                        Ordering::Relaxed,
                    );
                    prev.index = index;
                    prev.next_offset = offset + len as u64;
                    prev.buf_end = buf_end;
                    prev.len += 1;
                    prev.mergeable = true;
                    continue;
                }
            }

            heads.push(index);
            slot.set_merge_next(None);
            tail = facts.map(|(kind, tag, offset, len, _, buf_end)| Tail {
                index,
                kind,
                tag,
                next_offset: offset + len as u64,
                buf_end,
                len: 1,
                mergeable,
            });
        }
        heads
    }

    /// The limiter: pick the oldest inflight op of this backend, preferring
    /// still-referenced over abandoned ones, and wait for it.
    fn wait_for_oldest_inflight(&self) {
        let slots = self.slots();
        let oldest = {
            let local = self.state().local.lock();
            local
                .issued
                .iter(slots)
                .find(|&i| self.registry.slot(i).flags().contains(IoFlags::INFLIGHT))
                .map(|i| self.registry.slot(i).handle())
        };
        let oldest = oldest.or_else(|| {
            let _central = self.registry.central.lock();
            self.state()
                .issued_abandoned
                .iter(slots)
                .find(|&i| self.registry.slot(i).flags().contains(IoFlags::INFLIGHT))
                .map(|i| self.registry.slot(i).handle())
        });
        match oldest {
            Some(handle) => {
                trace!("inflight cap reached, waiting on {handle:?}");
                loop {
                    let Some(slot) = self.registry.deref_handle(handle) else {
                        break;
                    };
                    if !slot.flags().contains(IoFlags::INFLIGHT) {
                        break;
                    }
                    self.registry
                        .driver
                        .wait_one(&self.registry, self.id, handle, WAIT_SLICE);
                    self.drain(false);
                }
            }
            // Count and lists disagree transiently; let completions settle.
            None => {
                self.drain(true);
            }
        }
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    /// Collect driver completions and run every piece of completion work
    /// owed by this backend. Returns the number of ops whose shared callback
    /// ran here.
    pub fn drain(&self, block: bool) -> usize {
        self.registry.driver.drain(&self.registry, self.id, block);
        let executed = self.dispatch_reaped();
        self.retry_uncompleted();
        self.drain_foreign();
        self.dispatch_local();
        executed
    }

    /// Process this backend's reaped list: split chains, run shared
    /// callbacks, route or recycle the slots.
    fn dispatch_reaped(&self) -> usize {
        let slots = self.slots();
        let mut executed = 0;
        loop {
            let head = { self.state().local.lock().reaped.pop_head(slots) };
            let Some(head) = head else {
                break;
            };
            executed += self.complete_chain(head);
        }
        executed
    }

    fn complete_chain(&self, head: u32) -> usize {
        let registry = &self.registry;
        let slots = self.slots();

        // Re-expand the chain before anything else sees the members.
        let mut members = vec![head];
        while let Some(next) = registry.slot(*members.last().unwrap()).merge_next() {
            members.push(next);
        }
        if members.len() > 1 {
            let lens: Vec<usize> = members
                .iter()
                .map(|&i| {
                    registry
                        .slot(i)
                        .data()
                        .op
                        .transfer()
                        .map(|t| t.remaining())
                        .unwrap_or(0)
                })
                .collect();
            let parts = split_result(registry.slot(head).result(), &lens);
            for (&index, part) in members.iter().zip(parts) {
                registry.slot(index).set_result(part);
            }
        }
        for &index in &members {
            let slot = registry.slot(index);
            slot.set_merge_next(None);
            let flags = slot.flags();
            let mut clear = IoFlags::MERGE;
            let mut set = IoFlags::empty();
            if !flags.contains(IoFlags::REAPED) {
                clear |= IoFlags::INFLIGHT;
                set |= IoFlags::REAPED;
            }
            slot.update_flags(clear, set);
        }

        // One kernel entry came back; one kernel entry leaves the window.
        let initiator = registry.slot(head).owner();
        registry.backends[initiator as usize]
            .inflight
            .fetch_sub(1, Ordering::AcqRel);

        let mut recycle = Vec::with_capacity(members.len());
        let mut executed = 0;
        for &index in &members {
            let slot = registry.slot(index);
            if slot.flags().contains(IoFlags::SHARED_CB_CALLED) {
                recycle.push(index);
                continue;
            }
            let callback = registry.callbacks[slot.callback().0 as usize].clone();
            let verdict;
            let result;
            {
                let mut data = slot.data();
                let mut io = SharedIo {
                    op: &mut data.op,
                    result: slot.result(),
                    retries: slot.retries(),
                    retry_cap: registry.config.max_retries,
                };
                verdict = callback.io_completed(&mut io);
                result = io.result;
            }
            slot.set_result(result);
            slot.update_flags(IoFlags::empty(), IoFlags::SHARED_CB_CALLED);
            executed += 1;
            match verdict {
                Completion::Retry => {
                    assert!(
                        slot.data().op.retryable(),
                        "retry requested for a non-retryable op"
                    );
                    if result >= 0 {
                        self.state()
                            .stats
                            .short_transfers
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    debug!("slot {index} soft-failed (result {result}), parking for retry");
                    let mut central = registry.central.lock();
                    slot.update_flags(
                        IoFlags::IN_PROGRESS | IoFlags::REAPED,
                        IoFlags::DONE | IoFlags::SOFT_FAILED | IoFlags::SHARED_FAILED,
                    );
                    central.uncompleted.push_tail(slots, index);
                    drop(central);
                    slot.notify_waiters();
                    registry.io_signal.notify();
                }
                Completion::Finished => {
                    if result < 0 {
                        slot.update_flags(IoFlags::empty(), IoFlags::HARD_FAILED);
                    }
                    recycle.push(index);
                }
            }
        }
        self.state()
            .stats
            .executed
            .fetch_add(executed as u64, Ordering::Relaxed);

        for &index in &recycle {
            self.route_completed(index);
        }
        executed
    }

    /// Route one finished op: to its initiator's completion lists while it is
    /// still user-referenced, otherwise straight back to the free pool.
    fn route_completed(&self, index: u32) {
        let registry = &self.registry;
        let slots = self.slots();
        let slot = registry.slot(index);
        let initiator = slot.owner();
        let mut central = registry.central.lock();
        if slot.user_referenced() {
            let foreign = initiator != self.id;
            slot.update_flags(
                IoFlags::IN_PROGRESS | IoFlags::REAPED,
                if foreign {
                    IoFlags::DONE | IoFlags::FOREIGN_DONE
                } else {
                    IoFlags::DONE
                },
            );
            drop(central);
            let target = &registry.backends[initiator as usize];
            if foreign {
                target.foreign_completed.lock().push_tail(slots, index);
                target.stats.foreign.fetch_add(1, Ordering::Relaxed);
            } else {
                self.state().local.lock().local_completed.push_tail(slots, index);
            }
        } else {
            // Abandoned: unlink from whichever owner list still holds it,
            // then free.
            let target = &registry.backends[initiator as usize];
            match slot.owner_list() {
                owner_list::ABANDONED => target.issued_abandoned.remove(slots, index),
                owner_list::ISSUED => target.local.lock().issued.remove(slots, index),
                other => unreachable!("abandoned slot on owner list {other}"),
            }
            slot.set_owner_list(owner_list::NONE);
            slot.update_flags(IoFlags::IN_PROGRESS | IoFlags::REAPED, IoFlags::DONE);
            self.free_slot_locked(&mut central, index);
            drop(central);
        }
        slot.notify_waiters();
        registry.io_signal.notify();
    }

    /// Move completions other backends routed to us onto the local list.
    fn drain_foreign(&self) {
        let slots = self.slots();
        loop {
            let index = { self.state().foreign_completed.lock().pop_head(slots) };
            let Some(index) = index else {
                break;
            };
            let slot = self.registry.slot(index);
            slot.update_flags(IoFlags::FOREIGN_DONE, IoFlags::empty());
            self.state().local.lock().local_completed.push_tail(slots, index);
        }
    }

    /// Run local callbacks, serially; reentry from a callback is a no-op.
    fn dispatch_local(&self) {
        if self.in_local_dispatch.get() {
            return;
        }
        self.in_local_dispatch.set(true);
        let slots = self.slots();
        loop {
            let index = { self.state().local.lock().local_completed.pop_head(slots) };
            let Some(index) = index else {
                break;
            };
            self.finish_local(index);
        }
        self.in_local_dispatch.set(false);
    }

    fn finish_local(&self, index: u32) {
        let registry = &self.registry;
        let slots = self.slots();
        let slot = registry.slot(index);
        debug_assert_eq!(slot.owner(), self.id);
        {
            let local = self.state().local.lock();
            local.issued.remove(slots, index);
            local.outstanding.push_tail(slots, index);
        }
        slot.set_owner_list(owner_list::OUTSTANDING);
        let callback = slot.data().local_cb.take();
        if let Some(callback) = callback {
            let failed = slot.flags().contains(IoFlags::HARD_FAILED);
            let data = slot.data();
            callback(LocalIo {
                handle: slot.handle(),
                op: &data.op,
                result: slot.result(),
                failed,
            });
        }
        slot.update_flags(IoFlags::empty(), IoFlags::LOCAL_CB_CALLED);
        slot.set_system_referenced(false);
        if !slot.user_referenced() {
            {
                let local = self.state().local.lock();
                local.outstanding.remove(slots, index);
            }
            slot.set_owner_list(owner_list::NONE);
            let mut central = registry.central.lock();
            self.free_slot_locked(&mut central, index);
            drop(central);
            registry.io_signal.notify();
        }
        slot.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Waiting
    // ------------------------------------------------------------------

    /// Wait for the op behind `handle`. Returns the final result; a stale
    /// handle returns `Ok(0)` (the op completed and its slot moved on).
    /// Hard failures surface as errors.
    pub fn wait(&self, handle: IoHandle) -> io::Result<i64> {
        let registry = &self.registry;
        loop {
            let Some(slot) = registry.deref_handle(handle) else {
                return Ok(0);
            };
            let flags = slot.flags();
            if flags.contains(IoFlags::DONE) {
                if flags.contains(IoFlags::SOFT_FAILED) {
                    self.retry_one(handle.index())?;
                    continue;
                }
                break;
            }
            if flags.contains(IoFlags::PENDING)
                && !flags.contains(IoFlags::RETRY)
                && slot.owner() == self.id
            {
                self.submit_pending(true)?;
                continue;
            }
            if self.drain(false) > 0 {
                continue;
            }
            if !self.state().local.lock().pending.is_empty() {
                // Someone else may be waiting on work we have staged.
                self.submit_pending(false)?;
                continue;
            }
            // The completion may only reach us through another backend, so
            // every sleep is bounded.
            registry
                .driver
                .wait_one(registry, self.id, handle, WAIT_SLICE);
            self.drain(false);
        }

        // Done and not retryable: finish the local side if it is ours.
        loop {
            let Some(slot) = registry.deref_handle(handle) else {
                return Ok(0);
            };
            if slot.owner() != self.id || slot.flags().contains(IoFlags::LOCAL_CB_CALLED) {
                break;
            }
            self.drain(false);
            let Some(slot) = registry.deref_handle(handle) else {
                return Ok(0);
            };
            if slot.flags().contains(IoFlags::LOCAL_CB_CALLED) {
                break;
            }
            slot.wait_until(Some(WAIT_SLICE), |s| {
                s.flags().contains(IoFlags::LOCAL_CB_CALLED)
            });
        }

        let Some(slot) = registry.deref_handle(handle) else {
            return Ok(0);
        };
        let result = slot.result();
        if slot.flags().contains(IoFlags::HARD_FAILED) {
            warn!(
                "I/O failed on slot {}: {}",
                handle.index(),
                slot.data().op.describe()
            );
            return Err(io::Error::from_raw_os_error((-result) as i32));
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Retry
    // ------------------------------------------------------------------

    /// Retry everything parked on the central uncompleted list. `retry_one`
    /// unlinks the slot whichever way it goes, so the loop terminates.
    fn retry_uncompleted(&self) -> usize {
        let mut retried = 0;
        loop {
            let index = { self.registry.central.lock().uncompleted.first() };
            let Some(index) = index else {
                break;
            };
            let _ = self.retry_one(index);
            retried += 1;
        }
        retried
    }

    /// Re-issue one soft-failed op: re-open its file from the tag and submit
    /// it as a singleton batch (retries never merge).
    fn retry_one(&self, index: u32) -> io::Result<()> {
        let registry = &self.registry;
        let slots = self.slots();
        let slot = registry.slot(index);

        let mut exhausted = false;
        {
            let mut central = registry.central.lock();
            if !slot.flags().contains(IoFlags::SHARED_FAILED) {
                // Somebody else already took it.
                return Ok(());
            }
            assert!(
                slot.data().op.retryable(),
                "retry of a non-retryable op kind"
            );
            central.uncompleted.remove(slots, index);
            let attempts = slot.bump_retries();
            if attempts > registry.config.max_retries {
                slot.update_flags(
                    IoFlags::SOFT_FAILED | IoFlags::SHARED_FAILED,
                    IoFlags::HARD_FAILED,
                );
                if slot.result() >= 0 {
                    slot.set_result(crate::op::ERR_IO);
                }
                exhausted = true;
            } else {
                slot.update_flags(
                    IoFlags::DONE
                        | IoFlags::SOFT_FAILED
                        | IoFlags::SHARED_FAILED
                        | IoFlags::HARD_FAILED
                        | IoFlags::SHARED_CB_CALLED
                        | IoFlags::DRIVER_RETURNED,
                    IoFlags::IN_PROGRESS | IoFlags::PENDING | IoFlags::RETRY,
                );
            }
        }
        if exhausted {
            debug!("slot {index} out of retries");
            self.route_failed_final(index);
            return Ok(());
        }
        self.state().stats.retries.fetch_add(1, Ordering::Relaxed);

        // Re-open from the tag, outside any lock. The previous descriptor may
        // belong to another backend or be closed by now.
        let tag = {
            let data = slot.data();
            data.op.target().expect("retryable op without a target").tag()
        };
        match registry.reopen.reopen(tag) {
            Ok(file) => {
                let mut data = slot.data();
                if let Some(transfer) = data.op.transfer_mut() {
                    transfer.target.adopt(file);
                }
            }
            Err(e) => {
                warn!("re-open of {tag:?} failed, abandoning retry: {e}");
                slot.set_result(err_result(&e));
                slot.update_flags(
                    IoFlags::IN_PROGRESS | IoFlags::PENDING | IoFlags::RETRY,
                    IoFlags::DONE | IoFlags::HARD_FAILED,
                );
                self.route_failed_final(index);
                return Ok(());
            }
        }
        debug!("retrying slot {index} (attempt {})", slot.retries());
        registry
            .driver
            .submit(registry, self.id, &[index], true)?;
        Ok(())
    }

    /// Route an op that died in the retry path. It already carries
    /// DONE|HARD_FAILED and sits on no io-role list; the inflight window was
    /// already credited when it was reaped.
    fn route_failed_final(&self, index: u32) {
        let registry = &self.registry;
        let slots = self.slots();
        let slot = registry.slot(index);
        let initiator = slot.owner();
        let mut central = registry.central.lock();
        if slot.user_referenced() {
            let foreign = initiator != self.id;
            if foreign {
                slot.update_flags(IoFlags::empty(), IoFlags::FOREIGN_DONE);
            }
            drop(central);
            let target = &registry.backends[initiator as usize];
            if foreign {
                target.foreign_completed.lock().push_tail(slots, index);
                target.stats.foreign.fetch_add(1, Ordering::Relaxed);
            } else {
                self.state().local.lock().local_completed.push_tail(slots, index);
            }
        } else {
            let target = &registry.backends[initiator as usize];
            match slot.owner_list() {
                owner_list::ABANDONED => target.issued_abandoned.remove(slots, index),
                owner_list::ISSUED => target.local.lock().issued.remove(slots, index),
                other => unreachable!("abandoned slot on owner list {other}"),
            }
            slot.set_owner_list(owner_list::NONE);
            self.free_slot_locked(&mut central, index);
            drop(central);
        }
        slot.notify_waiters();
        registry.io_signal.notify();
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Detach from the group: submit or wait out everything this backend
    /// still touches, then give the backend id back.
    pub fn close(mut self) -> io::Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> io::Result<()> {
        if self.closed.get() {
            return Ok(());
        }
        let slots = self.slots();
        self.submit_pending(false)?;
        loop {
            let handle = {
                let local = self.state().local.lock();
                local.issued.first().map(|i| self.registry.slot(i).handle())
            };
            let handle = handle.or_else(|| {
                let _central = self.registry.central.lock();
                self.state()
                    .issued_abandoned
                    .first()
                    .map(|i| self.registry.slot(i).handle())
            });
            let Some(handle) = handle else {
                break;
            };
            let _ = self.wait(handle);
            self.drain(false);
        }
        // Handles the caller leaked: released here so the slots drain out.
        loop {
            let index = { self.state().local.lock().outstanding.first() };
            let Some(index) = index else {
                break;
            };
            self.release(self.registry.slot(index).handle());
        }
        // Flush the local free cache back to the pool.
        loop {
            let index = { self.state().local.lock().unused.pop_head(slots) };
            let Some(index) = index else {
                break;
            };
            let slot = self.registry.slot(index);
            slot.set_owner(NO_BACKEND);
            slot.set_owner_list(owner_list::NONE);
            let mut central = self.registry.central.lock();
            central.free.push_tail(slots, index);
            central.used -= 1;
        }
        let state = self.state();
        {
            let local = state.local.lock();
            debug_assert!(local.pending.is_empty());
            debug_assert!(local.issued.is_empty());
            debug_assert!(local.reaped.is_empty());
            debug_assert!(local.local_completed.is_empty());
            debug_assert!(local.outstanding.is_empty());
        }
        debug_assert!(state.foreign_completed.lock().is_empty());
        debug_assert_eq!(state.inflight.load(Ordering::Acquire), 0);
        state.attached.store(false, Ordering::Release);
        self.closed.set(true);
        trace!("backend {} detached", self.id);
        Ok(())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if !self.closed.get() {
            if let Err(e) = self.close_inner() {
                warn!("backend {} close failed: {e}", self.id);
            }
        }
    }
}

/// Fan a single kernel result out over a fused chain, preserving prefix
/// semantics: every member gets its full length until the result runs out,
/// the first short member gets the remainder, later members get zero; a
/// negative result is copied to every member.
pub(crate) fn split_result(head_result: i64, lens: &[usize]) -> Vec<i64> {
    if head_result < 0 {
        return vec![head_result; lens.len()];
    }
    let mut remaining = head_result as usize;
    lens.iter()
        .map(|&len| {
            let take = remaining.min(len);
            remaining -= take;
            take as i64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_preserves_prefix() {
        let lens = [8192usize, 8192, 8192, 8192];
        assert_eq!(split_result(32768, &lens), vec![8192, 8192, 8192, 8192]);
        assert_eq!(split_result(20000, &lens), vec![8192, 8192, 3616, 0]);
        assert_eq!(split_result(0, &lens), vec![0, 0, 0, 0]);
        assert_eq!(split_result(-5, &lens), vec![-5, -5, -5, -5]);
    }

    #[test]
    fn split_sum_matches_result() {
        let lens = [4096usize, 512, 8192];
        for result in [0i64, 100, 4096, 4608, 9000, 12800] {
            let parts = split_result(result, &lens);
            let total: i64 = parts.iter().sum();
            assert_eq!(total, result.min(lens.iter().sum::<usize>() as i64));
        }
    }
}
