//! The shared I/O slot record.
//!
//! A slot is one fixed entry of the shared table. Its `flags`, `generation`
//! and `result` fields are written only by whichever backend currently owns
//! the slot according to the state machine (or under the central mutex);
//! everyone else reads them with acquire ordering and re-checks the
//! generation to detect reuse.

use std::{
    sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{
    handle::IoHandle,
    list::{ListNode, ListRole, NO_SLOT},
    op::{CallbackId, Op},
};

/// Sentinel backend id meaning "nobody".
pub(crate) const NO_BACKEND: u32 = u32::MAX;

bitflags! {
    /// Lifecycle flags of a slot.
    ///
    /// Exactly one of `UNUSED`, `IDLE`, `IN_PROGRESS`, `DONE` is set at any
    /// observable moment; while `IN_PROGRESS`, exactly one of `PENDING`,
    /// `INFLIGHT`, `REAPED` is set. The remaining bits qualify those states.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IoFlags: u32 {
        /// In a free pool, unowned.
        const UNUSED = 1 << 0;
        /// Acquired, no operation prepared yet.
        const IDLE = 1 << 1;
        /// Carrying an operation.
        const IN_PROGRESS = 1 << 2;
        /// Staged on the owner's pending list.
        const PENDING = 1 << 3;
        /// Submitted to the kernel.
        const INFLIGHT = 1 << 4;
        /// Completion received, shared callback not yet run.
        const REAPED = 1 << 5;
        /// The shared callback has run.
        const SHARED_CB_CALLED = 1 << 6;
        /// The local callback has run.
        const LOCAL_CB_CALLED = 1 << 7;
        /// Terminal for this operation.
        const DONE = 1 << 8;
        /// Completed by a backend other than the initiator; parked on the
        /// initiator's foreign-completed list.
        const FOREIGN_DONE = 1 << 9;
        /// Member of a fused chain.
        const MERGE = 1 << 10;
        /// Re-issued after a soft failure.
        const RETRY = 1 << 11;
        /// Failed for good.
        const HARD_FAILED = 1 << 12;
        /// Failed in a way worth retrying.
        const SOFT_FAILED = 1 << 13;
        /// The shared callback reported the failure; the op sits on the
        /// central uncompleted list until someone retries it.
        const SHARED_FAILED = 1 << 14;
        /// The driver's submit call has returned for this slot.
        const DRIVER_RETURNED = 1 << 15;
    }
}

impl IoFlags {
    const STATE: IoFlags = IoFlags::UNUSED
        .union(IoFlags::IDLE)
        .union(IoFlags::IN_PROGRESS)
        .union(IoFlags::DONE);
    const PHASE: IoFlags = IoFlags::PENDING
        .union(IoFlags::INFLIGHT)
        .union(IoFlags::REAPED);

    /// Render as a compact `a|b|c` string for diagnostics.
    pub fn render(&self) -> String {
        let names: Vec<&str> = self.iter_names().map(|(name, _)| name).collect();
        if names.is_empty() {
            "-".into()
        } else {
            names.join("|")
        }
    }

    fn consistent(&self) -> bool {
        if self.intersection(Self::STATE).bits().count_ones() != 1 {
            return false;
        }
        let phases = self.intersection(Self::PHASE).bits().count_ones();
        if self.contains(IoFlags::IN_PROGRESS) {
            phases == 1
        } else {
            phases == 0
        }
    }
}

/// Mutable payload of a slot, guarded by the slot's data mutex. Written by
/// the owner at prepare time, read by whichever backend executes or
/// completes the op.
pub(crate) struct SlotData {
    pub op: Op,
    pub local_cb: Option<LocalCallback>,
    pub bounce: Option<u32>,
}

/// Per-slot local completion callback, run only in the initiating backend.
///
/// The callback runs with the slot's payload borrowed; it must not call back
/// into the engine for the same slot.
pub type LocalCallback = Box<dyn FnOnce(LocalIo<'_>) + Send>;

/// What a local callback sees.
pub struct LocalIo<'a> {
    /// Handle of the completed op.
    pub handle: IoHandle,
    /// The op parameters.
    pub op: &'a Op,
    /// Final result: negative error code or byte count.
    pub result: i64,
    /// Whether the op failed for good.
    pub failed: bool,
}

struct SlotSync {
    lock: Mutex<()>,
    cond: Condvar,
}

/// One entry of the shared I/O table.
pub struct IoSlot {
    index: u32,
    flags: AtomicU32,
    generation: AtomicU64,
    result: AtomicI64,
    owner: AtomicU32,
    context: AtomicU32,
    user_ref: AtomicBool,
    system_ref: AtomicBool,
    callback: AtomicU32,
    retries: AtomicU32,
    merge_next: AtomicU32,
    owner_list: AtomicU8,
    driver_private: AtomicU64,
    owner_link: ListNode,
    io_link: ListNode,
    sync: SlotSync,
    data: Mutex<SlotData>,
}

impl IoSlot {
    pub(crate) fn new(index: u32) -> Self {
        Self {
            index,
            flags: AtomicU32::new(IoFlags::UNUSED.bits()),
            generation: AtomicU64::new(1),
            result: AtomicI64::new(0),
            owner: AtomicU32::new(NO_BACKEND),
            context: AtomicU32::new(0),
            user_ref: AtomicBool::new(false),
            system_ref: AtomicBool::new(false),
            callback: AtomicU32::new(0),
            retries: AtomicU32::new(0),
            merge_next: AtomicU32::new(NO_SLOT),
            owner_list: AtomicU8::new(0),
            driver_private: AtomicU64::new(0),
            owner_link: ListNode::new(),
            io_link: ListNode::new(),
            sync: SlotSync {
                lock: Mutex::new(()),
                cond: Condvar::new(),
            },
            data: Mutex::new(SlotData {
                op: Op::Nop,
                local_cb: None,
                bounce: None,
            }),
        }
    }

    /// Index of the slot in the shared table.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn link(&self, role: ListRole) -> &ListNode {
        match role {
            ListRole::Owner => &self.owner_link,
            ListRole::Io => &self.io_link,
        }
    }

    /// Current flags, acquire-ordered.
    pub fn flags(&self) -> IoFlags {
        IoFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Replace the whole flag set. Owner-side writes only.
    pub(crate) fn set_flags(&self, flags: IoFlags) {
        debug_assert!(flags.consistent(), "inconsistent flags {}", flags.render());
        self.flags.store(flags.bits(), Ordering::Release);
    }

    /// Clear then set bits in one release store. Owner-side writes only.
    pub(crate) fn update_flags(&self, clear: IoFlags, set: IoFlags) {
        let flags = self.flags().difference(clear).union(set);
        self.set_flags(flags);
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Bump the generation; paired with the flag transition back to unused
    /// or idle. Sequentially consistent so that stale handle checks in other
    /// processes cannot observe the old generation with the new flags.
    pub(crate) fn advance_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Handle of the slot as of now.
    pub fn handle(&self) -> IoHandle {
        IoHandle::new(self.index, self.generation())
    }

    pub(crate) fn result(&self) -> i64 {
        self.result.load(Ordering::Acquire)
    }

    pub(crate) fn set_result(&self, result: i64) {
        self.result.store(result, Ordering::Release);
    }

    pub(crate) fn owner(&self) -> u32 {
        self.owner.load(Ordering::Acquire)
    }

    pub(crate) fn set_owner(&self, owner: u32) {
        self.owner.store(owner, Ordering::Release);
    }

    pub(crate) fn context(&self) -> u32 {
        self.context.load(Ordering::Acquire)
    }

    pub(crate) fn set_context(&self, context: u32) {
        self.context.store(context, Ordering::Release);
    }

    pub(crate) fn user_referenced(&self) -> bool {
        self.user_ref.load(Ordering::Acquire)
    }

    pub(crate) fn set_user_referenced(&self, referenced: bool) {
        self.user_ref.store(referenced, Ordering::Release);
    }

    pub(crate) fn system_referenced(&self) -> bool {
        self.system_ref.load(Ordering::Acquire)
    }

    pub(crate) fn set_system_referenced(&self, referenced: bool) {
        self.system_ref.store(referenced, Ordering::Release);
    }

    pub(crate) fn callback(&self) -> CallbackId {
        CallbackId(self.callback.load(Ordering::Acquire))
    }

    pub(crate) fn set_callback(&self, id: CallbackId) {
        self.callback.store(id.0, Ordering::Release);
    }

    pub(crate) fn retries(&self) -> u32 {
        self.retries.load(Ordering::Acquire)
    }

    pub(crate) fn bump_retries(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn reset_retries(&self) {
        self.retries.store(0, Ordering::Release);
    }

    pub(crate) fn merge_next(&self) -> Option<u32> {
        match self.merge_next.load(Ordering::Acquire) {
            NO_SLOT => None,
            next => Some(next),
        }
    }

    pub(crate) fn set_merge_next(&self, next: Option<u32>) {
        self.merge_next
            .store(next.unwrap_or(NO_SLOT), Ordering::Release);
    }

    /// Which owner-role list the slot is linked on; values in
    /// [`owner_list`](crate::backend::owner_list). Lets a completer that is
    /// not the owner unlink an abandoned slot under the right lock.
    pub(crate) fn owner_list(&self) -> u8 {
        self.owner_list.load(Ordering::Acquire)
    }

    pub(crate) fn set_owner_list(&self, which: u8) {
        self.owner_list.store(which, Ordering::Release);
    }

    pub(crate) fn driver_private(&self) -> u64 {
        self.driver_private.load(Ordering::Acquire)
    }

    pub(crate) fn set_driver_private(&self, value: u64) {
        self.driver_private.store(value, Ordering::Release);
    }

    pub(crate) fn data(&self) -> MutexGuard<'_, SlotData> {
        self.data.lock()
    }

    /// Wake every waiter parked on this slot.
    pub(crate) fn notify_waiters(&self) {
        // Taking the lock orders the wakeup after the waiter's check.
        drop(self.sync.lock.lock());
        self.sync.cond.notify_all();
    }

    /// Park until `pred` holds or `timeout` expires. Returns the final
    /// verdict of `pred`; spurious wakeups re-check.
    pub(crate) fn wait_until(
        &self,
        timeout: Option<Duration>,
        pred: impl Fn(&IoSlot) -> bool,
    ) -> bool {
        let mut guard = self.sync.lock.lock();
        loop {
            if pred(self) {
                return true;
            }
            match timeout {
                Some(timeout) => {
                    if self.sync.cond.wait_for(&mut guard, timeout).timed_out() {
                        return pred(self);
                    }
                }
                None => self.sync.cond.wait(&mut guard),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_partition_is_checked() {
        assert!(IoFlags::UNUSED.consistent());
        assert!(IoFlags::IDLE.consistent());
        assert!((IoFlags::IN_PROGRESS | IoFlags::PENDING).consistent());
        assert!((IoFlags::IN_PROGRESS | IoFlags::INFLIGHT | IoFlags::MERGE).consistent());
        assert!((IoFlags::DONE | IoFlags::HARD_FAILED).consistent());

        assert!(!(IoFlags::UNUSED | IoFlags::IDLE).consistent());
        assert!(!IoFlags::IN_PROGRESS.consistent());
        assert!(!(IoFlags::IN_PROGRESS | IoFlags::PENDING | IoFlags::REAPED).consistent());
        assert!(!(IoFlags::DONE | IoFlags::PENDING).consistent());
    }

    #[test]
    fn render_flags() {
        assert_eq!(IoFlags::empty().render(), "-");
        assert_eq!(
            (IoFlags::IN_PROGRESS | IoFlags::INFLIGHT).render(),
            "IN_PROGRESS|INFLIGHT"
        );
    }

    #[test]
    fn generation_advances() {
        let slot = IoSlot::new(0);
        let h = slot.handle();
        slot.advance_generation();
        assert_ne!(slot.handle(), h);
        assert_eq!(slot.index(), 0);
    }

    #[test]
    fn wait_until_times_out() {
        let slot = IoSlot::new(0);
        assert!(!slot.wait_until(Some(Duration::from_millis(10)), |s| {
            s.flags().contains(IoFlags::DONE)
        }));
        slot.set_flags(IoFlags::DONE);
        assert!(slot.wait_until(Some(Duration::from_millis(10)), |s| {
            s.flags().contains(IoFlags::DONE)
        }));
    }
}
