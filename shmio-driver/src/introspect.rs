//! Diagnostic snapshots of backends and slots.
//!
//! Gauges are read without taking the owning locks: a snapshot is a
//! diagnostic sample, not a consistent cut, and must never stall the engine.

use std::{fmt, sync::atomic::Ordering};

use crate::{registry::AioRegistry, slot::NO_BACKEND};

/// One backend's counters and gauges.
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    /// Backend id.
    pub id: u32,
    /// Whether a participant currently holds the id.
    pub attached: bool,
    /// Shared callbacks run by this backend.
    pub executed: u64,
    /// Logical ops this backend has submitted.
    pub issued: u64,
    /// Driver submission batches.
    pub submissions: u64,
    /// Ops fused into multi-op chains.
    pub merged: u64,
    /// Completions routed here from other backends.
    pub foreign_completed: u64,
    /// Soft-failure retries issued.
    pub retries: u64,
    /// Ops executed synchronously in the submitting backend.
    pub synchronous: u64,
    /// Transfers that came back short.
    pub short_transfers: u64,
    /// Current local free-cache length.
    pub unused: usize,
    /// Slots held but not staged.
    pub outstanding: usize,
    /// Slots staged and unsubmitted.
    pub pending: usize,
    /// Slots submitted and still referenced.
    pub issued_now: usize,
    /// Slots submitted and abandoned.
    pub issued_abandoned: usize,
    /// Completions awaiting the local callback.
    pub local_completed: usize,
    /// Foreign completions not yet transferred.
    pub foreign_pending: usize,
    /// Kernel entries in the air.
    pub inflight: u64,
    /// Driver context used by the last submission.
    pub last_context: u32,
}

impl BackendSnapshot {
    /// Column header matching [`fmt::Display`] output.
    pub const HEADER: &'static str = "id   exec   issued  subs  merged  foreign  retry  sync  \
                                      short | unus outst pend issd aband lcomp fcomp infl ctx";
}

impl fmt::Display for BackendSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<4} {:<6} {:<7} {:<5} {:<7} {:<8} {:<6} {:<5} {:<5} | {:<4} {:<5} {:<4} {:<4} \
             {:<5} {:<5} {:<5} {:<4} {}",
            self.id,
            self.executed,
            self.issued,
            self.submissions,
            self.merged,
            self.foreign_completed,
            self.retries,
            self.synchronous,
            self.short_transfers,
            self.unused,
            self.outstanding,
            self.pending,
            self.issued_now,
            self.issued_abandoned,
            self.local_completed,
            self.foreign_pending,
            self.inflight,
            self.last_context,
        )
    }
}

/// One slot's diagnostic view.
#[derive(Debug, Clone)]
pub struct SlotSnapshot {
    /// Slot index.
    pub index: u32,
    /// Operation kind name.
    pub op: &'static str,
    /// Rendered flag set.
    pub flags: String,
    /// Bound driver context.
    pub context: u32,
    /// Initiating backend, or `None` for a free slot.
    pub owner: Option<u32>,
    /// Current generation.
    pub generation: u64,
    /// Raw result value.
    pub result: i64,
    /// Rendered op parameters.
    pub params: String,
}

impl fmt::Display for SlotSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<5} {:<14} {:<40} ctx {:<3} owner {:<4} gen {:<6} res {:<8} {}",
            self.index,
            self.op,
            self.flags,
            self.context,
            match self.owner {
                Some(owner) => owner.to_string(),
                None => "-".into(),
            },
            self.generation,
            self.result,
            self.params,
        )
    }
}

impl AioRegistry {
    /// Sample every backend.
    pub fn backend_snapshots(&self) -> Vec<BackendSnapshot> {
        self.backends
            .iter()
            .enumerate()
            .map(|(id, state)| {
                let local = state.local.lock();
                BackendSnapshot {
                    id: id as u32,
                    attached: state.attached.load(Ordering::Acquire),
                    executed: state.stats.executed.load(Ordering::Relaxed),
                    issued: state.stats.issued.load(Ordering::Relaxed),
                    submissions: state.stats.submissions.load(Ordering::Relaxed),
                    merged: state.stats.merged.load(Ordering::Relaxed),
                    foreign_completed: state.stats.foreign.load(Ordering::Relaxed),
                    retries: state.stats.retries.load(Ordering::Relaxed),
                    synchronous: state.stats.synchronous.load(Ordering::Relaxed),
                    short_transfers: state.stats.short_transfers.load(Ordering::Relaxed),
                    unused: local.unused.len(),
                    outstanding: local.outstanding.len(),
                    pending: local.pending.len(),
                    issued_now: local.issued.len(),
                    issued_abandoned: state.issued_abandoned.len(),
                    local_completed: local.local_completed.len(),
                    foreign_pending: state.foreign_completed.lock().len(),
                    inflight: state.inflight.load(Ordering::Acquire),
                    last_context: state.last_context.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    /// Sample every slot.
    pub fn slot_snapshots(&self) -> Vec<SlotSnapshot> {
        self.slots
            .iter()
            .map(|slot| {
                let data = slot.data();
                SlotSnapshot {
                    index: slot.index(),
                    op: data.op.kind().name(),
                    flags: slot.flags().render(),
                    context: slot.context(),
                    owner: match slot.owner() {
                        NO_BACKEND => None,
                        owner => Some(owner),
                    },
                    generation: slot.generation(),
                    result: slot.result(),
                    params: data.op.describe(),
                }
            })
            .collect()
    }
}
