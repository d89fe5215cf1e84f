use std::fmt;

/// A stable reference to an I/O slot: the slot index paired with the slot
/// generation observed when the reference was taken.
///
/// Slots are recycled aggressively, so a bare index dangles the moment its
/// operation finishes. Every dereference re-checks the generation; a mismatch
/// means the operation completed and the slot now serves someone else, which
/// observers treat as "complete" for the referent. Handles are plain values
/// and stay meaningful across process boundaries.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoHandle {
    index: u32,
    generation: u64,
}

impl IoHandle {
    pub(crate) fn new(index: u32, generation: u64) -> Self {
        Self { index, generation }
    }

    /// The slot index this handle refers to.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The slot generation captured when the handle was taken.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IoHandle({}@{})", self.index, self.generation)
    }
}
