//! Buffer primitives for shared-memory I/O.
//!
//! The engine passes raw buffer addresses through a shared slot table, so the
//! types here carry explicit ownership and sharing contracts instead of
//! borrows: [`AlignedBuf`] owns page-aligned memory, [`IoPtr`] is an unowned
//! address range handed to the kernel, and [`BounceBuffer`] is a refcounted
//! aligned buffer suitable for drivers that cannot reach caller-private
//! memory.

#![warn(missing_docs)]

mod align;
pub use align::*;

mod ptr;
pub use ptr::*;

mod bounce;
pub use bounce::*;

/// Alignment of every buffer handed to a kernel driver.
///
/// Matches the common page size; direct I/O paths on every supported platform
/// accept this alignment.
pub const IO_ALIGN: usize = 4096;
