//! Sub-allocation of device memory blocks.
//!
//! Device drivers hand out memory in large, coarse-grained blocks and impose
//! a small limit on how many such blocks can exist at once. An application
//! that needs thousands of buffers and images therefore cannot ask the driver
//! for each one individually: it has to carve many small, precisely placed
//! allocations out of a few large blocks itself. This crate implements that
//! carving.
//!
//! - The [`Allocator`](allocator::Allocator) is the top-level object. It is
//!   created once, with a [`MemoryBackend`](backend::MemoryBackend)
//!   implementation injected, and owns one block list per backend memory
//!   type. For every request it picks the most fitting memory type and
//!   decides between sub-allocating from a shared block and handing out a
//!   dedicated block.
//! - [`Allocation`](allocation::Allocation)s are what callers get back. They
//!   free themselves when dropped, can be mapped for host access, and can
//!   opt into an eviction protocol that retires long-unused allocations
//!   under memory pressure (see the [`allocation`] module).
//! - [`Pool`](pool::Pool)s are independently configured groups of blocks,
//!   for callers that need their own block size, placement algorithm or
//!   eviction window.
//! - The [`metadata`] module holds the per-block bookkeeping engines: a
//!   general free-list, a linear ring/stack, and a buddy tree.
//!
//! This crate never talks to an operating system or a driver by itself;
//! every backend interaction goes through the `MemoryBackend` trait object
//! given at construction. It also never touches the memory it manages: it
//! only does offset arithmetic inside blocks the backend reports.

use std::{error::Error, fmt};

pub mod allocation;
pub mod allocator;
pub mod backend;
mod block;
pub mod budget;
mod list;
pub mod metadata;
pub mod pool;
pub mod stats;

/// Represents memory size and offset values on the device.
/// Analogous to the Rust `usize` type on the host.
pub type DeviceSize = u64;

/// Error that can be returned by allocator operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocationError {
    /// The backend refused to allocate a block, or a heap budget or size
    /// limit would have been exceeded.
    OutOfDeviceMemory,

    /// No memory type satisfies both the resource's type mask and the
    /// required property flags.
    NoSuitableMemoryType,

    /// Making room by retiring evictable allocations was attempted the
    /// maximum number of times, and every attempt lost a race against a
    /// concurrent touch.
    TooManyEvictionAttempts,

    /// The request itself is malformed, for example conflicting create
    /// flags or an alignment that is not a power of two.
    InvalidConfiguration,

    /// Mapping memory for host access failed, or map/unmap calls were not
    /// balanced.
    MapFailed,
}

impl Error for AllocationError {}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfDeviceMemory => "out of device memory",
            Self::NoSuitableMemoryType => "no suitable memory type found",
            Self::TooManyEvictionAttempts => "too many eviction attempts",
            Self::InvalidConfiguration => "the request was malformed",
            Self::MapFailed => "memory mapping failed",
        };
        f.write_str(msg)
    }
}

/// A helper type for non-exhaustive structs.
///
/// This type cannot be constructed outside this crate. Structures with a
/// field of this type can only be constructed by calling a constructor
/// function or `Default::default()`. The effect is similar to the standard
/// Rust `#[non_exhaustive]` attribute, except that it does not prevent
/// update syntax from being used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NonExhaustive(pub(crate) ());

/// Rounds `val` up to the next multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline(always)]
pub const fn align_up(val: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    align_down(val + alignment - 1, alignment)
}

/// Rounds `val` down to the previous multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline(always)]
pub const fn align_down(val: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    debug_assert!(alignment.is_power_of_two());

    val & !(alignment - 1)
}

/// Returns whether `val` is a multiple of `alignment`.
///
/// `alignment` must be a power of two.
#[inline(always)]
pub const fn is_aligned(val: DeviceSize, alignment: DeviceSize) -> bool {
    debug_assert!(alignment.is_power_of_two());

    val & (alignment - 1) == 0
}
