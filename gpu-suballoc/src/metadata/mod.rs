//! Bookkeeping engines for the free space inside one memory block.
//!
//! A block is a plain span of `block_size` bytes; everything the allocator
//! knows about what lives where inside it is kept here, as a set of
//! [`Suballocation`] records that partition `[0, block_size)`. Three engines
//! implement the same contract:
//!
//! - [`GenericMetadata`](generic::GenericMetadata) keeps an ordered
//!   free-list with a size-sorted index. It supports all placement
//!   strategies and the eviction protocol, and is the default.
//! - [`LinearMetadata`](linear::LinearMetadata) hands out space like a
//!   stack, degrading into a ring buffer or a double-ended stack as frees
//!   and upper-address requests come in. Suited for transient,
//!   same-lifetime workloads.
//! - [`BuddyMetadata`](buddy::BuddyMetadata) splits the block into
//!   power-of-two nodes. Constant-ish placement and release, at the price
//!   of internal fragmentation.
//!
//! Placement is a two-step protocol: `create_allocation_request` searches
//! for a position without changing anything, and `alloc` commits the
//! returned [`AllocationRequest`]. The split exists because the caller may
//! first have to retire evictable allocations counted by the search, and
//! that retirement can fail when it races a concurrent touch.

use crate::{align_down, allocation::AllocationState, DeviceSize};
use std::sync::Arc;

// Returns `false` out of the enclosing validation function when the
// condition does not hold.
macro_rules! validate {
    ($cond:expr) => {
        if !($cond) {
            return false;
        }
    };
}

pub(crate) mod buddy;
pub(crate) mod generic;
pub(crate) mod linear;

pub(crate) use self::{buddy::BuddyMetadata, generic::GenericMetadata, linear::LinearMetadata};

/// Free runs smaller than this are not worth an entry in the size-sorted
/// free index; they are only found again by the neighbor merge on free.
pub(crate) const MIN_FREE_SIZE_TO_REGISTER: DeviceSize = 16;

/// Cost charged per live allocation that a placement would evict. Large
/// enough that any free-only placement beats any evicting one.
pub(crate) const LOST_ALLOCATION_COST: DeviceSize = 1_048_576;

/// What kind of resource a suballocation holds.
///
/// The kind matters on devices with a buffer-image granularity larger than
/// one: two suballocations of conflicting kinds must not share a
/// granularity page, so placement pushes them apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SuballocationKind {
    /// The run is unoccupied. Never valid in an allocation request.
    Free = 0,
    /// Occupied by an allocation of unknown content. Conflicts with
    /// everything.
    Unknown = 1,
    /// A buffer.
    Buffer = 2,
    /// An image with unknown tiling.
    ImageUnknown = 3,
    /// An image with linear tiling.
    ImageLinear = 4,
    /// An image with optimal (opaque) tiling.
    ImageOptimal = 5,
}

impl SuballocationKind {
    /// Whether two resource kinds must not share a granularity page.
    pub(crate) fn conflicts_on_page(self, other: Self) -> bool {
        let (lesser, greater) = if self <= other {
            (self, other)
        } else {
            (other, self)
        };

        match lesser {
            Self::Free => false,
            Self::Unknown => true,
            Self::Buffer => matches!(greater, Self::ImageUnknown | Self::ImageOptimal),
            Self::ImageUnknown => matches!(
                greater,
                Self::ImageUnknown | Self::ImageLinear | Self::ImageOptimal,
            ),
            Self::ImageLinear => greater == Self::ImageOptimal,
            Self::ImageOptimal => false,
        }
    }
}

/// How a placement search walks the free space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Pick the smallest free run that fits. Minimizes wasted space.
    #[default]
    BestFit,
    /// Pick the largest free run. Leaves the most room to grow behind the
    /// allocation.
    WorstFit,
    /// Pick the first fit found. Minimizes search time.
    FirstFit,
    /// Pick the fitting run with the lowest offset. Packs allocations
    /// toward the start of the block.
    MinOffset,
}

/// One contiguous extent inside a block, free or occupied.
///
/// Within one block these records always form a contiguous, offset-ordered
/// partition of `[0, block_size)`, and no two adjacent records are both
/// free.
#[derive(Clone, Debug)]
pub(crate) struct Suballocation {
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub kind: SuballocationKind,
    /// Shared lifetime state of the owning allocation; `None` for free
    /// runs.
    pub owner: Option<Arc<AllocationState>>,
}

impl Suballocation {
    pub fn free(offset: DeviceSize, size: DeviceSize) -> Self {
        Suballocation {
            offset,
            size,
            kind: SuballocationKind::Free,
            owner: None,
        }
    }

    pub fn is_free(&self) -> bool {
        self.kind == SuballocationKind::Free
    }
}

/// Everything a placement search needs to know about one request.
#[derive(Clone, Debug)]
pub(crate) struct AllocationContext {
    pub current_frame: u32,
    pub frame_in_use_count: u32,
    pub granularity: DeviceSize,
    pub size: DeviceSize,
    pub alignment: DeviceSize,
    pub kind: SuballocationKind,
    pub upper_address: bool,
    pub can_make_other_lost: bool,
    pub strategy: AllocationStrategy,
}

/// Where inside the metadata's structures a request commits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RequestType {
    Normal,
    /// Linear double stack, growing down from the block end.
    UpperAddress,
    /// Linear, appended after the first vector.
    EndOfFirst,
    /// Linear ring buffer, appended after the second vector.
    EndOfSecond,
}

/// A found placement, produced by `create_allocation_request` and consumed
/// by the matching `alloc`.
///
/// `item` is a token whose meaning is private to the engine that produced
/// the request; it must be handed back unchanged.
#[derive(Clone, Debug)]
pub(crate) struct AllocationRequest {
    pub offset: DeviceSize,
    /// Total free bytes the placement consumes.
    pub sum_free_size: DeviceSize,
    /// Total bytes of live allocations the placement would evict.
    pub sum_item_size: DeviceSize,
    pub items_to_make_lost: usize,
    pub item: usize,
    pub request_type: RequestType,
}

impl AllocationRequest {
    /// Lower is better; an eviction-free placement always wins.
    pub fn cost(&self) -> DeviceSize {
        self.sum_item_size + self.items_to_make_lost as DeviceSize * LOST_ALLOCATION_COST
    }
}

/// Checks whether the resource ending at `a_offset + a_size - 1` and the
/// resource starting at `b_offset` fall on the same granularity page.
pub(crate) fn are_blocks_on_same_page(
    a_offset: DeviceSize,
    a_size: DeviceSize,
    b_offset: DeviceSize,
    page_size: DeviceSize,
) -> bool {
    debug_assert!(a_offset + a_size <= b_offset && a_size > 0 && page_size > 0);

    let a_end = a_offset + a_size - 1;
    let a_end_page = align_down(a_end, page_size);
    let b_start_page = align_down(b_offset, page_size);

    a_end_page == b_start_page
}

/// Which bookkeeping engine a block list uses for its blocks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum Algorithm {
    #[default]
    Generic,
    Linear,
    Buddy,
}

/// The per-block bookkeeping, one of the three engines.
///
/// The variant is chosen when the owning block list is built, never per
/// call.
#[derive(Debug)]
pub(crate) enum BlockMetadata {
    Generic(GenericMetadata),
    Linear(LinearMetadata),
    Buddy(BuddyMetadata),
}

impl BlockMetadata {
    pub fn new(algorithm: Algorithm, size: DeviceSize) -> Self {
        match algorithm {
            Algorithm::Generic => BlockMetadata::Generic(GenericMetadata::new(size)),
            Algorithm::Linear => BlockMetadata::Linear(LinearMetadata::new(size)),
            Algorithm::Buddy => BlockMetadata::Buddy(BuddyMetadata::new(size)),
        }
    }

    pub fn size(&self) -> DeviceSize {
        match self {
            Self::Generic(m) => m.size(),
            Self::Linear(m) => m.size(),
            Self::Buddy(m) => m.size(),
        }
    }

    pub fn allocation_count(&self) -> usize {
        match self {
            Self::Generic(m) => m.allocation_count(),
            Self::Linear(m) => m.allocation_count(),
            Self::Buddy(m) => m.allocation_count(),
        }
    }

    pub fn sum_free_size(&self) -> DeviceSize {
        match self {
            Self::Generic(m) => m.sum_free_size(),
            Self::Linear(m) => m.sum_free_size(),
            Self::Buddy(m) => m.sum_free_size(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Generic(m) => m.is_empty(),
            Self::Linear(m) => m.is_empty(),
            Self::Buddy(m) => m.is_empty(),
        }
    }

    /// Searches for a position satisfying `ctx` without mutating anything.
    pub fn create_allocation_request(&self, ctx: &AllocationContext) -> Option<AllocationRequest> {
        match self {
            Self::Generic(m) => m.create_allocation_request(ctx),
            Self::Linear(m) => m.create_allocation_request(ctx),
            Self::Buddy(m) => m.create_allocation_request(ctx),
        }
    }

    /// Retires the live allocations counted in `request`, freeing their
    /// runs in place.
    ///
    /// Returns whether every counted allocation could be retired, plus the
    /// number of bytes that actually were (they stay retired even on
    /// failure, so the caller must settle budget counters either way). On
    /// failure the request is dead and the whole search must be redone.
    pub fn make_requested_allocations_lost(
        &mut self,
        current_frame: u32,
        frame_in_use_count: u32,
        request: &mut AllocationRequest,
    ) -> (bool, DeviceSize) {
        match self {
            Self::Generic(m) => {
                m.make_requested_allocations_lost(current_frame, frame_in_use_count, request)
            }
            // Neither engine ever produces an eviction request.
            Self::Linear(_) | Self::Buddy(_) => {
                debug_assert!(request.items_to_make_lost == 0);
                (true, 0)
            }
        }
    }

    /// Commits a found placement. Returns the placement token the owning
    /// allocation must pass back to `free`.
    pub fn alloc(
        &mut self,
        request: &AllocationRequest,
        kind: SuballocationKind,
        size: DeviceSize,
        owner: &Arc<AllocationState>,
    ) -> usize {
        match self {
            Self::Generic(m) => m.alloc(request, kind, size, owner),
            Self::Linear(m) => m.alloc(request, kind, size, owner),
            Self::Buddy(m) => m.alloc(request, kind, size, owner),
        }
    }

    /// Returns an occupied run to the free space, merging with free
    /// neighbors.
    pub fn free(&mut self, offset: DeviceSize, token: usize) {
        match self {
            Self::Generic(m) => m.free(offset, token),
            Self::Linear(m) => m.free(offset),
            Self::Buddy(m) => m.free(offset, token),
        }
    }

    /// Retires every evictable allocation that has been unused for longer
    /// than the frame window. Returns how many were retired and their byte
    /// total.
    pub fn make_allocations_lost(
        &mut self,
        current_frame: u32,
        frame_in_use_count: u32,
    ) -> (usize, DeviceSize) {
        match self {
            Self::Generic(m) => m.make_allocations_lost(current_frame, frame_in_use_count),
            Self::Linear(m) => m.make_allocations_lost(current_frame, frame_in_use_count),
            Self::Buddy(_) => (0, 0),
        }
    }

    /// Full consistency sweep. Cheap enough for tests, too slow for the
    /// release path; call sites wrap it in `debug_assert!`.
    pub fn validate(&self) -> bool {
        match self {
            Self::Generic(m) => m.validate(),
            Self::Linear(m) => m.validate(),
            Self::Buddy(m) => m.validate(),
        }
    }

    /// Size of the largest free run.
    pub fn unused_range_size_max(&self) -> DeviceSize {
        match self {
            Self::Generic(m) => m.unused_range_size_max(),
            Self::Linear(m) => m.unused_range_size_max(),
            Self::Buddy(m) => m.unused_range_size_max(),
        }
    }

    /// Folds this block's layout into `info`.
    pub fn add_stat_info(&self, info: &mut crate::stats::StatInfo) {
        match self {
            Self::Generic(m) => m.add_stat_info(info),
            Self::Linear(m) => m.add_stat_info(info),
            Self::Buddy(m) => m.add_stat_info(info),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_conflicts_are_symmetric() {
        use SuballocationKind::*;

        let kinds = [Free, Unknown, Buffer, ImageUnknown, ImageLinear, ImageOptimal];

        for &a in &kinds {
            for &b in &kinds {
                assert!(a.conflicts_on_page(b) == b.conflicts_on_page(a));
            }
        }
    }

    #[test]
    fn kind_conflict_table() {
        use SuballocationKind::*;

        assert!(!Free.conflicts_on_page(ImageOptimal));
        assert!(Unknown.conflicts_on_page(Unknown));
        assert!(Unknown.conflicts_on_page(Buffer));
        assert!(!Buffer.conflicts_on_page(Buffer));
        assert!(!Buffer.conflicts_on_page(ImageLinear));
        assert!(Buffer.conflicts_on_page(ImageOptimal));
        assert!(ImageLinear.conflicts_on_page(ImageOptimal));
        assert!(!ImageLinear.conflicts_on_page(ImageLinear));
        assert!(!ImageOptimal.conflicts_on_page(ImageOptimal));
    }

    #[test]
    fn same_page_detection() {
        // Page size 1 means everything is on its own page.
        assert!(!are_blocks_on_same_page(0, 16, 16, 1));

        assert!(are_blocks_on_same_page(0, 16, 16, 64));
        assert!(are_blocks_on_same_page(0, 65, 127, 64));
        assert!(!are_blocks_on_same_page(0, 65, 128, 64));
        assert!(!are_blocks_on_same_page(64, 64, 192, 64));
    }

    #[test]
    fn eviction_cost_dominates_free_space() {
        let free_only = AllocationRequest {
            offset: 0,
            sum_free_size: LOST_ALLOCATION_COST - 1,
            sum_item_size: 0,
            items_to_make_lost: 0,
            item: 0,
            request_type: RequestType::Normal,
        };
        let evicting = AllocationRequest {
            sum_free_size: 0,
            sum_item_size: 1,
            items_to_make_lost: 1,
            ..free_only.clone()
        };

        assert!(free_only.cost() < evicting.cost());
    }
}
