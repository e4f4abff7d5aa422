//! Point-in-time statistics over allocator state.
//!
//! A [`StatInfo`] is a fold over suballocations and free runs: every block
//! contributes its layout through
//! [`BlockMetadata::add_stat_info`](crate::metadata::BlockMetadata::add_stat_info),
//! per-type infos merge into per-heap and total infos with [`StatInfo::add`],
//! and [`StatInfo::post_process`] fills in the averages once at the end.
//! [`Stats`] is the assembled report for a whole allocator and [`PoolStats`]
//! the compact per-pool variant.

use crate::{
    backend::{MAX_MEMORY_HEAPS, MAX_MEMORY_TYPES},
    DeviceSize,
};
use smallvec::{smallvec, SmallVec};

/// Aggregated layout of some set of blocks.
///
/// The averages are zero until [`post_process`](Self::post_process) is
/// called; the minima read [`DeviceSize::MAX`] while no matching entry has
/// been folded in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatInfo {
    pub block_count: usize,
    pub allocation_count: usize,
    pub unused_range_count: usize,
    pub used_bytes: DeviceSize,
    pub unused_bytes: DeviceSize,
    pub allocation_size_min: DeviceSize,
    pub allocation_size_avg: DeviceSize,
    pub allocation_size_max: DeviceSize,
    pub unused_range_size_min: DeviceSize,
    pub unused_range_size_avg: DeviceSize,
    pub unused_range_size_max: DeviceSize,
}

impl StatInfo {
    pub fn new() -> Self {
        StatInfo {
            block_count: 0,
            allocation_count: 0,
            unused_range_count: 0,
            used_bytes: 0,
            unused_bytes: 0,
            allocation_size_min: DeviceSize::MAX,
            allocation_size_avg: 0,
            allocation_size_max: 0,
            unused_range_size_min: DeviceSize::MAX,
            unused_range_size_avg: 0,
            unused_range_size_max: 0,
        }
    }

    /// Folds one occupied run into the info.
    pub(crate) fn add_allocation(&mut self, size: DeviceSize) {
        self.allocation_count += 1;
        self.used_bytes += size;
        self.allocation_size_min = self.allocation_size_min.min(size);
        self.allocation_size_max = self.allocation_size_max.max(size);
    }

    /// Folds one free run into the info.
    pub(crate) fn add_unused_range(&mut self, size: DeviceSize) {
        self.unused_range_count += 1;
        self.unused_bytes += size;
        self.unused_range_size_min = self.unused_range_size_min.min(size);
        self.unused_range_size_max = self.unused_range_size_max.max(size);
    }

    /// Merges another info into this one. Averages are not merged; call
    /// [`post_process`](Self::post_process) on the result instead.
    pub fn add(&mut self, other: &StatInfo) {
        self.block_count += other.block_count;
        self.allocation_count += other.allocation_count;
        self.unused_range_count += other.unused_range_count;
        self.used_bytes += other.used_bytes;
        self.unused_bytes += other.unused_bytes;
        self.allocation_size_min = self.allocation_size_min.min(other.allocation_size_min);
        self.allocation_size_max = self.allocation_size_max.max(other.allocation_size_max);
        self.unused_range_size_min = self.unused_range_size_min.min(other.unused_range_size_min);
        self.unused_range_size_max = self.unused_range_size_max.max(other.unused_range_size_max);
    }

    /// Computes the averages from the folded counts and byte totals.
    pub fn post_process(&mut self) {
        self.allocation_size_avg = self
            .used_bytes
            .checked_div(self.allocation_count as DeviceSize)
            .unwrap_or(0);
        self.unused_range_size_avg = self
            .unused_bytes
            .checked_div(self.unused_range_count as DeviceSize)
            .unwrap_or(0);
    }
}

impl Default for StatInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Complete statistics of an allocator, as returned by
/// [`Allocator::calculate_stats`](crate::allocator::Allocator::calculate_stats).
///
/// Dedicated allocations count as blocks with a single allocation and no
/// unused ranges.
#[derive(Clone, Debug)]
pub struct Stats {
    /// One entry per backend memory type.
    pub memory_type: SmallVec<[StatInfo; MAX_MEMORY_TYPES]>,
    /// One entry per backend memory heap, each the merge of the types
    /// allocating from it.
    pub memory_heap: SmallVec<[StatInfo; MAX_MEMORY_HEAPS]>,
    pub total: StatInfo,
}

impl Stats {
    pub(crate) fn new(memory_type_count: usize, memory_heap_count: usize) -> Self {
        Stats {
            memory_type: smallvec![StatInfo::new(); memory_type_count],
            memory_heap: smallvec![StatInfo::new(); memory_heap_count],
            total: StatInfo::new(),
        }
    }

    pub(crate) fn post_process(&mut self) {
        for info in &mut self.memory_type {
            info.post_process();
        }
        for info in &mut self.memory_heap {
            info.post_process();
        }
        self.total.post_process();
    }
}

/// Statistics of a single pool, as returned by
/// [`Pool::stats`](crate::pool::Pool::stats).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total bytes in the pool's blocks.
    pub size: DeviceSize,
    pub unused_size: DeviceSize,
    pub allocation_count: usize,
    pub unused_range_count: usize,
    /// An allocation of at most this size fits in the pool without growing
    /// it.
    pub unused_range_size_max: DeviceSize,
    pub block_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folding_tracks_extremes_and_totals() {
        let mut info = StatInfo::new();

        info.add_allocation(100);
        info.add_allocation(300);
        info.add_unused_range(50);

        assert!(info.allocation_count == 2);
        assert!(info.used_bytes == 400);
        assert!(info.allocation_size_min == 100);
        assert!(info.allocation_size_max == 300);
        assert!(info.unused_range_count == 1);
        assert!(info.unused_bytes == 50);
        assert!(info.unused_range_size_min == 50);
        assert!(info.unused_range_size_max == 50);

        info.post_process();
        assert!(info.allocation_size_avg == 200);
        assert!(info.unused_range_size_avg == 50);
    }

    #[test]
    fn merge_folds_extremes_and_sums_counts() {
        let mut a = StatInfo::new();
        a.add_allocation(100);
        a.add_unused_range(10);

        let mut b = StatInfo::new();
        b.add_allocation(300);
        b.add_allocation(20);
        b.add_unused_range(500);
        b.block_count = 2;

        let mut total = StatInfo::new();
        total.add(&a);
        total.add(&b);
        total.post_process();

        assert!(total.block_count == 2);
        assert!(total.allocation_count == 3);
        assert!(total.used_bytes == 420);
        assert!(total.allocation_size_min == 20);
        assert!(total.allocation_size_max == 300);
        assert!(total.allocation_size_avg == 140);
        assert!(total.unused_range_count == 2);
        assert!(total.unused_range_size_min == 10);
        assert!(total.unused_range_size_max == 500);
        assert!(total.unused_range_size_avg == 255);
    }

    #[test]
    fn empty_info_post_processes_to_zero_averages() {
        let mut info = StatInfo::new();
        info.post_process();

        assert!(info.allocation_size_avg == 0);
        assert!(info.unused_range_size_avg == 0);
    }

    #[test]
    fn merging_an_empty_info_changes_nothing() {
        let mut info = StatInfo::new();
        info.add_allocation(100);
        info.add_unused_range(200);

        let before = info;
        info.add(&StatInfo::new());

        assert!(info == before);
    }
}
