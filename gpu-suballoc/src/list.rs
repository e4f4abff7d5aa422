//! The block list: a growable set of memory blocks of one memory type.
//!
//! Every allocator owns one list per backend memory type, and every custom
//! pool owns one more. The list decides which block serves a request, when
//! a new block is created and how large it is, when an empty block is
//! returned to the backend, and it runs the bounded retry loop around
//! eviction. All of that happens under the list's writer lock; searching a
//! block's metadata additionally takes that block's own mutex.
//!
//! Blocks are kept sorted by free size, ascending, so placement tries the
//! fullest block first. The sort is incremental: each free performs at most
//! one adjacent swap. The order converges over a few operations instead of
//! being exact after every one, which is cheap and good enough for a
//! heuristic.

use crate::{
    allocation::{Allocation, AllocationState},
    allocator::{AllocationCreateFlags, AllocationCreateInfo, Allocator},
    block::MemoryBlock,
    metadata::{
        Algorithm, AllocationContext, AllocationRequest, AllocationStrategy, SuballocationKind,
    },
    pool::Pool,
    stats::{PoolStats, StatInfo, Stats},
    AllocationError, DeviceSize,
};
use parking_lot::RwLock;
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

/// Bound on eviction retries within one allocation. Each retry means a
/// fresh search lost a race against a concurrent touch.
const ALLOCATION_TRY_COUNT: u32 = 32;

/// How many times a new block's size may be halved, both when sizing the
/// first blocks of a list and when the backend refuses an allocation.
const NEW_BLOCK_SIZE_SHIFT_MAX: u32 = 3;

#[derive(Debug)]
struct BlockListState {
    blocks: Vec<Arc<MemoryBlock>>,
    /// Whether any block is entirely free. At most one such block is kept;
    /// a second empty block is returned to the backend on free.
    has_empty_block: bool,
}

#[derive(Debug)]
pub(crate) struct BlockList {
    memory_type_index: u32,
    heap_index: usize,
    preferred_block_size: DeviceSize,
    min_block_count: usize,
    max_block_count: usize,
    granularity: DeviceSize,
    frame_in_use_count: u32,
    /// A pool with an explicit block size never halves it.
    explicit_block_size: bool,
    algorithm: Algorithm,
    /// Lists of custom pools cannot fall back to dedicated allocations, so
    /// they are allowed to overshoot the heap budget.
    custom_pool: bool,
    next_block_id: AtomicU32,
    state: RwLock<BlockListState>,
}

impl BlockList {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory_type_index: u32,
        heap_index: usize,
        preferred_block_size: DeviceSize,
        min_block_count: usize,
        max_block_count: usize,
        granularity: DeviceSize,
        frame_in_use_count: u32,
        explicit_block_size: bool,
        algorithm: Algorithm,
        custom_pool: bool,
    ) -> Self {
        BlockList {
            memory_type_index,
            heap_index,
            preferred_block_size,
            min_block_count,
            max_block_count,
            granularity,
            frame_in_use_count,
            explicit_block_size,
            algorithm,
            custom_pool,
            next_block_id: AtomicU32::new(0),
            state: RwLock::new(BlockListState {
                blocks: Vec::new(),
                has_empty_block: false,
            }),
        }
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn preferred_block_size(&self) -> DeviceSize {
        self.preferred_block_size
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn block_count(&self) -> usize {
        self.state.read().blocks.len()
    }

    /// Creates the configured minimum number of blocks up front. Called
    /// once at pool construction, before the list is shared.
    pub fn create_min_blocks(&self, allocator: &Arc<Allocator>) -> Result<(), AllocationError> {
        let mut state = self.state.write();
        debug_assert!(state.blocks.is_empty());

        for _ in 0..self.min_block_count {
            self.create_block(allocator, &mut state, self.preferred_block_size)?;
        }
        Self::update_has_empty_block(&mut state);

        Ok(())
    }

    pub fn allocate(
        &self,
        allocator: &Arc<Allocator>,
        pool: Option<&Arc<Pool>>,
        size: DeviceSize,
        alignment: DeviceSize,
        kind: SuballocationKind,
        create_info: &AllocationCreateInfo,
    ) -> Result<Allocation, AllocationError> {
        debug_assert!(size > 0 && alignment.is_power_of_two());
        debug_assert!(kind != SuballocationKind::Free);

        let current_frame = allocator.current_frame_index();
        let flags = create_info.flags;
        let upper_address = flags.contains(AllocationCreateFlags::UPPER_ADDRESS);
        let mapped = flags.contains(AllocationCreateFlags::MAPPED);
        let mut can_make_other_lost = flags.contains(AllocationCreateFlags::CAN_MAKE_OTHER_LOST);
        let strategy = create_info.strategy;

        // Evicting from a multi-block ring is not meaningful, and
        // upper-address placement only exists in the linear engine.
        if self.algorithm == Algorithm::Linear && self.max_block_count > 1 {
            can_make_other_lost = false;
        }
        if upper_address && (self.algorithm != Algorithm::Linear || self.max_block_count > 1) {
            return Err(AllocationError::InvalidConfiguration);
        }

        if size > self.preferred_block_size {
            return Err(AllocationError::OutOfDeviceMemory);
        }

        let free_memory = {
            let budget = allocator.heap_budget(self.heap_index);
            budget.budget.saturating_sub(budget.usage)
        };
        let can_fallback_to_dedicated = !self.custom_pool;

        let mut state = self.state.write();

        // A request that does not fit the budget is better served by a
        // dedicated allocation, where that fallback exists.
        let can_create_new_block = !flags.contains(AllocationCreateFlags::NEVER_ALLOCATE)
            && state.blocks.len() < self.max_block_count
            && (free_memory >= size || !can_fallback_to_dedicated);

        // First pass: existing blocks, without evicting anything.
        if !can_make_other_lost || can_create_new_block {
            if self.algorithm == Algorithm::Linear {
                // Only the newest block of a linear list can grow.
                if let Some(block) = state.blocks.last().cloned() {
                    if let Some(allocation) = self.allocate_from_block(
                        allocator,
                        pool,
                        &mut state,
                        &block,
                        current_frame,
                        size,
                        alignment,
                        kind,
                        create_info,
                    )? {
                        return Ok(allocation);
                    }
                }
            } else if matches!(
                strategy,
                AllocationStrategy::BestFit | AllocationStrategy::MinOffset,
            ) {
                // Ascending free size: fullest block first.
                for index in 0..state.blocks.len() {
                    let block = state.blocks[index].clone();
                    if let Some(allocation) = self.allocate_from_block(
                        allocator,
                        pool,
                        &mut state,
                        &block,
                        current_frame,
                        size,
                        alignment,
                        kind,
                        create_info,
                    )? {
                        return Ok(allocation);
                    }
                }
            } else {
                for index in (0..state.blocks.len()).rev() {
                    let block = state.blocks[index].clone();
                    if let Some(allocation) = self.allocate_from_block(
                        allocator,
                        pool,
                        &mut state,
                        &block,
                        current_frame,
                        size,
                        alignment,
                        kind,
                        create_info,
                    )? {
                        return Ok(allocation);
                    }
                }
            }
        }

        // Second pass: create a block. Undersize it while the list is
        // young, and fall back to smaller sizes when the backend refuses.
        if can_create_new_block {
            let mut new_block_size = self.preferred_block_size;
            let mut shift = 0;

            if !self.explicit_block_size {
                let max_existing = state
                    .blocks
                    .iter()
                    .map(|block| block.size())
                    .max()
                    .unwrap_or(0);

                for _ in 0..NEW_BLOCK_SIZE_SHIFT_MAX {
                    let smaller = new_block_size / 2;
                    if smaller > max_existing && smaller >= size * 2 {
                        new_block_size = smaller;
                        shift += 1;
                    } else {
                        break;
                    }
                }
            }

            let mut result = if new_block_size <= free_memory || !can_fallback_to_dedicated {
                self.create_block(allocator, &mut state, new_block_size)
            } else {
                Err(AllocationError::OutOfDeviceMemory)
            };

            if !self.explicit_block_size {
                while result.is_err() && shift < NEW_BLOCK_SIZE_SHIFT_MAX {
                    let smaller = new_block_size / 2;
                    if smaller < size {
                        break;
                    }

                    new_block_size = smaller;
                    shift += 1;
                    result = if new_block_size <= free_memory || !can_fallback_to_dedicated {
                        self.create_block(allocator, &mut state, new_block_size)
                    } else {
                        Err(AllocationError::OutOfDeviceMemory)
                    };
                }
            }

            if let Ok(index) = result {
                let block = state.blocks[index].clone();
                if let Some(allocation) = self.allocate_from_block(
                    allocator,
                    pool,
                    &mut state,
                    &block,
                    current_frame,
                    size,
                    alignment,
                    kind,
                    create_info,
                )? {
                    return Ok(allocation);
                }
                // A fresh block can still refuse: a buddy block of
                // non-power-of-two size serves only its usable prefix.
            }
        }

        // Third pass: make room by retiring evictable allocations. Each
        // attempt searches, commits the evictions, and revalidates; a
        // concurrent touch between search and commit voids the attempt.
        if can_make_other_lost {
            let ctx = AllocationContext {
                current_frame,
                frame_in_use_count: self.frame_in_use_count,
                granularity: self.granularity,
                size,
                alignment,
                kind,
                upper_address,
                can_make_other_lost: true,
                strategy,
            };

            let mut try_index = 0;
            while try_index < ALLOCATION_TRY_COUNT {
                let mut best: Option<(Arc<MemoryBlock>, AllocationRequest)> = None;

                if matches!(
                    strategy,
                    AllocationStrategy::BestFit | AllocationStrategy::MinOffset,
                ) {
                    for block in state.blocks.iter() {
                        if let Some(request) = block.metadata().create_allocation_request(&ctx) {
                            let better = match &best {
                                Some((_, best_request)) => request.cost() < best_request.cost(),
                                None => true,
                            };
                            if better {
                                let free_placement = request.cost() == 0;
                                best = Some((block.clone(), request));
                                if free_placement {
                                    break;
                                }
                            }
                        }
                    }
                } else {
                    for block in state.blocks.iter().rev() {
                        if let Some(request) = block.metadata().create_allocation_request(&ctx) {
                            let better = match &best {
                                Some((_, best_request)) => {
                                    request.cost() < best_request.cost()
                                        || strategy == AllocationStrategy::FirstFit
                                }
                                None => true,
                            };
                            if better {
                                let done = request.cost() == 0
                                    || strategy == AllocationStrategy::FirstFit;
                                best = Some((block.clone(), request));
                                if done {
                                    break;
                                }
                            }
                        }
                    }
                }

                let Some((block, mut request)) = best else {
                    break;
                };

                if mapped {
                    block.map()?;
                }

                let mut metadata = block.metadata();
                let (committed, retired_bytes) = metadata.make_requested_allocations_lost(
                    current_frame,
                    self.frame_in_use_count,
                    &mut request,
                );
                // Evicted allocations are gone even when the commit then
                // fails, and their runs are free.
                block.set_free_size(metadata.sum_free_size());
                if retired_bytes > 0 {
                    allocator
                        .budget()
                        .remove_allocation(self.heap_index, retired_bytes);
                }

                if committed {
                    let owner = Arc::new(AllocationState::new(
                        current_frame,
                        flags.contains(AllocationCreateFlags::CAN_BECOME_LOST),
                    ));
                    let token = metadata.alloc(&request, kind, size, &owner);
                    block.set_free_size(metadata.sum_free_size());
                    debug_assert!(metadata.validate());
                    drop(metadata);

                    Self::update_has_empty_block(&mut state);
                    allocator.budget().add_allocation(self.heap_index, size);

                    return Ok(Allocation::block(
                        allocator.clone(),
                        pool.cloned(),
                        &block,
                        request.offset,
                        token,
                        size,
                        alignment,
                        kind,
                        owner,
                        mapped,
                        create_info.user_data,
                    ));
                }

                drop(metadata);
                if mapped {
                    let _ = block.unmap();
                }
                try_index += 1;
            }

            if try_index == ALLOCATION_TRY_COUNT {
                return Err(AllocationError::TooManyEvictionAttempts);
            }
        }

        Err(AllocationError::OutOfDeviceMemory)
    }

    /// Tries one block, without eviction. `Ok(None)` means the block has
    /// no fitting position.
    #[allow(clippy::too_many_arguments)]
    fn allocate_from_block(
        &self,
        allocator: &Arc<Allocator>,
        pool: Option<&Arc<Pool>>,
        state: &mut BlockListState,
        block: &Arc<MemoryBlock>,
        current_frame: u32,
        size: DeviceSize,
        alignment: DeviceSize,
        kind: SuballocationKind,
        create_info: &AllocationCreateInfo,
    ) -> Result<Option<Allocation>, AllocationError> {
        let flags = create_info.flags;
        let ctx = AllocationContext {
            current_frame,
            frame_in_use_count: self.frame_in_use_count,
            granularity: self.granularity,
            size,
            alignment,
            kind,
            upper_address: flags.contains(AllocationCreateFlags::UPPER_ADDRESS),
            can_make_other_lost: false,
            strategy: create_info.strategy,
        };

        let mut metadata = block.metadata();
        let Some(request) = metadata.create_allocation_request(&ctx) else {
            return Ok(None);
        };
        debug_assert!(request.items_to_make_lost == 0);

        // Mapping before the commit keeps the metadata untouched when the
        // backend refuses the mapping.
        let mapped = flags.contains(AllocationCreateFlags::MAPPED);
        if mapped {
            block.map()?;
        }

        let owner = Arc::new(AllocationState::new(
            current_frame,
            flags.contains(AllocationCreateFlags::CAN_BECOME_LOST),
        ));
        let token = metadata.alloc(&request, kind, size, &owner);
        block.set_free_size(metadata.sum_free_size());
        debug_assert!(metadata.validate());
        drop(metadata);

        Self::update_has_empty_block(state);
        allocator.budget().add_allocation(self.heap_index, size);

        Ok(Some(Allocation::block(
            allocator.clone(),
            pool.cloned(),
            block,
            request.offset,
            token,
            size,
            alignment,
            kind,
            owner,
            mapped,
            create_info.user_data,
        )))
    }

    /// Returns an allocation's run to its block, possibly returning an
    /// empty block to the backend.
    pub fn free(
        &self,
        allocator: &Arc<Allocator>,
        block: &Arc<MemoryBlock>,
        offset: DeviceSize,
        token: usize,
        persistent_map: bool,
    ) {
        // Under pressure, empty blocks are not worth keeping around.
        let budget_exceeded = {
            let budget = allocator.heap_budget(self.heap_index);
            budget.usage >= budget.budget
        };

        let mut block_to_delete = None;
        {
            let mut state = self.state.write();

            if persistent_map {
                let unmapped = block.unmap();
                debug_assert!(unmapped.is_ok());
            }

            {
                let mut metadata = block.metadata();
                metadata.free(offset, token);
                block.set_free_size(metadata.sum_free_size());
                debug_assert!(metadata.validate());
            }

            let can_delete_block = state.blocks.len() > self.min_block_count;

            if block.free_size() == block.size() {
                // The freed block is now empty. Keep it as the one spare
                // unless a spare already exists or the heap is over
                // budget.
                if (state.has_empty_block || budget_exceeded) && can_delete_block {
                    if let Some(index) = state
                        .blocks
                        .iter()
                        .position(|candidate| Arc::ptr_eq(candidate, block))
                    {
                        block_to_delete = Some(state.blocks.remove(index));
                    }
                }
            } else if state.has_empty_block && can_delete_block {
                // The spare is the block with the most free space, which
                // the sort keeps last.
                if let Some(last) = state.blocks.last() {
                    if last.free_size() == last.size() {
                        block_to_delete = state.blocks.pop();
                    }
                }
            }

            Self::update_has_empty_block(&mut state);
            self.incrementally_sort_blocks(&mut state);
        }

        // The backend call happens outside the list lock.
        drop(block_to_delete);
    }

    /// Retires every sufficiently stale evictable allocation in every
    /// block. Returns how many were retired.
    pub fn make_allocations_lost(&self, allocator: &Arc<Allocator>) -> usize {
        let current_frame = allocator.current_frame_index();

        let mut state = self.state.write();
        let mut lost_count = 0;
        let mut retired_bytes = 0;

        for block in state.blocks.iter() {
            let mut metadata = block.metadata();
            let (count, bytes) =
                metadata.make_allocations_lost(current_frame, self.frame_in_use_count);
            if count > 0 {
                block.set_free_size(metadata.sum_free_size());
                lost_count += count;
                retired_bytes += bytes;
            }
        }

        if retired_bytes > 0 {
            allocator
                .budget()
                .remove_allocation(self.heap_index, retired_bytes);
        }
        Self::update_has_empty_block(&mut state);

        lost_count
    }

    /// Folds every block's layout into per-type, per-heap and total infos.
    pub fn add_stats(&self, stats: &mut Stats) {
        let state = self.state.read();

        for block in state.blocks.iter() {
            let metadata = block.metadata();
            debug_assert!(metadata.validate());

            let mut info = StatInfo::new();
            metadata.add_stat_info(&mut info);

            stats.total.add(&info);
            stats.memory_type[self.memory_type_index as usize].add(&info);
            stats.memory_heap[self.heap_index].add(&info);
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        let state = self.state.read();

        let mut stats = PoolStats {
            block_count: state.blocks.len(),
            ..PoolStats::default()
        };

        for block in state.blocks.iter() {
            let metadata = block.metadata();
            debug_assert!(metadata.validate());

            stats.size += metadata.size();
            stats.unused_size += metadata.sum_free_size();
            stats.allocation_count += metadata.allocation_count();
            stats.unused_range_size_max = stats
                .unused_range_size_max
                .max(metadata.unused_range_size_max());

            let mut info = StatInfo::new();
            metadata.add_stat_info(&mut info);
            stats.unused_range_count += info.unused_range_count;
        }

        stats
    }

    fn create_block(
        &self,
        allocator: &Arc<Allocator>,
        state: &mut BlockListState,
        block_size: DeviceSize,
    ) -> Result<usize, AllocationError> {
        let memory = allocator.allocate_backend_memory(self.memory_type_index, block_size)?;

        let block = Arc::new(MemoryBlock::new(
            allocator.backend().clone(),
            allocator.budget().clone(),
            self.next_block_id.fetch_add(1, Ordering::Relaxed),
            self.memory_type_index,
            self.heap_index,
            memory,
            block_size,
            self.algorithm,
        ));
        state.blocks.push(block);

        Ok(state.blocks.len() - 1)
    }

    fn update_has_empty_block(state: &mut BlockListState) {
        state.has_empty_block = state
            .blocks
            .iter()
            .any(|block| block.free_size() == block.size());
    }

    /// One adjacent swap toward ascending free size. Linear lists keep
    /// their creation order; only the newest block may allocate.
    fn incrementally_sort_blocks(&self, state: &mut BlockListState) {
        if self.algorithm == Algorithm::Linear {
            return;
        }

        for i in 1..state.blocks.len() {
            if state.blocks[i - 1].free_size() > state.blocks[i].free_size() {
                state.blocks.swap(i - 1, i);
                return;
            }
        }
    }
}
