//! The allocator: memory type selection and request routing.
//!
//! An [`Allocator`] owns one [`BlockList`] per backend memory type plus a
//! registry of dedicated allocations. [`allocate`] picks a memory type for
//! the request, then either suballocates from that type's list, routes into
//! a caller-supplied [`Pool`], or hands the request to the backend as a
//! dedicated allocation when it is too large to share a block.
//!
//! [`BlockList`]: crate::list::BlockList
//! [`allocate`]: Allocator::allocate

use crate::{
    align_up,
    allocation::{Allocation, AllocationState},
    backend::{
        BlockHandle, MemoryBackend, MemoryProperties, MemoryPropertyFlags, MAX_MEMORY_HEAPS,
        MAX_MEMORY_TYPES,
    },
    budget::{BudgetInfo, BudgetTracker},
    list::BlockList,
    metadata::{Algorithm, AllocationStrategy, SuballocationKind},
    pool::{Pool, PoolCreateFlags, PoolCreateInfo},
    stats::{StatInfo, Stats},
    AllocationError, DeviceSize, NonExhaustive,
};
use foldhash::HashMap;
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Weak,
    },
};

/// Block size used for heaps larger than [`SMALL_HEAP_MAX_SIZE`] unless
/// overridden in [`AllocatorCreateInfo`].
pub const DEFAULT_LARGE_HEAP_BLOCK_SIZE: DeviceSize = 256 * 1024 * 1024;

/// Heaps up to this size get blocks of an eighth of the heap instead of the
/// large-heap block size.
const SMALL_HEAP_MAX_SIZE: DeviceSize = 1024 * 1024 * 1024;

bitflags::bitflags! {
    /// Flags controlling how a single allocation is made.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct AllocationCreateFlags: u32 {
        /// Give the allocation its own memory block, bypassing
        /// suballocation. Incompatible with `NEVER_ALLOCATE` and with
        /// custom pools.
        const DEDICATED_MEMORY = 1 << 0;

        /// Only place into existing blocks, never ask the backend for new
        /// memory. The allocation fails if no block has room.
        const NEVER_ALLOCATE = 1 << 1;

        /// Map the memory for host access up front and keep it mapped for
        /// the allocation's whole lifetime. Silently ignored for memory
        /// types the host cannot see.
        const MAPPED = 1 << 2;

        /// Allow the allocator to retire this allocation to make room for
        /// others once it has not been touched for more than the
        /// frame-in-use window. Incompatible with `MAPPED` and with
        /// dedicated memory.
        const CAN_BECOME_LOST = 1 << 3;

        /// Allow this request to retire other stale evictable allocations
        /// when no free range fits.
        const CAN_MAKE_OTHER_LOST = 1 << 4;

        /// Place at the highest fitting offset instead of the lowest.
        /// Only supported by single-block linear pools.
        const UPPER_ADDRESS = 1 << 5;

        /// Fail instead of exceeding the heap's reported budget. Only
        /// meaningful for dedicated allocations; block placement respects
        /// the budget on its own.
        const WITHIN_BUDGET = 1 << 6;
    }
}

/// Broad-stroke placement intent, translated into required and preferred
/// memory property flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum MemoryUsage {
    /// No stated intent; only the explicit flags in the create info are
    /// considered.
    #[default]
    Unknown,

    /// Resources written and read by the device only.
    GpuOnly,

    /// Staging and readback resources the host keeps access to.
    CpuOnly,

    /// Written by the host, read by the device.
    CpuToGpu,

    /// Written by the device, read back by the host.
    GpuToCpu,

    /// Transient copy source buffers; device-local memory is wasted on
    /// them.
    CpuCopy,

    /// Transient attachments that may never need backing memory.
    GpuLazilyAllocated,
}

/// A request's placement constraints, as reported by the backend for the
/// resource it will back.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRequirements {
    pub size: DeviceSize,
    /// Must be a power of two.
    pub alignment: DeviceSize,
    /// Bitmask of the memory types the resource can live in, bit `i` for
    /// type `i`.
    pub memory_type_bits: u32,
}

/// Parameters of a single allocation.
#[derive(Clone, Debug, Default)]
pub struct AllocationCreateInfo {
    /// Additional properties of the allocation.
    ///
    /// The default is [`AllocationCreateFlags::empty()`].
    pub flags: AllocationCreateFlags,

    /// Intended access pattern, used to pick a memory type.
    ///
    /// The default is [`MemoryUsage::Unknown`].
    pub usage: MemoryUsage,

    /// Property flags the chosen memory type must have.
    ///
    /// The default is [`MemoryPropertyFlags::empty()`].
    pub required_flags: MemoryPropertyFlags,

    /// Property flags the chosen memory type should have. Each missing
    /// preferred flag makes a type a little less attractive.
    ///
    /// The default is [`MemoryPropertyFlags::empty()`].
    pub preferred_flags: MemoryPropertyFlags,

    /// Additional restriction on acceptable memory types, on top of the
    /// requirements' mask. 0 means no restriction.
    ///
    /// The default is `0`.
    pub memory_type_bits: u32,

    /// Pool to allocate from instead of the allocator's own block lists.
    ///
    /// The default is `None`.
    pub pool: Option<Arc<Pool>>,

    /// How to choose between multiple fitting free ranges.
    ///
    /// The default is [`AllocationStrategy::BestFit`].
    pub strategy: AllocationStrategy,

    /// Opaque caller tag carried by the allocation.
    ///
    /// The default is `None`.
    pub user_data: Option<u64>,
}

/// Parameters of a new [`Allocator`].
#[derive(Clone, Debug)]
pub struct AllocatorCreateInfo {
    /// Preferred block size for heaps larger than 1 GiB, or 0 for the
    /// built-in default of 256 MiB.
    ///
    /// The default is `0`.
    pub preferred_large_heap_block_size: DeviceSize,

    /// How many frames back an evictable allocation must have been last
    /// used before the allocator's own block lists may retire it.
    ///
    /// The default is `0`, retiring allocations not touched in the current
    /// frame.
    pub frame_in_use_count: u32,

    /// Caps the bytes of block memory allocated from each heap, overriding
    /// the heap size reported by the backend when smaller. Indexed by heap;
    /// missing entries and `None` leave the heap uncapped.
    ///
    /// The default is empty.
    pub heap_size_limits: Vec<Option<DeviceSize>>,

    /// Memory types the allocator may use at all, bit `i` for type `i`.
    /// Embedders use this to exclude types with vendor-specific caveats.
    /// 0 means no restriction.
    ///
    /// The default is `0`.
    pub memory_type_bits: u32,

    pub _ne: NonExhaustive,
}

impl Default for AllocatorCreateInfo {
    fn default() -> Self {
        AllocatorCreateInfo {
            preferred_large_heap_block_size: 0,
            frame_in_use_count: 0,
            heap_size_limits: Vec::new(),
            memory_type_bits: 0,
            _ne: NonExhaustive(()),
        }
    }
}

/// A device memory allocator.
///
/// The allocator is fully thread safe: any number of threads may allocate,
/// free, map and query concurrently through the same `Arc`.
pub struct Allocator {
    backend: Arc<dyn MemoryBackend>,
    properties: MemoryProperties,
    budget: Arc<BudgetTracker>,
    preferred_large_heap_block_size: DeviceSize,
    /// Types any allocation may ever use; all-ones when unrestricted.
    global_memory_type_bits: u32,
    current_frame: AtomicU32,
    block_lists: Vec<BlockList>,
    /// Dedicated allocations per memory type, id to size.
    dedicated: Vec<RwLock<HashMap<u64, DeviceSize>>>,
    next_dedicated_id: AtomicU64,
    next_pool_id: AtomicU32,
    pools: Mutex<Vec<Weak<Pool>>>,
}

impl Allocator {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        create_info: &AllocatorCreateInfo,
    ) -> Result<Arc<Self>, AllocationError> {
        let properties = backend.memory_properties().clone();

        let type_count = properties.memory_types.len();
        let heap_count = properties.memory_heaps.len();
        if type_count == 0
            || type_count > MAX_MEMORY_TYPES
            || heap_count == 0
            || heap_count > MAX_MEMORY_HEAPS
            || !properties.buffer_image_granularity.is_power_of_two()
            || !properties.non_coherent_atom_size.is_power_of_two()
        {
            return Err(AllocationError::InvalidConfiguration);
        }
        if properties
            .memory_types
            .iter()
            .any(|memory_type| memory_type.heap_index as usize >= heap_count)
        {
            return Err(AllocationError::InvalidConfiguration);
        }

        let preferred_large_heap_block_size = if create_info.preferred_large_heap_block_size != 0 {
            create_info.preferred_large_heap_block_size
        } else {
            DEFAULT_LARGE_HEAP_BLOCK_SIZE
        };
        let global_memory_type_bits = if create_info.memory_type_bits != 0 {
            create_info.memory_type_bits
        } else {
            !0
        };

        let budget = Arc::new(BudgetTracker::new(
            backend.as_ref(),
            &properties,
            &create_info.heap_size_limits,
        ));

        let block_lists = properties
            .memory_types
            .iter()
            .enumerate()
            .map(|(index, memory_type)| {
                let heap_index = memory_type.heap_index as usize;
                let heap_size = properties.memory_heaps[heap_index].size;

                BlockList::new(
                    index as u32,
                    heap_index,
                    preferred_block_size(heap_size, preferred_large_heap_block_size),
                    0,
                    usize::MAX,
                    properties.buffer_image_granularity,
                    create_info.frame_in_use_count,
                    false,
                    Algorithm::Generic,
                    false,
                )
            })
            .collect();

        let dedicated = (0..type_count).map(|_| RwLock::new(HashMap::default())).collect();

        Ok(Arc::new(Allocator {
            backend,
            properties,
            budget,
            preferred_large_heap_block_size,
            global_memory_type_bits,
            current_frame: AtomicU32::new(0),
            block_lists,
            dedicated,
            next_dedicated_id: AtomicU64::new(0),
            next_pool_id: AtomicU32::new(0),
            pools: Mutex::new(Vec::new()),
        }))
    }

    /// Allocates memory for a resource with the given requirements.
    ///
    /// `kind` states what the memory will back, which drives granularity
    /// page separation inside blocks; pass [`SuballocationKind::Unknown`]
    /// when unsure, never [`SuballocationKind::Free`].
    pub fn allocate(
        self: &Arc<Self>,
        requirements: &MemoryRequirements,
        kind: SuballocationKind,
        create_info: &AllocationCreateInfo,
    ) -> Result<Allocation, AllocationError> {
        let flags = create_info.flags;

        if requirements.size == 0
            || !requirements.alignment.is_power_of_two()
            || kind == SuballocationKind::Free
        {
            return Err(AllocationError::InvalidConfiguration);
        }
        if flags.contains(
            AllocationCreateFlags::DEDICATED_MEMORY | AllocationCreateFlags::NEVER_ALLOCATE,
        ) || flags
            .contains(AllocationCreateFlags::MAPPED | AllocationCreateFlags::CAN_BECOME_LOST)
            || flags.contains(
                AllocationCreateFlags::DEDICATED_MEMORY | AllocationCreateFlags::CAN_BECOME_LOST,
            )
        {
            return Err(AllocationError::InvalidConfiguration);
        }
        if create_info.pool.is_some() && flags.contains(AllocationCreateFlags::DEDICATED_MEMORY) {
            return Err(AllocationError::InvalidConfiguration);
        }

        match &create_info.pool {
            Some(pool) => {
                if !Arc::ptr_eq(pool.allocator(), self) {
                    return Err(AllocationError::InvalidConfiguration);
                }

                let memory_type_index = pool.memory_type_index();
                let alignment = requirements
                    .alignment
                    .max(self.memory_type_min_alignment(memory_type_index));

                let mut info = create_info.clone();
                if info.flags.contains(AllocationCreateFlags::MAPPED)
                    && !self.memory_type_is_host_visible(memory_type_index)
                {
                    info.flags -= AllocationCreateFlags::MAPPED;
                }

                pool.block_list().allocate(
                    self,
                    Some(pool),
                    requirements.size,
                    alignment,
                    kind,
                    &info,
                )
            }
            None => {
                let memory_type_index = self
                    .find_memory_type_index(requirements.memory_type_bits, create_info)
                    .ok_or(AllocationError::NoSuitableMemoryType)?;
                let alignment = requirements
                    .alignment
                    .max(self.memory_type_min_alignment(memory_type_index));

                self.allocate_memory_of_type(
                    requirements.size,
                    alignment,
                    memory_type_index,
                    kind,
                    create_info,
                )
            }
        }
    }

    /// Picks the cheapest memory type satisfying the request, or `None`
    /// when no type does.
    ///
    /// Types missing any required flag are out. Among the rest, every
    /// missing preferred flag and every present not-preferred flag costs a
    /// point, and the lowest cost wins, ties going to the lowest index.
    pub fn find_memory_type_index(
        &self,
        memory_type_bits: u32,
        create_info: &AllocationCreateInfo,
    ) -> Option<u32> {
        let mut acceptable_bits = memory_type_bits & self.global_memory_type_bits;
        if create_info.memory_type_bits != 0 {
            acceptable_bits &= create_info.memory_type_bits;
        }

        let mut required = create_info.required_flags;
        let mut preferred = create_info.preferred_flags;
        let mut not_preferred = MemoryPropertyFlags::empty();

        match create_info.usage {
            MemoryUsage::Unknown => {}
            MemoryUsage::GpuOnly => {
                if !self.properties.integrated_gpu
                    || !preferred.contains(MemoryPropertyFlags::HOST_VISIBLE)
                {
                    preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
                }
            }
            MemoryUsage::CpuOnly => {
                required |=
                    MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;
            }
            MemoryUsage::CpuToGpu => {
                required |= MemoryPropertyFlags::HOST_VISIBLE;
                if !self.properties.integrated_gpu
                    || !preferred.contains(MemoryPropertyFlags::HOST_VISIBLE)
                {
                    preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
                }
            }
            MemoryUsage::GpuToCpu => {
                required |= MemoryPropertyFlags::HOST_VISIBLE;
                preferred |= MemoryPropertyFlags::HOST_CACHED;
            }
            MemoryUsage::CpuCopy => {
                not_preferred |= MemoryPropertyFlags::DEVICE_LOCAL;
            }
            MemoryUsage::GpuLazilyAllocated => {
                required |= MemoryPropertyFlags::LAZILY_ALLOCATED;
            }
        }

        let mut best = None;
        let mut min_cost = u32::MAX;

        for (index, memory_type) in self.properties.memory_types.iter().enumerate() {
            if acceptable_bits & (1 << index) == 0 {
                continue;
            }

            let flags = memory_type.property_flags;
            if !flags.contains(required) {
                continue;
            }

            let cost = (preferred & !flags).bits().count_ones()
                + (flags & not_preferred).bits().count_ones();
            if cost == 0 {
                return Some(index as u32);
            }
            if cost < min_cost {
                best = Some(index as u32);
                min_cost = cost;
            }
        }

        best
    }

    fn allocate_memory_of_type(
        self: &Arc<Self>,
        size: DeviceSize,
        alignment: DeviceSize,
        memory_type_index: u32,
        kind: SuballocationKind,
        create_info: &AllocationCreateInfo,
    ) -> Result<Allocation, AllocationError> {
        let mut info = create_info.clone();

        if info.flags.contains(AllocationCreateFlags::MAPPED)
            && !self.memory_type_is_host_visible(memory_type_index)
        {
            info.flags -= AllocationCreateFlags::MAPPED;
        }
        if info.usage == MemoryUsage::GpuLazilyAllocated {
            info.flags |= AllocationCreateFlags::DEDICATED_MEMORY;
        }

        let list = &self.block_lists[memory_type_index as usize];
        let can_become_lost = info.flags.contains(AllocationCreateFlags::CAN_BECOME_LOST);

        // Requests above half a block are poor sharers; evictable ones
        // must stay in blocks regardless.
        let prefer_dedicated = size > list.preferred_block_size() / 2;
        if prefer_dedicated
            && !info.flags.contains(AllocationCreateFlags::NEVER_ALLOCATE)
            && !can_become_lost
        {
            info.flags |= AllocationCreateFlags::DEDICATED_MEMORY;
        }

        let block_error = if !info.flags.contains(AllocationCreateFlags::DEDICATED_MEMORY) {
            match list.allocate(self, None, size, alignment, kind, &info) {
                Ok(allocation) => return Ok(allocation),
                Err(err) => Some(err),
            }
        } else {
            None
        };

        if info.flags.contains(AllocationCreateFlags::NEVER_ALLOCATE) || can_become_lost {
            return Err(block_error.unwrap_or(AllocationError::OutOfDeviceMemory));
        }

        self.allocate_dedicated(size, alignment, memory_type_index, kind, &info)
    }

    fn allocate_dedicated(
        self: &Arc<Self>,
        size: DeviceSize,
        alignment: DeviceSize,
        memory_type_index: u32,
        kind: SuballocationKind,
        info: &AllocationCreateInfo,
    ) -> Result<Allocation, AllocationError> {
        debug_assert!(!info.flags.contains(AllocationCreateFlags::CAN_BECOME_LOST));

        let heap_index = self.heap_index(memory_type_index);

        if info.flags.contains(AllocationCreateFlags::WITHIN_BUDGET) {
            let budget = self.heap_budget(heap_index);
            if budget.usage + size > budget.budget {
                return Err(AllocationError::OutOfDeviceMemory);
            }
        }

        let memory = self.allocate_backend_memory(memory_type_index, size)?;

        let mapped_ptr = if info.flags.contains(AllocationCreateFlags::MAPPED) {
            match self.backend.map_block(memory) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    self.backend.free_block(memory);
                    self.budget.on_block_freed(heap_index, size);
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        let id = self.next_dedicated_id.fetch_add(1, Ordering::Relaxed);
        self.dedicated[memory_type_index as usize]
            .write()
            .insert(id, size);
        self.budget.add_allocation(heap_index, size);

        let state = Arc::new(AllocationState::new(
            self.current_frame_index(),
            false,
        ));

        Ok(Allocation::dedicated(
            self.clone(),
            id,
            memory,
            memory_type_index,
            size,
            alignment,
            kind,
            state,
            mapped_ptr,
            info.user_data,
        ))
    }

    /// Creates a custom [`Pool`] and registers it for statistics.
    pub fn create_pool(
        self: &Arc<Self>,
        create_info: &PoolCreateInfo,
    ) -> Result<Arc<Pool>, AllocationError> {
        if create_info.memory_type_index as usize >= self.properties.memory_types.len()
            || (1 << create_info.memory_type_index) & self.global_memory_type_bits == 0
        {
            return Err(AllocationError::InvalidConfiguration);
        }

        let max_block_count = if create_info.max_block_count == 0 {
            usize::MAX
        } else {
            create_info.max_block_count
        };
        if create_info.min_block_count > max_block_count {
            return Err(AllocationError::InvalidConfiguration);
        }

        if create_info
            .flags
            .contains(PoolCreateFlags::LINEAR_ALGORITHM | PoolCreateFlags::BUDDY_ALGORITHM)
        {
            return Err(AllocationError::InvalidConfiguration);
        }
        // A linear pool is a single ring; block rotation would defeat its
        // ordering guarantees.
        if create_info.flags.contains(PoolCreateFlags::LINEAR_ALGORITHM) && max_block_count > 1 {
            return Err(AllocationError::InvalidConfiguration);
        }

        let heap_index = self.heap_index(create_info.memory_type_index);
        let heap_size = self.properties.memory_heaps[heap_index].size;
        let default_block_size =
            preferred_block_size(heap_size, self.preferred_large_heap_block_size);

        let id = self.next_pool_id.fetch_add(1, Ordering::Relaxed);
        let pool = Pool::new(self.clone(), create_info, default_block_size, id)?;

        let mut pools = self.pools.lock();
        pools.retain(|weak| weak.strong_count() > 0);
        pools.push(Arc::downgrade(&pool));

        Ok(pool)
    }

    /// Walks every block, pool and dedicated allocation and folds their
    /// layout into per-type, per-heap and total statistics.
    pub fn calculate_stats(&self) -> Stats {
        let mut stats = Stats::new(
            self.properties.memory_types.len(),
            self.properties.memory_heaps.len(),
        );

        for list in &self.block_lists {
            list.add_stats(&mut stats);
        }

        {
            let mut pools = self.pools.lock();
            pools.retain(|weak| weak.strong_count() > 0);
            for weak in pools.iter() {
                if let Some(pool) = weak.upgrade() {
                    pool.block_list().add_stats(&mut stats);
                }
            }
        }

        for (type_index, registry) in self.dedicated.iter().enumerate() {
            let heap_index = self.heap_index(type_index as u32);
            for &size in registry.read().values() {
                let mut info = StatInfo::new();
                info.block_count = 1;
                info.add_allocation(size);

                stats.total.add(&info);
                stats.memory_type[type_index].add(&info);
                stats.memory_heap[heap_index].add(&info);
            }
        }

        stats.post_process();
        stats
    }

    /// Current usage and budget of one heap, or `None` for an out of range
    /// index.
    pub fn get_budget(&self, heap_index: usize) -> Option<BudgetInfo> {
        (heap_index < self.properties.memory_heaps.len())
            .then(|| self.budget.get_budget(self.backend.as_ref(), heap_index))
    }

    /// Declares the start of a new frame for eviction bookkeeping and
    /// refreshes budget samples backed by the backend.
    pub fn set_current_frame_index(&self, frame_index: u32) {
        self.current_frame.store(frame_index, Ordering::Release);
        self.budget.refresh(self.backend.as_ref());
    }

    pub fn current_frame_index(&self) -> u32 {
        self.current_frame.load(Ordering::Acquire)
    }

    pub fn memory_properties(&self) -> &MemoryProperties {
        &self.properties
    }

    /// Whether mapped writes to this type must be flushed explicitly.
    pub fn memory_type_needs_flush(&self, memory_type_index: u32) -> bool {
        let flags = self.properties.memory_types[memory_type_index as usize].property_flags;
        flags.contains(MemoryPropertyFlags::HOST_VISIBLE)
            && !flags.contains(MemoryPropertyFlags::HOST_COHERENT)
    }

    pub(crate) fn heap_index(&self, memory_type_index: u32) -> usize {
        self.properties.memory_types[memory_type_index as usize].heap_index as usize
    }

    pub(crate) fn block_list(&self, memory_type_index: u32) -> &BlockList {
        &self.block_lists[memory_type_index as usize]
    }

    pub(crate) fn backend(&self) -> &Arc<dyn MemoryBackend> {
        &self.backend
    }

    pub(crate) fn budget(&self) -> &Arc<BudgetTracker> {
        &self.budget
    }

    pub(crate) fn heap_budget(&self, heap_index: usize) -> BudgetInfo {
        self.budget.get_budget(self.backend.as_ref(), heap_index)
    }

    /// Asks the backend for a block, with budget admission first and
    /// rollback when the backend refuses.
    pub(crate) fn allocate_backend_memory(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<BlockHandle, AllocationError> {
        let heap_index = self.heap_index(memory_type_index);
        self.budget.try_add_block(heap_index, size)?;

        match self.backend.allocate_block(memory_type_index, size) {
            Ok(memory) => {
                self.budget.note_operation();
                Ok(memory)
            }
            Err(err) => {
                self.budget.on_block_freed(heap_index, size);
                Err(err.into())
            }
        }
    }

    pub(crate) fn free_dedicated_allocation(
        &self,
        id: u64,
        memory: BlockHandle,
        memory_type_index: u32,
        size: DeviceSize,
    ) {
        let removed = self.dedicated[memory_type_index as usize].write().remove(&id);
        debug_assert!(removed.is_some());

        let heap_index = self.heap_index(memory_type_index);
        self.backend.free_block(memory);
        self.budget.on_block_freed(heap_index, size);
        self.budget.remove_allocation(heap_index, size);
    }

    fn memory_type_is_host_visible(&self, memory_type_index: u32) -> bool {
        self.properties.memory_types[memory_type_index as usize]
            .property_flags
            .contains(MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Host-visible but non-coherent types round all mapped accesses to
    /// the atom size, so suballocations are aligned to it up front.
    fn memory_type_min_alignment(&self, memory_type_index: u32) -> DeviceSize {
        if self.memory_type_needs_flush(memory_type_index) {
            self.properties.non_coherent_atom_size.max(1)
        } else {
            1
        }
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("memory_type_count", &self.properties.memory_types.len())
            .field("memory_heap_count", &self.properties.memory_heaps.len())
            .field("current_frame", &self.current_frame_index())
            .finish_non_exhaustive()
    }
}

fn preferred_block_size(heap_size: DeviceSize, large_heap_block_size: DeviceSize) -> DeviceSize {
    let raw = if heap_size <= SMALL_HEAP_MAX_SIZE {
        heap_size / 8
    } else {
        large_heap_block_size
    };
    align_up(raw, 32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::TestBackend;

    const KIB: DeviceSize = 1 << 10;
    const MIB: DeviceSize = 1 << 20;

    fn test_allocator() -> (Arc<TestBackend>, Arc<Allocator>) {
        let backend = Arc::new(TestBackend::new());
        let allocator =
            Allocator::new(backend.clone(), &AllocatorCreateInfo::default()).unwrap();
        (backend, allocator)
    }

    fn requirements(size: DeviceSize) -> MemoryRequirements {
        MemoryRequirements {
            size,
            alignment: 1,
            memory_type_bits: !0,
        }
    }

    #[test]
    fn usage_table_picks_expected_types() {
        let (_backend, allocator) = test_allocator();

        let by_usage = |usage| {
            allocator.find_memory_type_index(
                !0,
                &AllocationCreateInfo {
                    usage,
                    ..AllocationCreateInfo::default()
                },
            )
        };

        assert_eq!(by_usage(MemoryUsage::GpuOnly), Some(0));
        assert_eq!(by_usage(MemoryUsage::CpuOnly), Some(1));
        assert_eq!(by_usage(MemoryUsage::GpuToCpu), Some(2));
        // No host-visible type is device local; ties go to the lowest
        // index.
        assert_eq!(by_usage(MemoryUsage::CpuToGpu), Some(1));
        assert_eq!(by_usage(MemoryUsage::GpuLazilyAllocated), None);
    }

    #[test]
    fn required_flags_and_masks_filter_types() {
        let (_backend, allocator) = test_allocator();

        assert_eq!(
            allocator.find_memory_type_index(
                !0,
                &AllocationCreateInfo {
                    required_flags: MemoryPropertyFlags::HOST_CACHED,
                    ..AllocationCreateInfo::default()
                },
            ),
            Some(2),
        );

        // The requirements mask restricts the usage-driven pick.
        assert_eq!(
            allocator.find_memory_type_index(
                1 << 2,
                &AllocationCreateInfo {
                    usage: MemoryUsage::GpuOnly,
                    ..AllocationCreateInfo::default()
                },
            ),
            Some(2),
        );

        assert_eq!(
            allocator.find_memory_type_index(
                !0,
                &AllocationCreateInfo {
                    required_flags: MemoryPropertyFlags::DEVICE_LOCAL
                        | MemoryPropertyFlags::HOST_CACHED,
                    ..AllocationCreateInfo::default()
                },
            ),
            None,
        );
    }

    #[test]
    fn global_mask_excludes_types_everywhere() {
        let allocator = Allocator::new(
            Arc::new(TestBackend::new()),
            &AllocatorCreateInfo {
                memory_type_bits: (1 << 1) | (1 << 2),
                ..AllocatorCreateInfo::default()
            },
        )
        .unwrap();

        // Type 0 would normally win for GpuOnly; the global mask removes it.
        assert_eq!(
            allocator.find_memory_type_index(
                !0,
                &AllocationCreateInfo {
                    usage: MemoryUsage::GpuOnly,
                    ..AllocationCreateInfo::default()
                },
            ),
            Some(1),
        );

        let err = allocator.create_pool(&PoolCreateInfo {
            memory_type_index: 0,
            ..PoolCreateInfo::default()
        });
        assert_eq!(err.err(), Some(AllocationError::InvalidConfiguration));
    }

    #[test]
    fn large_requests_get_dedicated_blocks() {
        let (backend, allocator) = test_allocator();

        // Heap 0 is 64 MiB, so type 0 blocks prefer 8 MiB; 5 MiB is above
        // half of that.
        let allocation = allocator
            .allocate(
                &requirements(5 * MIB),
                SuballocationKind::Buffer,
                &AllocationCreateInfo {
                    usage: MemoryUsage::GpuOnly,
                    ..AllocationCreateInfo::default()
                },
            )
            .unwrap();

        assert!(allocation.is_dedicated());
        assert_eq!(allocation.offset(), 0);
        assert_eq!(backend.live_blocks(), 1);

        let stats = allocator.calculate_stats();
        assert_eq!(stats.total.block_count, 1);
        assert_eq!(stats.total.allocation_count, 1);
        assert_eq!(stats.total.used_bytes, 5 * MIB);

        drop(allocation);
        assert_eq!(backend.live_blocks(), 0);
        assert_eq!(allocator.calculate_stats().total.allocation_count, 0);
    }

    #[test]
    fn small_requests_share_one_block() {
        let (backend, allocator) = test_allocator();

        let info = AllocationCreateInfo {
            usage: MemoryUsage::GpuOnly,
            ..AllocationCreateInfo::default()
        };
        let first = allocator
            .allocate(&requirements(64 * KIB), SuballocationKind::Buffer, &info)
            .unwrap();
        let second = allocator
            .allocate(&requirements(64 * KIB), SuballocationKind::Buffer, &info)
            .unwrap();

        assert!(!first.is_dedicated() && !second.is_dedicated());
        assert_eq!(backend.live_blocks(), 1);
        assert_ne!(first.offset(), second.offset());
    }

    #[test]
    fn flag_conflicts_are_rejected() {
        let (_backend, allocator) = test_allocator();

        let conflicts = [
            AllocationCreateFlags::DEDICATED_MEMORY | AllocationCreateFlags::NEVER_ALLOCATE,
            AllocationCreateFlags::MAPPED | AllocationCreateFlags::CAN_BECOME_LOST,
            AllocationCreateFlags::DEDICATED_MEMORY | AllocationCreateFlags::CAN_BECOME_LOST,
        ];
        for flags in conflicts {
            assert!(matches!(
                allocator.allocate(
                    &requirements(KIB),
                    SuballocationKind::Buffer,
                    &AllocationCreateInfo {
                        flags,
                        ..AllocationCreateInfo::default()
                    },
                ),
                Err(AllocationError::InvalidConfiguration),
            ));
        }

        assert!(matches!(
            allocator.allocate(
                &requirements(0),
                SuballocationKind::Buffer,
                &AllocationCreateInfo::default(),
            ),
            Err(AllocationError::InvalidConfiguration),
        ));
        assert!(matches!(
            allocator.allocate(
                &MemoryRequirements {
                    size: KIB,
                    alignment: 3,
                    memory_type_bits: !0,
                },
                SuballocationKind::Buffer,
                &AllocationCreateInfo::default(),
            ),
            Err(AllocationError::InvalidConfiguration),
        ));
        assert!(matches!(
            allocator.allocate(
                &requirements(KIB),
                SuballocationKind::Free,
                &AllocationCreateInfo::default(),
            ),
            Err(AllocationError::InvalidConfiguration),
        ));
    }

    #[test]
    fn never_allocate_needs_an_existing_block() {
        let (_backend, allocator) = test_allocator();

        let info = AllocationCreateInfo {
            flags: AllocationCreateFlags::NEVER_ALLOCATE,
            usage: MemoryUsage::GpuOnly,
            ..AllocationCreateInfo::default()
        };
        assert!(matches!(
            allocator.allocate(&requirements(64 * KIB), SuballocationKind::Buffer, &info),
            Err(AllocationError::OutOfDeviceMemory),
        ));

        // Once a block exists, the same request succeeds.
        let _warmup = allocator
            .allocate(
                &requirements(64 * KIB),
                SuballocationKind::Buffer,
                &AllocationCreateInfo {
                    usage: MemoryUsage::GpuOnly,
                    ..AllocationCreateInfo::default()
                },
            )
            .unwrap();
        let pinned = allocator
            .allocate(&requirements(64 * KIB), SuballocationKind::Buffer, &info)
            .unwrap();
        assert!(!pinned.is_dedicated());
    }

    #[test]
    fn mapped_is_dropped_for_device_only_types() {
        let (backend, allocator) = test_allocator();

        let allocation = allocator
            .allocate(
                &requirements(64 * KIB),
                SuballocationKind::Buffer,
                &AllocationCreateInfo {
                    flags: AllocationCreateFlags::MAPPED,
                    usage: MemoryUsage::GpuOnly,
                    ..AllocationCreateInfo::default()
                },
            )
            .unwrap();

        assert_eq!(allocation.memory_type_index(), 0);
        assert!(allocation.mapped_ptr().is_none());
        assert_eq!(backend.mapped_blocks(), 0);
    }

    #[test]
    fn non_coherent_types_get_atom_alignment() {
        let (_backend, allocator) = test_allocator();

        // Type 2 is host visible and cached but not coherent; the atom
        // size is 64.
        let info = AllocationCreateInfo {
            required_flags: MemoryPropertyFlags::HOST_CACHED,
            ..AllocationCreateInfo::default()
        };
        let first = allocator
            .allocate(&requirements(10), SuballocationKind::Buffer, &info)
            .unwrap();
        let second = allocator
            .allocate(&requirements(10), SuballocationKind::Buffer, &info)
            .unwrap();

        assert_eq!(first.memory_type_index(), 2);
        assert_eq!(first.offset() % 64, 0);
        assert_eq!(second.offset() % 64, 0);
        assert_ne!(first.offset(), second.offset());
    }

    #[test]
    fn stats_fold_blocks_pools_and_dedicated() {
        let (_backend, allocator) = test_allocator();

        let _block = allocator
            .allocate(
                &requirements(64 * KIB),
                SuballocationKind::Buffer,
                &AllocationCreateInfo {
                    usage: MemoryUsage::GpuOnly,
                    ..AllocationCreateInfo::default()
                },
            )
            .unwrap();

        let pool = allocator
            .create_pool(&PoolCreateInfo {
                memory_type_index: 0,
                block_size: MIB,
                ..PoolCreateInfo::default()
            })
            .unwrap();
        let _pooled = allocator
            .allocate(
                &requirements(128 * KIB),
                SuballocationKind::Buffer,
                &AllocationCreateInfo {
                    pool: Some(pool.clone()),
                    ..AllocationCreateInfo::default()
                },
            )
            .unwrap();

        let _dedicated = allocator
            .allocate(
                &requirements(5 * MIB),
                SuballocationKind::Buffer,
                &AllocationCreateInfo {
                    usage: MemoryUsage::GpuOnly,
                    ..AllocationCreateInfo::default()
                },
            )
            .unwrap();

        let stats = allocator.calculate_stats();
        assert_eq!(stats.total.block_count, 3);
        assert_eq!(stats.total.allocation_count, 3);
        assert_eq!(stats.total.used_bytes, 64 * KIB + 128 * KIB + 5 * MIB);
        assert_eq!(stats.memory_type[0].allocation_count, 3);
        assert_eq!(stats.memory_heap[0].allocation_count, 3);
        assert_eq!(stats.memory_type[1].allocation_count, 0);
        assert_eq!(stats.total.allocation_size_max, 5 * MIB);
        assert_eq!(stats.total.allocation_size_min, 64 * KIB);
    }

    #[test]
    fn budget_tracks_blocks_and_allocations() {
        let (_backend, allocator) = test_allocator();

        let allocation = allocator
            .allocate(
                &requirements(64 * KIB),
                SuballocationKind::Buffer,
                &AllocationCreateInfo {
                    usage: MemoryUsage::GpuOnly,
                    ..AllocationCreateInfo::default()
                },
            )
            .unwrap();

        let budget = allocator.get_budget(0).unwrap();
        assert_eq!(budget.allocation_bytes, 64 * KIB);
        assert!(budget.block_bytes >= 64 * KIB);
        assert_eq!(budget.usage, budget.block_bytes);

        drop(allocation);
        let budget = allocator.get_budget(0).unwrap();
        assert_eq!(budget.allocation_bytes, 0);
        // The emptied block is retained for reuse.
        assert!(budget.block_bytes > 0);

        assert!(allocator.get_budget(99).is_none());
    }

    #[test]
    fn frame_index_round_trips() {
        let (_backend, allocator) = test_allocator();

        assert_eq!(allocator.current_frame_index(), 0);
        allocator.set_current_frame_index(7);
        assert_eq!(allocator.current_frame_index(), 7);
    }
}
