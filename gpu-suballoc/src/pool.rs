//! Custom memory pools.
//!
//! A pool is a self-contained block list for one memory type, with its own
//! block sizing, block count bounds and placement algorithm. Requests are
//! routed into a pool by setting [`AllocationCreateInfo::pool`]; everything
//! else about the request behaves as usual, except that a pool never falls
//! back to a dedicated allocation.
//!
//! [`AllocationCreateInfo::pool`]: crate::allocator::AllocationCreateInfo::pool

use crate::{
    allocator::Allocator,
    list::BlockList,
    metadata::Algorithm,
    stats::PoolStats,
    AllocationError, DeviceSize, NonExhaustive,
};
use std::{fmt, sync::Arc};

bitflags::bitflags! {
    /// Flags configuring a [`Pool`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct PoolCreateFlags: u32 {
        /// Place allocations of all kinds back to back, without page
        /// separation. Only safe when the pool will never mix linear and
        /// non-linear resources on the same block.
        const IGNORE_BUFFER_IMAGE_GRANULARITY = 1 << 0;

        /// Use the linear (ring) placement engine. Requires a block count
        /// of at most one.
        const LINEAR_ALGORITHM = 1 << 1;

        /// Use the buddy placement engine.
        const BUDDY_ALGORITHM = 1 << 2;
    }
}

/// Parameters of a new [`Pool`].
#[derive(Clone, Debug)]
pub struct PoolCreateInfo {
    /// Index of the memory type all blocks of the pool are allocated from.
    ///
    /// The default is `0`.
    pub memory_type_index: u32,

    /// Additional properties of the pool.
    ///
    /// The default is [`PoolCreateFlags::empty()`].
    pub flags: PoolCreateFlags,

    /// Size of the pool's blocks, or 0 to let the allocator pick a size
    /// appropriate for the heap. A nonzero size is used exactly as given,
    /// never halved.
    ///
    /// The default is `0`.
    pub block_size: DeviceSize,

    /// Number of blocks created up front and never freed.
    ///
    /// The default is `0`.
    pub min_block_count: usize,

    /// Upper bound on the number of blocks, or 0 for no bound.
    ///
    /// The default is `0`.
    pub max_block_count: usize,

    /// How many frames back an evictable allocation must have been last
    /// used before the pool may retire it.
    ///
    /// The default is `0`.
    pub frame_in_use_count: u32,

    pub _ne: NonExhaustive,
}

impl Default for PoolCreateInfo {
    fn default() -> Self {
        PoolCreateInfo {
            memory_type_index: 0,
            flags: PoolCreateFlags::empty(),
            block_size: 0,
            min_block_count: 0,
            max_block_count: 0,
            frame_in_use_count: 0,
            _ne: NonExhaustive(()),
        }
    }
}

/// A custom pool of memory blocks.
///
/// Dropping the pool returns its blocks to the backend. Allocations keep
/// their pool alive, so the blocks outlive every suballocation made from
/// them.
pub struct Pool {
    allocator: Arc<Allocator>,
    list: BlockList,
    id: u32,
}

impl Pool {
    pub(crate) fn new(
        allocator: Arc<Allocator>,
        create_info: &PoolCreateInfo,
        default_block_size: DeviceSize,
        id: u32,
    ) -> Result<Arc<Self>, AllocationError> {
        let algorithm = if create_info.flags.contains(PoolCreateFlags::LINEAR_ALGORITHM) {
            Algorithm::Linear
        } else if create_info.flags.contains(PoolCreateFlags::BUDDY_ALGORITHM) {
            Algorithm::Buddy
        } else {
            Algorithm::Generic
        };

        let (block_size, explicit_block_size) = if create_info.block_size != 0 {
            (create_info.block_size, true)
        } else {
            (default_block_size, false)
        };

        let max_block_count = if create_info.max_block_count == 0 {
            usize::MAX
        } else {
            create_info.max_block_count
        };

        let properties = allocator.memory_properties();
        let granularity = if create_info
            .flags
            .contains(PoolCreateFlags::IGNORE_BUFFER_IMAGE_GRANULARITY)
        {
            1
        } else {
            properties.buffer_image_granularity
        };
        let heap_index = allocator.heap_index(create_info.memory_type_index);

        let list = BlockList::new(
            create_info.memory_type_index,
            heap_index,
            block_size,
            create_info.min_block_count,
            max_block_count,
            granularity,
            create_info.frame_in_use_count,
            explicit_block_size,
            algorithm,
            true,
        );

        let pool = Arc::new(Pool {
            allocator,
            list,
            id,
        });
        pool.list.create_min_blocks(&pool.allocator)?;

        Ok(pool)
    }

    pub(crate) fn block_list(&self) -> &BlockList {
        &self.list
    }

    pub(crate) fn allocator(&self) -> &Arc<Allocator> {
        &self.allocator
    }

    /// An identifier unique among the pools of one allocator.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn memory_type_index(&self) -> u32 {
        self.list.memory_type_index()
    }

    pub fn block_count(&self) -> usize {
        self.list.block_count()
    }

    /// Summarizes the pool's blocks and their layout.
    pub fn stats(&self) -> PoolStats {
        self.list.pool_stats()
    }

    /// Retires every evictable allocation in the pool that has not been
    /// used for more than the pool's frame-in-use window. Returns how many
    /// were retired.
    pub fn make_allocations_lost(&self) -> usize {
        self.list.make_allocations_lost(&self.allocator)
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("memory_type_index", &self.list.memory_type_index())
            .field("algorithm", &self.list.algorithm())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{
        AllocationCreateFlags, AllocationCreateInfo, Allocator, AllocatorCreateInfo,
        MemoryRequirements,
    };
    use crate::metadata::SuballocationKind;
    use crate::tests::TestBackend;

    const KIB: DeviceSize = 1 << 10;
    const MIB: DeviceSize = 1 << 20;

    fn test_allocator() -> (Arc<TestBackend>, Arc<Allocator>) {
        let backend = Arc::new(TestBackend::new());
        let allocator =
            Allocator::new(backend.clone(), &AllocatorCreateInfo::default()).unwrap();
        (backend, allocator)
    }

    fn allocate(
        allocator: &Arc<Allocator>,
        pool: &Arc<Pool>,
        size: DeviceSize,
    ) -> Result<crate::allocation::Allocation, AllocationError> {
        allocator.allocate(
            &MemoryRequirements {
                size,
                alignment: 1,
                memory_type_bits: !0,
            },
            SuballocationKind::Buffer,
            &AllocationCreateInfo {
                pool: Some(pool.clone()),
                ..AllocationCreateInfo::default()
            },
        )
    }

    #[test]
    fn explicit_block_size_is_a_hard_ceiling() {
        let (backend, allocator) = test_allocator();

        let pool = allocator
            .create_pool(&PoolCreateInfo {
                memory_type_index: 0,
                block_size: MIB,
                ..PoolCreateInfo::default()
            })
            .unwrap();

        assert!(matches!(
            allocate(&allocator, &pool, 2 * MIB),
            Err(AllocationError::OutOfDeviceMemory),
        ));
        // The failed request must not have created a block.
        assert_eq!(pool.block_count(), 0);
        assert_eq!(backend.live_blocks(), 0);

        let allocation = allocate(&allocator, &pool, 512 * KIB).unwrap();
        assert_eq!(pool.block_count(), 1);
        assert_eq!(allocation.size(), 512 * KIB);
    }

    #[test]
    fn min_blocks_are_created_up_front() {
        let (backend, allocator) = test_allocator();

        let pool = allocator
            .create_pool(&PoolCreateInfo {
                memory_type_index: 0,
                block_size: MIB,
                min_block_count: 2,
                ..PoolCreateInfo::default()
            })
            .unwrap();

        assert_eq!(pool.block_count(), 2);
        assert_eq!(backend.live_blocks(), 2);

        let stats = pool.stats();
        assert_eq!(stats.size, 2 * MIB);
        assert_eq!(stats.unused_size, 2 * MIB);
        assert_eq!(stats.allocation_count, 0);

        // Freeing the only allocation may not drop below the minimum.
        let allocation = allocate(&allocator, &pool, 64 * KIB).unwrap();
        drop(allocation);
        assert_eq!(pool.block_count(), 2);
    }

    #[test]
    fn linear_pool_wraps_into_freed_space() {
        let (_backend, allocator) = test_allocator();

        let pool = allocator
            .create_pool(&PoolCreateInfo {
                memory_type_index: 0,
                flags: PoolCreateFlags::LINEAR_ALGORITHM
                    | PoolCreateFlags::IGNORE_BUFFER_IMAGE_GRANULARITY,
                block_size: MIB,
                max_block_count: 1,
                ..PoolCreateInfo::default()
            })
            .unwrap();

        let first = allocate(&allocator, &pool, 256 * KIB).unwrap();
        let _second = allocate(&allocator, &pool, 256 * KIB).unwrap();
        let _third = allocate(&allocator, &pool, 512 * KIB).unwrap();
        assert_eq!(pool.block_count(), 1);

        // Block full; the single block is the only one allowed.
        assert!(allocate(&allocator, &pool, 256 * KIB).is_err());

        // Freeing the oldest run opens the head of the ring.
        drop(first);
        let fourth = allocate(&allocator, &pool, 256 * KIB).unwrap();
        assert_eq!(fourth.offset(), 0);
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn buddy_pool_reports_rounded_sizes() {
        let (_backend, allocator) = test_allocator();

        let pool = allocator
            .create_pool(&PoolCreateInfo {
                memory_type_index: 0,
                flags: PoolCreateFlags::BUDDY_ALGORITHM,
                block_size: MIB,
                ..PoolCreateInfo::default()
            })
            .unwrap();

        let allocation = allocate(&allocator, &pool, 300 * KIB).unwrap();
        assert_eq!(allocation.size(), 300 * KIB);

        // The engine carves a 512 KiB node for a 300 KiB request.
        let stats = pool.stats();
        assert_eq!(stats.size, MIB);
        assert_eq!(stats.unused_size, 512 * KIB);
    }

    #[test]
    fn uneven_buddy_block_serves_only_its_prefix() {
        let (_backend, allocator) = test_allocator();

        // 3 MiB blocks give the engine a 2 MiB usable prefix.
        let pool = allocator
            .create_pool(&PoolCreateInfo {
                memory_type_index: 0,
                flags: PoolCreateFlags::BUDDY_ALGORITHM,
                block_size: 3 * MIB,
                ..PoolCreateInfo::default()
            })
            .unwrap();

        // Under the block size but over the prefix: the fresh block
        // refuses and the request fails cleanly.
        assert!(matches!(
            allocate(&allocator, &pool, 5 * MIB / 2),
            Err(AllocationError::OutOfDeviceMemory),
        ));
        assert_eq!(pool.block_count(), 1);

        // The prefix itself is still fully usable.
        let allocation = allocate(&allocator, &pool, 2 * MIB).unwrap();
        assert_eq!(allocation.size(), 2 * MIB);
        assert_eq!(pool.block_count(), 1);
    }

    #[test]
    fn frame_window_delays_eviction() {
        let (_backend, allocator) = test_allocator();

        let pool = allocator
            .create_pool(&PoolCreateInfo {
                memory_type_index: 0,
                block_size: MIB,
                max_block_count: 1,
                frame_in_use_count: 2,
                ..PoolCreateInfo::default()
            })
            .unwrap();

        allocator.set_current_frame_index(10);
        let lossy = allocator
            .allocate(
                &MemoryRequirements {
                    size: 512 * KIB,
                    alignment: 1,
                    memory_type_bits: !0,
                },
                SuballocationKind::Buffer,
                &AllocationCreateInfo {
                    pool: Some(pool.clone()),
                    flags: AllocationCreateFlags::CAN_BECOME_LOST,
                    ..AllocationCreateInfo::default()
                },
            )
            .unwrap();

        // Frames 11 and 12 are still within the in-use window.
        allocator.set_current_frame_index(12);
        assert_eq!(pool.make_allocations_lost(), 0);
        assert!(!lossy.is_lost());

        allocator.set_current_frame_index(13);
        assert_eq!(pool.make_allocations_lost(), 1);
        assert!(lossy.is_lost());
        assert_eq!(lossy.size(), 0);
    }

    #[test]
    fn invalid_configurations_are_rejected() {
        let (_backend, allocator) = test_allocator();

        // A linear pool is a single ring.
        assert!(matches!(
            allocator.create_pool(&PoolCreateInfo {
                flags: PoolCreateFlags::LINEAR_ALGORITHM,
                max_block_count: 2,
                ..PoolCreateInfo::default()
            }),
            Err(AllocationError::InvalidConfiguration),
        ));

        assert!(matches!(
            allocator.create_pool(&PoolCreateInfo {
                flags: PoolCreateFlags::LINEAR_ALGORITHM | PoolCreateFlags::BUDDY_ALGORITHM,
                max_block_count: 1,
                ..PoolCreateInfo::default()
            }),
            Err(AllocationError::InvalidConfiguration),
        ));

        assert!(matches!(
            allocator.create_pool(&PoolCreateInfo {
                min_block_count: 3,
                max_block_count: 2,
                ..PoolCreateInfo::default()
            }),
            Err(AllocationError::InvalidConfiguration),
        ));

        assert!(matches!(
            allocator.create_pool(&PoolCreateInfo {
                memory_type_index: 99,
                ..PoolCreateInfo::default()
            }),
            Err(AllocationError::InvalidConfiguration),
        ));
    }

    #[test]
    fn pool_ids_are_unique() {
        let (_backend, allocator) = test_allocator();

        let first = allocator.create_pool(&PoolCreateInfo::default()).unwrap();
        let second = allocator.create_pool(&PoolCreateInfo::default()).unwrap();
        assert_ne!(first.id(), second.id());
    }
}
