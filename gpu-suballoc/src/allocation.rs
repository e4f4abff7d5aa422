//! Allocation handles and their lifetime protocol.
//!
//! An [`Allocation`] is what callers hold while they own a piece of device
//! memory. Dropping it returns the memory. Besides the usual accessors it
//! carries two pieces of machinery:
//!
//! - A reference-counted map state. Mapping an allocation maps its whole
//!   backing block at most once, no matter how many allocations in the
//!   block are mapped; the pointer handed out is offset into that shared
//!   mapping. Allocations created with the `MAPPED` flag hold one
//!   persistent reference from birth to drop.
//! - The *lost* protocol. An allocation created with `CAN_BECOME_LOST`
//!   advertises the last frame it was used in ([`Allocation::touch`]) and
//!   may be retired by the allocator to make room once it has gone unused
//!   for longer than the configured frame window. A retired (lost)
//!   allocation keeps its handle alive, but reads as size 0, cannot be
//!   mapped, and frees nothing when dropped. The transition is one-way and
//!   race-checked: eviction candidates are collected without any lock on
//!   the allocation, so the final transition re-validates the last-use
//!   frame with a compare-and-swap.

use crate::{
    allocator::Allocator,
    backend::{BlockHandle, ResourceHandle},
    align_down, align_up,
    block::MemoryBlock,
    metadata::SuballocationKind,
    pool::Pool,
    AllocationError, DeviceSize,
};
use std::{
    ptr::NonNull,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
};

/// Sentinel value of `last_use_frame` marking a lost allocation.
pub(crate) const FRAME_INDEX_LOST: u32 = u32::MAX;

/// Lifetime state shared between an [`Allocation`] handle and the
/// suballocation record inside its block.
///
/// The block metadata needs to read and transition this state while the
/// handle is owned elsewhere, which is why it lives behind an `Arc` rather
/// than inside the handle.
#[derive(Debug)]
pub(crate) struct AllocationState {
    /// Frame index of the most recent touch, or [`FRAME_INDEX_LOST`].
    last_use_frame: AtomicU32,
    can_become_lost: bool,
}

impl AllocationState {
    pub fn new(current_frame: u32, can_become_lost: bool) -> Self {
        AllocationState {
            last_use_frame: AtomicU32::new(current_frame),
            can_become_lost,
        }
    }

    pub fn can_become_lost(&self) -> bool {
        self.can_become_lost
    }

    pub fn is_lost(&self) -> bool {
        self.can_become_lost && self.last_use_frame.load(Ordering::Acquire) == FRAME_INDEX_LOST
    }

    pub fn last_use_frame(&self) -> u32 {
        self.last_use_frame.load(Ordering::Acquire)
    }

    /// Marks the allocation as used in `current_frame`.
    ///
    /// Returns `false` if the allocation was already lost. For allocations
    /// that cannot become lost this is a plain store; otherwise it is a CAS
    /// loop so a concurrent lost transition is never overwritten.
    pub fn touch(&self, current_frame: u32) -> bool {
        if !self.can_become_lost {
            self.last_use_frame.store(current_frame, Ordering::Release);
            return true;
        }

        let mut last_use = self.last_use_frame.load(Ordering::Acquire);
        loop {
            if last_use == FRAME_INDEX_LOST {
                return false;
            }
            if last_use == current_frame {
                return true;
            }

            match self.last_use_frame.compare_exchange_weak(
                last_use,
                current_frame,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => last_use = observed,
            }
        }
    }

    /// Attempts the one-way transition to lost.
    ///
    /// Succeeds only if the allocation has not been touched for more than
    /// `frame_in_use_count` frames and no other thread lost it first. On
    /// failure nothing changes and the caller must redo its search.
    pub fn try_make_lost(&self, current_frame: u32, frame_in_use_count: u32) -> bool {
        debug_assert!(self.can_become_lost);

        let mut last_use = self.last_use_frame.load(Ordering::Acquire);
        loop {
            if last_use == FRAME_INDEX_LOST {
                return false;
            }
            // 64-bit so a frame window near u32::MAX cannot wrap.
            if last_use as u64 + frame_in_use_count as u64 >= current_frame as u64 {
                return false;
            }

            match self.last_use_frame.compare_exchange_weak(
                last_use,
                FRAME_INDEX_LOST,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => last_use = observed,
            }
        }
    }
}

/// Where an allocation's bytes live.
#[derive(Debug)]
enum AllocParent {
    /// Carved out of a block shared with other allocations.
    Block {
        allocator: Arc<Allocator>,
        /// Keeps custom pools alive while they have live allocations, and
        /// routes the free back to the right block list.
        pool: Option<Arc<Pool>>,
        /// Weak so an evicted block can be returned to the backend while
        /// lost handles still exist.
        block: Weak<MemoryBlock>,
        offset: DeviceSize,
        token: usize,
    },
    /// Exclusively owns a whole backend block.
    Dedicated {
        allocator: Arc<Allocator>,
        id: u64,
        memory: BlockHandle,
        mapped_ptr: Option<NonNull<u8>>,
    },
}

/// One live device-memory allocation. Frees itself on drop.
#[derive(Debug)]
pub struct Allocation {
    size: DeviceSize,
    alignment: DeviceSize,
    memory_type_index: u32,
    kind: SuballocationKind,
    state: Arc<AllocationState>,
    /// Outstanding `map` calls by the holder of this handle.
    map_refs: u32,
    /// Created pre-mapped; one block map reference is held until drop.
    persistent_map: bool,
    user_data: Option<u64>,
    parent: AllocParent,
}

// SAFETY: The mapped pointer is only holding a device mapping valid for the
// lifetime of the backing block; it is never dereferenced by this crate, and
// the backend contract makes the mapping usable from any thread.
unsafe impl Send for Allocation {}
unsafe impl Sync for Allocation {}

impl Allocation {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn block(
        allocator: Arc<Allocator>,
        pool: Option<Arc<Pool>>,
        block: &Arc<MemoryBlock>,
        offset: DeviceSize,
        token: usize,
        size: DeviceSize,
        alignment: DeviceSize,
        kind: SuballocationKind,
        state: Arc<AllocationState>,
        persistent_map: bool,
        user_data: Option<u64>,
    ) -> Self {
        Allocation {
            size,
            alignment,
            memory_type_index: block.memory_type_index(),
            kind,
            state,
            map_refs: 0,
            persistent_map,
            user_data,
            parent: AllocParent::Block {
                allocator,
                pool,
                block: Arc::downgrade(block),
                offset,
                token,
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn dedicated(
        allocator: Arc<Allocator>,
        id: u64,
        memory: BlockHandle,
        memory_type_index: u32,
        size: DeviceSize,
        alignment: DeviceSize,
        kind: SuballocationKind,
        state: Arc<AllocationState>,
        mapped_ptr: Option<NonNull<u8>>,
        user_data: Option<u64>,
    ) -> Self {
        Allocation {
            size,
            alignment,
            memory_type_index,
            kind,
            state,
            map_refs: 0,
            persistent_map: mapped_ptr.is_some(),
            user_data,
            parent: AllocParent::Dedicated {
                allocator,
                id,
                memory,
                mapped_ptr,
            },
        }
    }

    /// Size in bytes, or 0 once the allocation is lost.
    pub fn size(&self) -> DeviceSize {
        if self.state.is_lost() {
            0
        } else {
            self.size
        }
    }

    pub fn alignment(&self) -> DeviceSize {
        self.alignment
    }

    /// Offset inside the backing block. 0 for dedicated allocations.
    pub fn offset(&self) -> DeviceSize {
        match &self.parent {
            AllocParent::Block { offset, .. } => *offset,
            AllocParent::Dedicated { .. } => 0,
        }
    }

    /// Backend handle of the backing block, shared or dedicated. `None`
    /// once the allocation is lost and its block has been retired.
    pub fn block_handle(&self) -> Option<BlockHandle> {
        match &self.parent {
            AllocParent::Block { block, .. } => block.upgrade().map(|block| block.memory()),
            AllocParent::Dedicated { memory, .. } => Some(*memory),
        }
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn kind(&self) -> SuballocationKind {
        self.kind
    }

    /// Whether this allocation owns its backend block exclusively.
    pub fn is_dedicated(&self) -> bool {
        matches!(self.parent, AllocParent::Dedicated { .. })
    }

    pub fn can_become_lost(&self) -> bool {
        self.state.can_become_lost()
    }

    pub fn is_lost(&self) -> bool {
        self.state.is_lost()
    }

    pub fn user_data(&self) -> Option<u64> {
        self.user_data
    }

    pub fn set_user_data(&mut self, user_data: Option<u64>) {
        self.user_data = user_data;
    }

    /// Marks the allocation as used in the allocator's current frame.
    ///
    /// Callers using `CAN_BECOME_LOST` must call this every frame the
    /// resource is in flight, and must treat a `false` return as the
    /// resource being gone.
    pub fn touch(&self) -> bool {
        self.state.touch(self.allocator().current_frame_index())
    }

    pub(crate) fn state(&self) -> &Arc<AllocationState> {
        &self.state
    }

    fn allocator(&self) -> &Arc<Allocator> {
        match &self.parent {
            AllocParent::Block { allocator, .. } => allocator,
            AllocParent::Dedicated { allocator, .. } => allocator,
        }
    }

    /// Maps the allocation for host access and returns a pointer to its
    /// first byte.
    ///
    /// Mapping is reference-counted per allocation and per block; the
    /// backend is only asked to map a block on the first reference. Every
    /// call must be paired with an [`unmap`](Self::unmap).
    pub fn map(&mut self) -> Result<NonNull<u8>, AllocationError> {
        // Evictable allocations cannot be mapped: eviction would pull the
        // block out from under the pointer.
        if self.state.can_become_lost() {
            return Err(AllocationError::InvalidConfiguration);
        }

        let map_refs = self
            .map_refs
            .checked_add(1)
            .ok_or(AllocationError::MapFailed)?;

        let ptr = match &mut self.parent {
            AllocParent::Block { block, offset, .. } => {
                let block = block.upgrade().ok_or(AllocationError::MapFailed)?;
                let base = block.map()?;
                // SAFETY: `offset` lies inside the block's mapping.
                unsafe { NonNull::new_unchecked(base.as_ptr().add(*offset as usize)) }
            }
            AllocParent::Dedicated {
                allocator,
                memory,
                mapped_ptr,
                ..
            } => match *mapped_ptr {
                Some(ptr) => ptr,
                None => {
                    let ptr = allocator.backend().map_block(*memory)?;
                    *mapped_ptr = Some(ptr);
                    ptr
                }
            },
        };

        self.map_refs = map_refs;

        Ok(ptr)
    }

    /// Releases one map reference.
    pub fn unmap(&mut self) -> Result<(), AllocationError> {
        if self.map_refs == 0 {
            return Err(AllocationError::MapFailed);
        }

        match &mut self.parent {
            AllocParent::Block { block, .. } => {
                let block = block.upgrade().ok_or(AllocationError::MapFailed)?;
                block.unmap()?;
            }
            AllocParent::Dedicated {
                allocator,
                memory,
                mapped_ptr,
                ..
            } => {
                if self.map_refs == 1 && !self.persistent_map {
                    allocator.backend().unmap_block(*memory);
                    *mapped_ptr = None;
                }
            }
        }

        self.map_refs -= 1;

        Ok(())
    }

    /// Pointer to the allocation's first byte, if it is currently mapped
    /// (through [`map`](Self::map) or the `MAPPED` create flag).
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        if self.map_refs == 0 && !self.persistent_map {
            return None;
        }

        match &self.parent {
            AllocParent::Block { block, offset, .. } => {
                let block = block.upgrade()?;
                let base = block.mapped_ptr()?;
                // SAFETY: `offset` lies inside the block's mapping.
                Some(unsafe { NonNull::new_unchecked(base.as_ptr().add(*offset as usize)) })
            }
            AllocParent::Dedicated { mapped_ptr, .. } => *mapped_ptr,
        }
    }

    /// Binds a backend resource to this allocation's memory.
    ///
    /// `local_offset` is relative to the allocation start and must lie
    /// within it.
    pub fn bind_resource(
        &self,
        resource: ResourceHandle,
        local_offset: DeviceSize,
    ) -> Result<(), AllocationError> {
        if local_offset >= self.size() {
            return Err(AllocationError::InvalidConfiguration);
        }

        match &self.parent {
            AllocParent::Block {
                allocator,
                block,
                offset,
                ..
            } => {
                let block = block.upgrade().ok_or(AllocationError::OutOfDeviceMemory)?;
                allocator
                    .backend()
                    .bind_resource(resource, block.memory(), offset + local_offset)?;
            }
            AllocParent::Dedicated {
                allocator, memory, ..
            } => {
                allocator
                    .backend()
                    .bind_resource(resource, *memory, local_offset)?;
            }
        }

        Ok(())
    }

    /// Flushes a mapped range so device reads observe host writes.
    ///
    /// `size` of `None` means up to the end of the allocation. No-op for
    /// host-coherent memory types.
    pub fn flush(
        &self,
        local_offset: DeviceSize,
        size: Option<DeviceSize>,
    ) -> Result<(), AllocationError> {
        self.flush_or_invalidate(local_offset, size, CacheOp::Flush)
    }

    /// Invalidates a mapped range so host reads observe device writes.
    ///
    /// `size` of `None` means up to the end of the allocation. No-op for
    /// host-coherent memory types.
    pub fn invalidate(
        &self,
        local_offset: DeviceSize,
        size: Option<DeviceSize>,
    ) -> Result<(), AllocationError> {
        self.flush_or_invalidate(local_offset, size, CacheOp::Invalidate)
    }

    fn flush_or_invalidate(
        &self,
        local_offset: DeviceSize,
        size: Option<DeviceSize>,
        op: CacheOp,
    ) -> Result<(), AllocationError> {
        let alloc_size = self.size();
        let size = size.unwrap_or(alloc_size.saturating_sub(local_offset));
        let local_end = local_offset
            .checked_add(size)
            .filter(|&end| end <= alloc_size)
            .ok_or(AllocationError::InvalidConfiguration)?;

        let allocator = self.allocator();
        if !allocator.memory_type_needs_flush(self.memory_type_index) {
            return Ok(());
        }

        let atom = allocator.memory_properties().non_coherent_atom_size;

        let (memory, block_size, base_offset) = match &self.parent {
            AllocParent::Block { block, offset, .. } => {
                let block = block.upgrade().ok_or(AllocationError::MapFailed)?;
                (block.memory(), block.size(), *offset)
            }
            AllocParent::Dedicated { memory, .. } => (*memory, self.size, 0),
        };

        // Round outward to atom boundaries, staying inside the block.
        let start = align_down(base_offset + local_offset, atom);
        let end = align_up(base_offset + local_end, atom).min(block_size);

        let backend = allocator.backend();
        match op {
            CacheOp::Flush => backend.flush_mapped_range(memory, start, end - start)?,
            CacheOp::Invalidate => backend.invalidate_mapped_range(memory, start, end - start)?,
        }

        Ok(())
    }
}

#[derive(Clone, Copy)]
enum CacheOp {
    Flush,
    Invalidate,
}

impl Drop for Allocation {
    fn drop(&mut self) {
        debug_assert!(self.map_refs == 0, "allocation dropped while mapped");

        match &self.parent {
            AllocParent::Block {
                allocator,
                pool,
                block,
                offset,
                token,
            } => {
                // A lost allocation's run was already freed by the
                // eviction, and its size must read as 0 for the budget.
                let lost = !self.state.touch(allocator.current_frame_index());
                let settled_size = if lost { 0 } else { self.size };

                if !lost {
                    if let Some(block) = block.upgrade() {
                        let list = match pool {
                            Some(pool) => pool.block_list(),
                            None => allocator.block_list(self.memory_type_index),
                        };
                        list.free(allocator, &block, *offset, *token, self.persistent_map);
                    }
                }

                let heap_index = allocator.heap_index(self.memory_type_index);
                allocator
                    .budget()
                    .remove_allocation(heap_index, settled_size);
            }
            AllocParent::Dedicated {
                allocator,
                id,
                memory,
                mapped_ptr,
            } => {
                if mapped_ptr.is_some() {
                    allocator.backend().unmap_block(*memory);
                }
                allocator.free_dedicated_allocation(*id, *memory, self.memory_type_index, self.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn touch_updates_last_use() {
        let state = AllocationState::new(10, true);

        assert!(state.touch(11));
        assert!(!state.is_lost());
        // Too recent to evict with a window of 2.
        assert!(!state.try_make_lost(12, 2));
        // 11 + 2 < 14.
        assert!(state.try_make_lost(14, 2));
        assert!(state.is_lost());
    }

    #[test]
    fn lost_is_terminal() {
        let state = AllocationState::new(0, true);

        assert!(state.try_make_lost(100, 0));
        assert!(state.is_lost());
        assert!(!state.touch(101));
        assert!(!state.try_make_lost(200, 0));
        assert!(state.is_lost());
    }

    #[test]
    fn eviction_window_boundary() {
        let state = AllocationState::new(5, true);

        // last_use + window >= current refuses; strictly greater succeeds.
        assert!(!state.try_make_lost(7, 2));
        assert!(!state.try_make_lost(7, 5));
        assert!(state.try_make_lost(8, 2));
    }

    #[test]
    fn pinned_allocations_never_lose() {
        let state = AllocationState::new(0, false);

        assert!(!state.is_lost());
        assert!(state.touch(5));
        assert!(!state.is_lost());
    }

    #[test]
    fn concurrent_touch_and_make_lost_agree() {
        // Whatever the interleaving, the two sides must never both
        // succeed in the same round: a touch landing first blocks the
        // eviction, an eviction landing first makes every later touch
        // report lost.
        for _ in 0..64 {
            let state = AllocationState::new(0, true);

            thread::scope(|scope| {
                let toucher = scope.spawn(|| state.touch(10));
                let evictor = scope.spawn(|| state.try_make_lost(10, 2));

                let touched = toucher.join().unwrap();
                let evicted = evictor.join().unwrap();

                assert!(touched != evicted);
            });
        }
    }
}
