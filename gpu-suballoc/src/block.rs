//! One backend memory block: its bookkeeping and its shared map state.

use crate::{
    backend::{BlockHandle, MemoryBackend},
    budget::BudgetTracker,
    metadata::{Algorithm, BlockMetadata},
    AllocationError, DeviceSize,
};
use parking_lot::{Mutex, MutexGuard};
use std::{
    fmt,
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

#[derive(Debug, Default)]
struct MapState {
    /// Outstanding map references, over all allocations in the block.
    count: u32,
    ptr: Option<NonNull<u8>>,
}

/// A single block of backend memory, shared by many allocations.
///
/// The block owns its backend handle: dropping it returns the memory to the
/// backend and settles the heap's budget counters. It must be empty by
/// then; the owning list only drops blocks it has verified empty, and
/// allocation handles keep their list alive.
pub(crate) struct MemoryBlock {
    backend: Arc<dyn MemoryBackend>,
    budget: Arc<BudgetTracker>,
    /// Per-list sequence number, for telling blocks apart in debug output.
    id: u32,
    memory_type_index: u32,
    heap_index: usize,
    memory: BlockHandle,
    size: DeviceSize,
    metadata: Mutex<BlockMetadata>,
    /// Cached copy of the metadata's free byte total, so block ordering
    /// can read it without the metadata lock.
    free_size: AtomicU64,
    map_state: Mutex<MapState>,
}

// SAFETY: The mapped pointer is an address into a backend mapping that
// stays valid until `unmap_block`; this crate never dereferences it, and
// the backend contract makes it usable from any thread.
unsafe impl Send for MemoryBlock {}
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        budget: Arc<BudgetTracker>,
        id: u32,
        memory_type_index: u32,
        heap_index: usize,
        memory: BlockHandle,
        size: DeviceSize,
        algorithm: Algorithm,
    ) -> Self {
        MemoryBlock {
            backend,
            budget,
            id,
            memory_type_index,
            heap_index,
            memory,
            size,
            metadata: Mutex::new(BlockMetadata::new(algorithm, size)),
            free_size: AtomicU64::new(size),
            map_state: Mutex::new(MapState::default()),
        }
    }

    pub fn memory(&self) -> BlockHandle {
        self.memory
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn size(&self) -> DeviceSize {
        self.size
    }

    pub fn metadata(&self) -> MutexGuard<'_, BlockMetadata> {
        self.metadata.lock()
    }

    pub fn free_size(&self) -> DeviceSize {
        self.free_size.load(Ordering::Acquire)
    }

    /// Callers update this after every metadata mutation, while still
    /// holding the metadata lock.
    pub fn set_free_size(&self, free_size: DeviceSize) {
        self.free_size.store(free_size, Ordering::Release);
    }

    /// Maps the block and returns the base pointer, mapping through the
    /// backend only on the first reference.
    pub fn map(&self) -> Result<NonNull<u8>, AllocationError> {
        let mut state = self.map_state.lock();

        let count = state
            .count
            .checked_add(1)
            .ok_or(AllocationError::MapFailed)?;

        let ptr = match state.ptr {
            Some(ptr) => ptr,
            None => {
                let ptr = self.backend.map_block(self.memory)?;
                state.ptr = Some(ptr);
                ptr
            }
        };

        state.count = count;

        Ok(ptr)
    }

    /// Releases one map reference, unmapping through the backend when the
    /// last one goes.
    pub fn unmap(&self) -> Result<(), AllocationError> {
        let mut state = self.map_state.lock();

        if state.count == 0 {
            return Err(AllocationError::MapFailed);
        }

        if state.count == 1 {
            self.backend.unmap_block(self.memory);
            state.ptr = None;
        }
        state.count -= 1;

        Ok(())
    }

    /// The block's base pointer while at least one map reference exists.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.map_state.lock().ptr
    }
}

impl Drop for MemoryBlock {
    fn drop(&mut self) {
        debug_assert!(
            self.metadata.get_mut().is_empty(),
            "block dropped with live allocations"
        );

        let map_state = self.map_state.get_mut();
        debug_assert!(map_state.count == 0, "block dropped while mapped");
        if map_state.ptr.is_some() {
            self.backend.unmap_block(self.memory);
        }

        self.backend.free_block(self.memory);
        self.budget.on_block_freed(self.heap_index, self.size);
    }
}

impl fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("id", &self.id)
            .field("memory", &self.memory)
            .field("memory_type_index", &self.memory_type_index)
            .field("heap_index", &self.heap_index)
            .field("size", &self.size)
            .field("free_size", &self.free_size)
            .finish_non_exhaustive()
    }
}
