//! The boundary between this crate and the code that owns the device.
//!
//! The allocator itself never calls a driver. All block-granular operations
//! are delegated to a [`MemoryBackend`] implementation injected at
//! construction, and everything the allocator knows about the device's
//! memory layout comes from the [`MemoryProperties`] that implementation
//! reports.

use crate::{AllocationError, DeviceSize};
use std::{error::Error, fmt, ptr::NonNull};

/// Maximum number of memory types a backend may report.
pub const MAX_MEMORY_TYPES: usize = 32;

/// Maximum number of memory heaps a backend may report.
pub const MAX_MEMORY_HEAPS: usize = 16;

/// Opaque identifier of one backend-allocated memory block.
///
/// The allocator never interprets the value; it only hands it back to the
/// backend that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockHandle(pub u64);

/// Opaque identifier of a backend resource (a buffer or an image) that can
/// be bound to block memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ResourceHandle(pub u64);

bitflags::bitflags! {
    /// Properties of a memory type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MemoryPropertyFlags: u32 {
        /// Memory of this type is the most efficient for device access.
        const DEVICE_LOCAL = 1 << 0;
        /// Memory of this type can be mapped for host access.
        const HOST_VISIBLE = 1 << 1;
        /// Host writes are visible to the device without explicit flushes,
        /// and device writes to the host without explicit invalidation.
        const HOST_COHERENT = 1 << 2;
        /// Host access to this memory is cached.
        const HOST_CACHED = 1 << 3;
        /// Memory of this type is committed lazily by the device.
        const LAZILY_ALLOCATED = 1 << 4;
    }
}

/// One memory type reported by the backend.
#[derive(Clone, Copy, Debug)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
    /// Index into [`MemoryProperties::memory_heaps`] of the heap this type
    /// allocates from.
    pub heap_index: u32,
}

/// One memory heap reported by the backend.
#[derive(Clone, Copy, Debug)]
pub struct MemoryHeap {
    pub size: DeviceSize,
}

/// The device memory layout, queried from the backend once at allocator
/// construction.
#[derive(Clone, Debug)]
pub struct MemoryProperties {
    pub memory_types: Vec<MemoryType>,
    pub memory_heaps: Vec<MemoryHeap>,
    /// The page-like granularity below which resources of incompatible
    /// kinds must not share memory. Must be a power of two.
    pub buffer_image_granularity: DeviceSize,
    /// Alignment that host-visible, non-coherent memory ranges must be
    /// flushed and invalidated at. Must be a power of two.
    pub non_coherent_atom_size: DeviceSize,
    /// Whether device-local and host memory are the same physical memory.
    /// Affects memory type selection for some usage patterns.
    pub integrated_gpu: bool,
}

/// Current memory usage and advised limit of one heap, as reported by a
/// backend that supports budget queries.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapBudget {
    pub usage: DeviceSize,
    pub budget: DeviceSize,
}

/// Error that can be returned by a [`MemoryBackend`] implementation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackendError {
    /// The device could not allocate a block of the requested size.
    OutOfDeviceMemory,

    /// Mapping a block for host access failed.
    MapFailed,
}

impl Error for BackendError {}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfDeviceMemory => "the backend is out of device memory",
            Self::MapFailed => "the backend failed to map a block",
        };
        f.write_str(msg)
    }
}

impl From<BackendError> for AllocationError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::OutOfDeviceMemory => AllocationError::OutOfDeviceMemory,
            BackendError::MapFailed => AllocationError::MapFailed,
        }
    }
}

/// Provider of coarse-grained device memory blocks.
///
/// Implemented by the code that owns the actual device; the allocator only
/// ever calls these methods, never anything device-specific directly.
///
/// # Safety
///
/// - A [`BlockHandle`] returned by `allocate_block` must stay valid until it
///   is passed to `free_block`, and must refer to at least the requested
///   number of bytes.
/// - The pointer returned by `map_block` must be valid for reads and writes
///   of the whole block until the matching `unmap_block` call.
/// - `memory_properties` must return the same layout for the lifetime of
///   the backend, with at least one memory type and one heap, and every
///   `heap_index` in bounds.
pub unsafe trait MemoryBackend: Send + Sync {
    /// Returns the device's memory layout.
    fn memory_properties(&self) -> &MemoryProperties;

    /// Allocates one block of `size` bytes from the given memory type.
    fn allocate_block(
        &self,
        memory_type_index: u32,
        size: DeviceSize,
    ) -> Result<BlockHandle, BackendError>;

    /// Releases a block. The allocator guarantees the block is unmapped and
    /// that no allocation refers to it anymore.
    fn free_block(&self, block: BlockHandle);

    /// Maps a whole block for host access.
    ///
    /// Never called twice for the same block without an `unmap_block` in
    /// between. Backends return [`BackendError::MapFailed`] for memory the
    /// host cannot map.
    fn map_block(&self, block: BlockHandle) -> Result<NonNull<u8>, BackendError>;

    /// Unmaps a previously mapped block.
    fn unmap_block(&self, block: BlockHandle);

    /// Binds a resource to block memory at the given offset.
    fn bind_resource(
        &self,
        resource: ResourceHandle,
        block: BlockHandle,
        offset: DeviceSize,
    ) -> Result<(), BackendError>;

    /// Returns the current usage and advised budget of every heap, if the
    /// backend can report them.
    ///
    /// Backends without budget support return `None` and the allocator
    /// falls back to a fixed fraction of each heap's size. The capability
    /// itself must be constant: it is probed once at allocator
    /// construction.
    fn query_budget(&self) -> Option<Vec<HeapBudget>> {
        None
    }

    /// Flushes a mapped range so device reads observe host writes. The
    /// range is already aligned to the non-coherent atom size.
    fn flush_mapped_range(
        &self,
        _block: BlockHandle,
        _offset: DeviceSize,
        _size: DeviceSize,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    /// Invalidates a mapped range so host reads observe device writes. The
    /// range is already aligned to the non-coherent atom size.
    fn invalidate_mapped_range(
        &self,
        _block: BlockHandle,
        _offset: DeviceSize,
        _size: DeviceSize,
    ) -> Result<(), BackendError> {
        Ok(())
    }
}
