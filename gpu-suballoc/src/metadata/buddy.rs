//! The buddy engine.
//!
//! The usable part of the block forms a binary tree of power-of-two nodes.
//! A request is rounded up to the next power of two and served by splitting
//! the smallest sufficient free node in half repeatedly; the two halves of
//! a split are *buddies*. Freeing walks back up, re-merging every node
//! whose buddy is free again. Both directions are O(log block size), and
//! external fragmentation stays low at the price of internal fragmentation
//! of up to half the node.
//!
//! Blocks need not be powers of two themselves; placement only uses
//! `usable_size`, the largest power of two that fits, and the tail past it
//! is carried as permanently unused free space.
//!
//! Eviction requests and upper-address placement are not supported.

use super::{AllocationContext, AllocationRequest, RequestType, SuballocationKind};
use crate::{align_up, allocation::AllocationState, is_aligned, DeviceSize};
use foldhash::HashMap;
use smallvec::{smallvec, SmallVec};
use std::sync::Arc;

/// Size of an order-0 node. Requests smaller than this are rounded up.
const MIN_NODE_SIZE: DeviceSize = 32;

/// Upper bound on the number of orders, enough for a 16GiB block with
/// 32B leaves.
const MAX_ORDERS: usize = 30;

/// Largest power of two less than or equal to `val`.
fn prev_power_of_two(val: DeviceSize) -> DeviceSize {
    debug_assert!(val > 0);

    const MAX_POWER_OF_TWO: DeviceSize = 1 << (DeviceSize::BITS - 1);

    MAX_POWER_OF_TWO >> val.leading_zeros()
}

#[derive(Debug)]
pub(crate) struct BuddyMetadata {
    size: DeviceSize,
    /// The largest power of two not exceeding `size`. Nodes tile
    /// `[0, usable_size)`; the rest of the block is dead weight.
    usable_size: DeviceSize,
    /// Order of the root node. Order 0 nodes are `MIN_NODE_SIZE` bytes,
    /// order n nodes twice that per step.
    max_order: usize,
    /// Free bytes in nodes, excluding the unusable tail.
    node_free_size: DeviceSize,
    // Every order has its own free list so no tree needs traversing. Each
    // list is sorted by offset; taking the first fit per order minimizes
    // external fragmentation.
    free_list: SmallVec<[Vec<DeviceSize>; MAX_ORDERS]>,
    /// Order of every live allocation's node, by offset.
    allocations: HashMap<DeviceSize, usize>,
}

impl BuddyMetadata {
    pub fn new(size: DeviceSize) -> Self {
        debug_assert!(size >= MIN_NODE_SIZE);

        let usable_size = prev_power_of_two(size);
        let max_order = (usable_size / MIN_NODE_SIZE).trailing_zeros() as usize;
        debug_assert!(max_order < MAX_ORDERS);

        let mut free_list: SmallVec<[Vec<DeviceSize>; MAX_ORDERS]> =
            smallvec![Vec::new(); max_order + 1];
        // The root node covers the whole usable range.
        free_list[max_order].push(0);

        BuddyMetadata {
            size,
            usable_size,
            max_order,
            node_free_size: usable_size,
            free_list,
            allocations: HashMap::default(),
        }
    }

    pub fn size(&self) -> DeviceSize {
        self.size
    }

    /// Free bytes, the unusable tail included. The tail also shows up in
    /// the stats as an unused range, so the usual `used + unused = size`
    /// accounting holds.
    pub fn sum_free_size(&self) -> DeviceSize {
        self.node_free_size + (self.size - self.usable_size)
    }

    pub fn allocation_count(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_free_size == self.usable_size
    }

    pub fn unused_range_size_max(&self) -> DeviceSize {
        let largest_node = self
            .free_list
            .iter()
            .enumerate()
            .rev()
            .find(|(_, free_list)| !free_list.is_empty())
            .map_or(0, |(order, _)| MIN_NODE_SIZE << order);

        largest_node.max(self.size - self.usable_size)
    }

    pub fn create_allocation_request(&self, ctx: &AllocationContext) -> Option<AllocationRequest> {
        debug_assert!(ctx.size > 0);
        debug_assert!(ctx.alignment.is_power_of_two());

        if ctx.upper_address {
            return None;
        }

        let mut size = ctx.size;
        let mut alignment = ctx.alignment;

        // Nodes of conflicting kinds can never share a granularity page if
        // every opaque resource is padded out to whole pages up front.
        if ctx.granularity > 1
            && matches!(
                ctx.kind,
                SuballocationKind::Unknown
                    | SuballocationKind::ImageUnknown
                    | SuballocationKind::ImageOptimal,
            )
        {
            size = align_up(size, ctx.granularity);
            alignment = alignment.max(ctx.granularity);
        }

        let size = size.max(MIN_NODE_SIZE).next_power_of_two();
        if size > self.usable_size {
            return None;
        }

        let min_order = (size / MIN_NODE_SIZE).trailing_zeros() as usize;

        // Start at the smallest sufficient order and go up.
        for (order, free_list) in self.free_list.iter().enumerate().skip(min_order) {
            for &offset in free_list {
                // Node offsets are multiples of the node size, so any
                // alignment up to it holds automatically; this check only
                // bites for alignments above the node size.
                if is_aligned(offset, alignment) {
                    return Some(AllocationRequest {
                        offset,
                        sum_free_size: MIN_NODE_SIZE << order,
                        sum_item_size: 0,
                        items_to_make_lost: 0,
                        item: min_order,
                        request_type: RequestType::Normal,
                    });
                }
            }
        }

        None
    }

    pub fn alloc(
        &mut self,
        request: &AllocationRequest,
        _kind: SuballocationKind,
        _size: DeviceSize,
        _owner: &Arc<AllocationState>,
    ) -> usize {
        debug_assert!(request.request_type == RequestType::Normal);

        let min_order = request.item;

        // Re-locate the node; the list lock is held from search to commit,
        // so it is still free.
        let mut found = None;
        for order in min_order..=self.max_order {
            if let Ok(index) = self.free_list[order].binary_search(&request.offset) {
                found = Some((order, index));
                break;
            }
        }
        let (order, index) = found.unwrap();

        self.free_list[order].remove(index);

        // Split down from the found order; the lowest order needs no
        // splitting.
        for order in (min_order..order).rev() {
            let node_size = MIN_NODE_SIZE << order;
            let right_child = request.offset + node_size;

            let (Ok(index) | Err(index)) = self.free_list[order].binary_search(&right_child);
            self.free_list[order].insert(index, right_child);
        }

        self.node_free_size -= MIN_NODE_SIZE << min_order;
        self.allocations.insert(request.offset, min_order);

        // The node's order doubles as the placement token.
        min_order
    }

    pub fn free(&mut self, offset: DeviceSize, token: usize) {
        let min_order = token;

        let removed = self.allocations.remove(&offset);
        debug_assert!(removed == Some(min_order));
        debug_assert!(!self.free_list[min_order].contains(&offset));

        // Coalesce with the buddy while it is free, going up in order. The
        // root has no buddy in range, so the loop always terminates with an
        // insert.
        let mut offset = offset;
        for order in min_order..=self.max_order {
            let node_size = MIN_NODE_SIZE << order;
            let buddy_offset = offset ^ node_size;

            match self.free_list[order].binary_search(&buddy_offset) {
                Ok(index) => {
                    self.free_list[order].remove(index);
                    offset = offset.min(buddy_offset);
                }
                Err(_) => {
                    let (Ok(index) | Err(index)) = self.free_list[order].binary_search(&offset);
                    self.free_list[order].insert(index, offset);

                    self.node_free_size += MIN_NODE_SIZE << min_order;
                    break;
                }
            }
        }
    }

    pub fn validate(&self) -> bool {
        let mut segments: Vec<(DeviceSize, DeviceSize, bool)> = Vec::new();

        for (order, free_list) in self.free_list.iter().enumerate() {
            let node_size = MIN_NODE_SIZE << order;
            let mut prev = None;

            for &offset in free_list {
                // Sorted, unique, node-aligned, in range.
                validate!(prev.map_or(true, |prev| prev < offset));
                validate!(is_aligned(offset, node_size));
                validate!(offset + node_size <= self.usable_size);
                // Two free buddies should have coalesced.
                if order < self.max_order {
                    validate!(free_list.binary_search(&(offset ^ node_size)).is_err());
                }

                prev = Some(offset);
                segments.push((offset, node_size, true));
            }
        }

        for (&offset, &order) in &self.allocations {
            segments.push((offset, MIN_NODE_SIZE << order, false));
        }

        // Free and allocated nodes together tile the usable range exactly.
        segments.sort_unstable_by_key(|&(offset, ..)| offset);

        let mut expected_offset = 0;
        let mut free_sum = 0;
        for &(offset, node_size, free) in &segments {
            validate!(offset == expected_offset);
            expected_offset = offset + node_size;
            if free {
                free_sum += node_size;
            }
        }
        validate!(expected_offset == self.usable_size);
        validate!(free_sum == self.node_free_size);

        true
    }

    pub fn add_stat_info(&self, info: &mut crate::stats::StatInfo) {
        info.block_count += 1;

        // Allocations are accounted at node granularity; internal
        // fragmentation is invisible from the outside.
        for &order in self.allocations.values() {
            info.add_allocation(MIN_NODE_SIZE << order);
        }

        for (order, free_list) in self.free_list.iter().enumerate() {
            for _ in free_list {
                info.add_unused_range(MIN_NODE_SIZE << order);
            }
        }

        if self.usable_size < self.size {
            info.add_unused_range(self.size - self.usable_size);
        }
    }
}
