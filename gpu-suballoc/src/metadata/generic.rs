//! The general free-list engine.
//!
//! Suballocations are kept in an ordered, doubly linked list backed by a
//! slot pool, so records can be split and merged without shifting their
//! neighbors and without one host allocation per record. Free runs of a
//! worthwhile size are additionally indexed in a vector sorted ascending by
//! size, which gives best-fit placement a binary search instead of a walk.

use super::{
    are_blocks_on_same_page, AllocationContext, AllocationRequest, AllocationStrategy, RequestType,
    Suballocation, SuballocationKind, MIN_FREE_SIZE_TO_REGISTER,
};
use crate::{align_up, allocation::AllocationState, DeviceSize};
use std::{num::NonZeroUsize, sync::Arc};

/// Identifies one slot in a [`SuballocationList`]'s pool. Stable for the
/// lifetime of the record it was minted for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SlotId(NonZeroUsize);

impl SlotId {
    fn new(index: usize) -> Self {
        SlotId(NonZeroUsize::new(index + 1).unwrap())
    }

    fn index(self) -> usize {
        self.0.get() - 1
    }

    /// The raw value handed to allocations as their placement token.
    fn token(self) -> usize {
        self.0.get()
    }

    fn from_token(token: usize) -> Self {
        SlotId(NonZeroUsize::new(token).unwrap())
    }
}

#[derive(Debug)]
struct Node {
    prev: Option<SlotId>,
    next: Option<SlotId>,
    suballoc: Suballocation,
}

/// Ordered suballocation records in a slot pool.
///
/// Allocating a slot is a free-list pop and freeing is a push, so churn
/// from splitting and merging runs does not hit the global allocator. IDs
/// are relative to the pool, which means the pool can grow by moving.
#[derive(Debug)]
struct SuballocationList {
    nodes: Vec<Node>,
    // LIFO, so freshly freed slots are reused first.
    free_slots: Vec<SlotId>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
}

impl SuballocationList {
    fn new() -> Self {
        SuballocationList {
            nodes: Vec::new(),
            free_slots: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn head(&self) -> Option<SlotId> {
        self.head
    }

    fn get(&self, id: SlotId) -> &Node {
        &self.nodes[id.index()]
    }

    fn get_mut(&mut self, id: SlotId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    fn next(&self, id: SlotId) -> Option<SlotId> {
        self.get(id).next
    }

    fn prev(&self, id: SlotId) -> Option<SlotId> {
        self.get(id).prev
    }

    fn allocate_slot(&mut self, suballoc: Suballocation) -> SlotId {
        let node = Node {
            prev: None,
            next: None,
            suballoc,
        };

        match self.free_slots.pop() {
            Some(id) => {
                self.nodes[id.index()] = node;
                id
            }
            None => {
                self.nodes.push(node);
                SlotId::new(self.nodes.len() - 1)
            }
        }
    }

    fn push_back(&mut self, suballoc: Suballocation) -> SlotId {
        let id = self.allocate_slot(suballoc);
        self.get_mut(id).prev = self.tail;

        match self.tail {
            Some(tail) => self.get_mut(tail).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;

        id
    }

    fn insert_before(&mut self, anchor: SlotId, suballoc: Suballocation) -> SlotId {
        let id = self.allocate_slot(suballoc);
        let prev = self.get(anchor).prev;

        self.get_mut(id).prev = prev;
        self.get_mut(id).next = Some(anchor);
        self.get_mut(anchor).prev = Some(id);

        match prev {
            Some(prev) => self.get_mut(prev).next = Some(id),
            None => self.head = Some(id),
        }
        self.len += 1;

        id
    }

    fn insert_after(&mut self, anchor: SlotId, suballoc: Suballocation) -> SlotId {
        let id = self.allocate_slot(suballoc);
        let next = self.get(anchor).next;

        self.get_mut(id).prev = Some(anchor);
        self.get_mut(id).next = next;
        self.get_mut(anchor).next = Some(id);

        match next {
            Some(next) => self.get_mut(next).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;

        id
    }

    fn remove(&mut self, id: SlotId) {
        let Node { prev, next, .. } = *self.get(id);

        match prev {
            Some(prev) => self.get_mut(prev).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.get_mut(next).prev = prev,
            None => self.tail = prev,
        }

        debug_assert!(!self.free_slots.contains(&id));
        self.free_slots.push(id);
        self.len -= 1;
    }
}

/// Free-list block metadata. The default engine; the only one that can
/// produce eviction requests.
#[derive(Debug)]
pub(crate) struct GenericMetadata {
    size: DeviceSize,
    list: SuballocationList,
    /// Free runs of at least [`MIN_FREE_SIZE_TO_REGISTER`] bytes, sorted
    /// ascending by size.
    free_by_size: Vec<SlotId>,
    free_count: usize,
    sum_free_size: DeviceSize,
}

impl GenericMetadata {
    pub fn new(size: DeviceSize) -> Self {
        debug_assert!(size > 0);

        let mut metadata = GenericMetadata {
            size,
            list: SuballocationList::new(),
            free_by_size: Vec::new(),
            free_count: 1,
            sum_free_size: size,
        };

        let whole = metadata.list.push_back(Suballocation::free(0, size));
        metadata.register_free(whole);

        metadata
    }

    pub fn size(&self) -> DeviceSize {
        self.size
    }

    pub fn allocation_count(&self) -> usize {
        self.list.len() - self.free_count
    }

    pub fn sum_free_size(&self) -> DeviceSize {
        self.sum_free_size
    }

    pub fn is_empty(&self) -> bool {
        self.list.len() == 1 && self.free_count == 1
    }

    pub fn unused_range_size_max(&self) -> DeviceSize {
        match self.free_by_size.last() {
            Some(&id) => self.list.get(id).suballoc.size,
            None => 0,
        }
    }

    pub fn create_allocation_request(&self, ctx: &AllocationContext) -> Option<AllocationRequest> {
        debug_assert!(ctx.size > 0);
        debug_assert!(ctx.alignment.is_power_of_two());

        // Growing down from the block end is a linear-engine feature.
        if ctx.upper_address {
            return None;
        }

        if !ctx.can_make_other_lost && self.sum_free_size < ctx.size {
            return None;
        }

        // First pass: free runs only.
        let free_count = self.free_by_size.len();
        let found = match ctx.strategy {
            AllocationStrategy::BestFit => {
                // Smallest sufficient run first.
                let list = &self.list;
                let (Ok(start) | Err(start)) = self
                    .free_by_size
                    .binary_search_by_key(&ctx.size, |&id| list.get(id).suballoc.size);

                self.free_by_size[..free_count]
                    .iter()
                    .skip(start)
                    .find_map(|&id| self.check_allocation(ctx, id).map(|offset| (id, offset)))
            }
            AllocationStrategy::WorstFit | AllocationStrategy::FirstFit => {
                // Largest run first.
                self.free_by_size[..free_count]
                    .iter()
                    .rev()
                    .find_map(|&id| self.check_allocation(ctx, id).map(|offset| (id, offset)))
            }
            AllocationStrategy::MinOffset => {
                let mut found = None;
                let mut cur = self.list.head();
                while let Some(id) = cur {
                    if self.list.get(id).suballoc.is_free() {
                        if let Some(offset) = self.check_allocation(ctx, id) {
                            found = Some((id, offset));
                            break;
                        }
                    }
                    cur = self.list.next(id);
                }
                found
            }
        };

        if let Some((id, offset)) = found {
            return Some(AllocationRequest {
                offset,
                sum_free_size: self.list.get(id).suballoc.size,
                sum_item_size: 0,
                items_to_make_lost: 0,
                item: id.token(),
                request_type: RequestType::Normal,
            });
        }

        // Second pass: every list position, counting evictable live
        // allocations the placement would have to retire. Lowest cost wins.
        if ctx.can_make_other_lost {
            let mut best: Option<AllocationRequest> = None;
            let mut cur = self.list.head();
            while let Some(id) = cur {
                if let Some(request) = self.check_allocation_with_lost(ctx, id) {
                    if ctx.strategy == AllocationStrategy::FirstFit {
                        return Some(request);
                    }
                    match &best {
                        Some(b) if b.cost() <= request.cost() => {}
                        _ => best = Some(request),
                    }
                }
                cur = self.list.next(id);
            }
            return best;
        }

        None
    }

    /// Whether a request can be placed in the free run `id` without
    /// touching anything else. Returns the placement offset.
    fn check_allocation(&self, ctx: &AllocationContext, id: SlotId) -> Option<DeviceSize> {
        let suballoc = &self.list.get(id).suballoc;
        debug_assert!(suballoc.is_free());

        let mut offset = align_up(suballoc.offset, ctx.alignment);

        // A conflicting neighbor before us on the same granularity page
        // forces the start up to the next page.
        if ctx.granularity > 1 {
            let mut conflict = false;
            let mut prev = self.list.prev(id);
            while let Some(prev_id) = prev {
                let prev_suballoc = &self.list.get(prev_id).suballoc;
                if !are_blocks_on_same_page(
                    prev_suballoc.offset,
                    prev_suballoc.size,
                    offset,
                    ctx.granularity,
                ) {
                    break;
                }
                if prev_suballoc.kind.conflicts_on_page(ctx.kind) {
                    conflict = true;
                    break;
                }
                prev = self.list.prev(prev_id);
            }
            if conflict {
                offset = align_up(offset, ctx.granularity);
            }
        }

        let padding_begin = offset - suballoc.offset;
        if padding_begin + ctx.size > suballoc.size {
            return None;
        }

        // Conflicting neighbors after us on our last page kill this
        // position; without eviction there is no way to move them.
        if ctx.granularity > 1 {
            let mut next = self.list.next(id);
            while let Some(next_id) = next {
                let next_suballoc = &self.list.get(next_id).suballoc;
                if !are_blocks_on_same_page(offset, ctx.size, next_suballoc.offset, ctx.granularity)
                {
                    break;
                }
                if next_suballoc.kind.conflicts_on_page(ctx.kind) {
                    return None;
                }
                next = self.list.next(next_id);
            }
        }

        Some(offset)
    }

    /// Whether a request can start at position `id` if evictable live
    /// allocations in its way are retired. Builds the full request
    /// including eviction counts.
    fn check_allocation_with_lost(
        &self,
        ctx: &AllocationContext,
        id: SlotId,
    ) -> Option<AllocationRequest> {
        let suballoc = &self.list.get(id).suballoc;

        // Even retiring everything to the end would not make room.
        if self.size - suballoc.offset < ctx.size {
            return None;
        }

        let mut items_to_make_lost = 0;
        let mut sum_item_size = 0;
        let mut sum_free_size = 0;

        let evictable = |suballoc: &Suballocation| {
            let owner = suballoc.owner.as_ref().unwrap();
            owner.can_become_lost()
                && !owner.is_lost()
                && (owner.last_use_frame() as u64 + ctx.frame_in_use_count as u64)
                    < ctx.current_frame as u64
        };

        if suballoc.is_free() {
            sum_free_size = suballoc.size;
        } else {
            if !evictable(suballoc) {
                return None;
            }
            items_to_make_lost += 1;
            sum_item_size += suballoc.size;
        }

        let mut offset = align_up(suballoc.offset, ctx.alignment);

        if ctx.granularity > 1 {
            let mut conflict = false;
            let mut prev = self.list.prev(id);
            while let Some(prev_id) = prev {
                let prev_suballoc = &self.list.get(prev_id).suballoc;
                if !are_blocks_on_same_page(
                    prev_suballoc.offset,
                    prev_suballoc.size,
                    offset,
                    ctx.granularity,
                ) {
                    break;
                }
                if prev_suballoc.kind.conflicts_on_page(ctx.kind) {
                    conflict = true;
                    break;
                }
                prev = self.list.prev(prev_id);
            }
            if conflict {
                offset = align_up(offset, ctx.granularity);
            }
        }

        // Alignment pushed the start past this entire run.
        if offset >= suballoc.offset + suballoc.size {
            return None;
        }

        let padding_begin = offset - suballoc.offset;
        let required_size = padding_begin + ctx.size;

        // Consume following runs until the request is covered.
        let mut last = id;
        if required_size > suballoc.size {
            let mut remaining = required_size - suballoc.size;
            loop {
                last = self.list.next(last)?;
                let next_suballoc = &self.list.get(last).suballoc;
                if next_suballoc.is_free() {
                    sum_free_size += next_suballoc.size;
                } else {
                    if !evictable(next_suballoc) {
                        return None;
                    }
                    items_to_make_lost += 1;
                    sum_item_size += next_suballoc.size;
                }
                if next_suballoc.size >= remaining {
                    break;
                }
                remaining -= next_suballoc.size;
            }
        }

        // Conflicting neighbors on our last page must be evictable too.
        // They are retired but their space is not consumed by us.
        if ctx.granularity > 1 {
            let mut next = self.list.next(last);
            while let Some(next_id) = next {
                let next_suballoc = &self.list.get(next_id).suballoc;
                if !are_blocks_on_same_page(offset, ctx.size, next_suballoc.offset, ctx.granularity)
                {
                    break;
                }
                if next_suballoc.kind.conflicts_on_page(ctx.kind) {
                    if next_suballoc.is_free() || !evictable(next_suballoc) {
                        return None;
                    }
                    items_to_make_lost += 1;
                }
                next = self.list.next(next_id);
            }
        }

        Some(AllocationRequest {
            offset,
            sum_free_size,
            sum_item_size,
            items_to_make_lost,
            item: id.token(),
            request_type: RequestType::Normal,
        })
    }

    /// Retires the allocations counted in `request`, freeing and merging
    /// their runs. Advances `request.item` to the resulting free run.
    ///
    /// Returns whether every counted allocation was retired, and the bytes
    /// that were (already-retired bytes stay retired on failure).
    pub fn make_requested_allocations_lost(
        &mut self,
        current_frame: u32,
        frame_in_use_count: u32,
        request: &mut AllocationRequest,
    ) -> (bool, DeviceSize) {
        debug_assert!(request.request_type == RequestType::Normal);

        let mut bytes_retired = 0;
        let mut id = SlotId::from_token(request.item);

        while request.items_to_make_lost > 0 {
            if self.list.get(id).suballoc.is_free() {
                // Frees are never adjacent, so one step lands on the next
                // occupied run.
                match self.list.next(id) {
                    Some(next) => id = next,
                    None => return (false, bytes_retired),
                }
            }

            let suballoc = &self.list.get(id).suballoc;
            let size = suballoc.size;
            let owner = suballoc.owner.clone().unwrap();
            debug_assert!(owner.can_become_lost());

            if !owner.try_make_lost(current_frame, frame_in_use_count) {
                return (false, bytes_retired);
            }

            bytes_retired += size;
            id = self.free_suballocation(id);
            request.item = id.token();
            request.items_to_make_lost -= 1;
        }

        debug_assert!(self.list.get(id).suballoc.is_free());
        debug_assert!(self.list.get(id).suballoc.size >= request.sum_free_size);

        (true, bytes_retired)
    }

    /// Commits a found placement: splits the target free run into leading
    /// pad, the new occupied run, and trailing pad.
    pub fn alloc(
        &mut self,
        request: &AllocationRequest,
        kind: SuballocationKind,
        size: DeviceSize,
        owner: &Arc<AllocationState>,
    ) -> usize {
        debug_assert!(request.request_type == RequestType::Normal);
        debug_assert!(kind != SuballocationKind::Free);

        let id = SlotId::from_token(request.item);
        let suballoc = &self.list.get(id).suballoc;
        debug_assert!(suballoc.is_free());
        debug_assert!(request.offset >= suballoc.offset);

        let padding_begin = request.offset - suballoc.offset;
        debug_assert!(suballoc.size >= padding_begin + size);
        let padding_end = suballoc.size - padding_begin - size;

        self.unregister_free(id);

        let suballoc = &mut self.list.get_mut(id).suballoc;
        suballoc.offset = request.offset;
        suballoc.size = size;
        suballoc.kind = kind;
        suballoc.owner = Some(owner.clone());

        if padding_end > 0 {
            let pad = self
                .list
                .insert_after(id, Suballocation::free(request.offset + size, padding_end));
            self.register_free(pad);
        }
        if padding_begin > 0 {
            let pad = self.list.insert_before(
                id,
                Suballocation::free(request.offset - padding_begin, padding_begin),
            );
            self.register_free(pad);
        }

        match (padding_begin > 0, padding_end > 0) {
            (true, true) => self.free_count += 1,
            (false, false) => self.free_count -= 1,
            _ => {}
        }
        self.sum_free_size -= size;

        id.token()
    }

    /// Returns the run committed with `token` to the free space.
    pub fn free(&mut self, offset: DeviceSize, token: usize) {
        let id = SlotId::from_token(token);
        debug_assert!(!self.list.get(id).suballoc.is_free());
        debug_assert!(self.list.get(id).suballoc.offset == offset);

        self.free_suballocation(id);
    }

    /// Retires every evictable allocation outside the frame window.
    pub fn make_allocations_lost(
        &mut self,
        current_frame: u32,
        frame_in_use_count: u32,
    ) -> (usize, DeviceSize) {
        let mut count = 0;
        let mut bytes = 0;

        let mut cur = self.list.head();
        while let Some(id) = cur {
            let suballoc = &self.list.get(id).suballoc;

            let evict = match &suballoc.owner {
                Some(owner) => {
                    owner.can_become_lost() && owner.try_make_lost(current_frame, frame_in_use_count)
                }
                None => false,
            };

            if evict {
                count += 1;
                bytes += suballoc.size;
                let merged = self.free_suballocation(id);
                cur = self.list.next(merged);
            } else {
                cur = self.list.next(id);
            }
        }

        (count, bytes)
    }

    /// Marks `id` free and merges it with free neighbors. Returns the
    /// resulting run.
    fn free_suballocation(&mut self, id: SlotId) -> SlotId {
        let suballoc = &mut self.list.get_mut(id).suballoc;
        suballoc.kind = SuballocationKind::Free;
        suballoc.owner = None;

        self.free_count += 1;
        self.sum_free_size += suballoc.size;

        // Merge the following run first so the preceding merge sees the
        // combined size.
        if let Some(next) = self.list.next(id) {
            if self.list.get(next).suballoc.is_free() {
                self.unregister_free(next);
                self.merge_free_with_next(id);
            }
        }

        if let Some(prev) = self.list.prev(id) {
            if self.list.get(prev).suballoc.is_free() {
                self.unregister_free(prev);
                self.merge_free_with_next(prev);
                self.register_free(prev);
                return prev;
            }
        }

        self.register_free(id);
        id
    }

    /// Folds `id`'s following free run into it.
    fn merge_free_with_next(&mut self, id: SlotId) {
        let next = self.list.next(id).unwrap();
        debug_assert!(self.list.get(id).suballoc.is_free());
        debug_assert!(self.list.get(next).suballoc.is_free());

        let next_size = self.list.get(next).suballoc.size;
        self.list.get_mut(id).suballoc.size += next_size;
        self.free_count -= 1;
        self.list.remove(next);
    }

    fn register_free(&mut self, id: SlotId) {
        let suballoc = &self.list.get(id).suballoc;
        debug_assert!(suballoc.is_free());
        debug_assert!(suballoc.size > 0);
        let size = suballoc.size;

        if size >= MIN_FREE_SIZE_TO_REGISTER {
            let list = &self.list;
            let (Ok(index) | Err(index)) = self
                .free_by_size
                .binary_search_by_key(&size, |&entry| list.get(entry).suballoc.size);
            self.free_by_size.insert(index, id);
        }
    }

    fn unregister_free(&mut self, id: SlotId) {
        let size = self.list.get(id).suballoc.size;

        if size >= MIN_FREE_SIZE_TO_REGISTER {
            let list = &self.list;
            let (Ok(mut index) | Err(mut index)) = self
                .free_by_size
                .binary_search_by_key(&size, |&entry| list.get(entry).suballoc.size);

            // The search lands on any equal-size entry; scan to ours.
            while index > 0 && self.list.get(self.free_by_size[index - 1]).suballoc.size == size {
                index -= 1;
            }
            loop {
                if self.free_by_size[index] == id {
                    self.free_by_size.remove(index);
                    return;
                }
                debug_assert!(self.list.get(self.free_by_size[index]).suballoc.size == size);
                index += 1;
            }
        }
    }

    /// Full consistency sweep against the cached counters and the index.
    pub fn validate(&self) -> bool {
        validate!(self.list.len() > 0);

        let mut calculated_offset = 0;
        let mut calculated_free_count = 0;
        let mut calculated_sum_free = 0;
        let mut registerable_free_count = 0;
        let mut prev_free = false;

        let mut cur = self.list.head();
        while let Some(id) = cur {
            let suballoc = &self.list.get(id).suballoc;

            validate!(suballoc.offset == calculated_offset);
            validate!(suballoc.size > 0);

            if suballoc.is_free() {
                // Adjacent free runs must have been merged.
                validate!(!prev_free);
                validate!(suballoc.owner.is_none());

                calculated_free_count += 1;
                calculated_sum_free += suballoc.size;
                if suballoc.size >= MIN_FREE_SIZE_TO_REGISTER {
                    registerable_free_count += 1;
                }
                prev_free = true;
            } else {
                validate!(suballoc.owner.is_some());
                prev_free = false;
            }

            calculated_offset += suballoc.size;
            cur = self.list.next(id);
        }

        // The records partition [0, size) exactly.
        validate!(calculated_offset == self.size);
        validate!(calculated_free_count == self.free_count);
        validate!(calculated_sum_free == self.sum_free_size);
        validate!(registerable_free_count == self.free_by_size.len());

        let mut prev_size = 0;
        for &id in &self.free_by_size {
            let suballoc = &self.list.get(id).suballoc;
            validate!(suballoc.is_free());
            validate!(suballoc.size >= MIN_FREE_SIZE_TO_REGISTER);
            // Sorted ascending.
            validate!(suballoc.size >= prev_size);
            prev_size = suballoc.size;
        }

        true
    }

    pub fn add_stat_info(&self, info: &mut crate::stats::StatInfo) {
        info.block_count += 1;

        let mut cur = self.list.head();
        while let Some(id) = cur {
            let suballoc = &self.list.get(id).suballoc;
            if suballoc.is_free() {
                info.add_unused_range(suballoc.size);
            } else {
                info.add_allocation(suballoc.size);
            }
            cur = self.list.next(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: DeviceSize = 1 << 10;
    const MIB: DeviceSize = 1 << 20;

    fn ctx(size: DeviceSize, alignment: DeviceSize) -> AllocationContext {
        AllocationContext {
            current_frame: 0,
            frame_in_use_count: 0,
            granularity: 1,
            size,
            alignment,
            kind: SuballocationKind::Buffer,
            upper_address: false,
            can_make_other_lost: false,
            strategy: AllocationStrategy::BestFit,
        }
    }

    fn pinned_owner() -> Arc<AllocationState> {
        Arc::new(AllocationState::new(0, false))
    }

    fn evictable_owner(last_use: u32) -> Arc<AllocationState> {
        Arc::new(AllocationState::new(last_use, true))
    }

    fn alloc(
        metadata: &mut GenericMetadata,
        ctx: &AllocationContext,
        owner: &Arc<AllocationState>,
    ) -> (DeviceSize, usize) {
        let request = metadata.create_allocation_request(ctx).unwrap();
        assert!(request.items_to_make_lost == 0);
        let token = metadata.alloc(&request, ctx.kind, ctx.size, owner);
        assert!(metadata.validate());

        (request.offset, token)
    }

    #[test]
    fn first_allocation_at_zero() {
        let mut metadata = GenericMetadata::new(MIB);
        let owner = pinned_owner();

        let (offset, _) = alloc(&mut metadata, &ctx(64 * KIB, 256), &owner);

        assert!(offset == 0);
        assert!(metadata.sum_free_size() == MIB - 64 * KIB);
        assert!(metadata.allocation_count() == 1);
        // The remainder is a single run.
        assert!(metadata.unused_range_size_max() == MIB - 64 * KIB);
    }

    #[test]
    fn free_does_not_merge_into_neighbors_still_allocated() {
        let mut metadata = GenericMetadata::new(MIB);
        let owner = pinned_owner();

        let (offset_a, token_a) = alloc(&mut metadata, &ctx(100 * KIB, 1), &owner);
        let (offset_b, _) = alloc(&mut metadata, &ctx(50 * KIB, 1), &owner);
        assert!(offset_b == 100 * KIB);

        metadata.free(offset_a, token_a);
        assert!(metadata.validate());

        // A's run stays separate from the tail; B sits between them.
        assert!(metadata.sum_free_size() == MIB - 50 * KIB);
        assert!(metadata.unused_range_size_max() == MIB - 150 * KIB);
        assert!(metadata.free_by_size.len() == 2);
    }

    #[test]
    fn alloc_free_round_trip_restores_layout() {
        let mut metadata = GenericMetadata::new(MIB);
        let owner = pinned_owner();

        let (_, token_a) = alloc(&mut metadata, &ctx(100 * KIB, 1), &owner);
        let (offset_b, token_b) = alloc(&mut metadata, &ctx(50 * KIB, 64), &owner);
        let (_, token_c) = alloc(&mut metadata, &ctx(10 * KIB, 1), &owner);

        metadata.free(offset_b, token_b);
        assert!(metadata.validate());
        metadata.free(0, token_a);
        assert!(metadata.validate());
        metadata.free(150 * KIB, token_c);
        assert!(metadata.validate());

        assert!(metadata.is_empty());
        assert!(metadata.sum_free_size() == MIB);
        assert!(metadata.unused_range_size_max() == MIB);
    }

    #[test]
    fn alignment_is_respected() {
        let mut metadata = GenericMetadata::new(MIB);
        let owner = pinned_owner();

        let (_, _) = alloc(&mut metadata, &ctx(10, 1), &owner);
        let (offset, _) = alloc(&mut metadata, &ctx(100, 256), &owner);

        assert!(offset == 256);
    }

    #[test]
    fn best_fit_picks_smallest_sufficient_run() {
        let mut metadata = GenericMetadata::new(MIB);
        let owner = pinned_owner();

        // Carve [gap 100K][a][gap 30K][b][tail].
        let (ga, ta) = alloc(&mut metadata, &ctx(100 * KIB, 1), &owner);
        let (_, _) = alloc(&mut metadata, &ctx(KIB, 1), &owner);
        let (gb, tb) = alloc(&mut metadata, &ctx(30 * KIB, 1), &owner);
        let (_, _) = alloc(&mut metadata, &ctx(KIB, 1), &owner);
        metadata.free(ga, ta);
        metadata.free(gb, tb);
        assert!(metadata.validate());

        let (offset, _) = alloc(&mut metadata, &ctx(20 * KIB, 1), &owner);

        // The 30K gap wins over the 100K gap and the tail.
        assert!(offset == gb);
    }

    #[test]
    fn worst_fit_picks_largest_run() {
        let mut metadata = GenericMetadata::new(MIB);
        let owner = pinned_owner();

        let (ga, ta) = alloc(&mut metadata, &ctx(100 * KIB, 1), &owner);
        let (_, _) = alloc(&mut metadata, &ctx(KIB, 1), &owner);
        metadata.free(ga, ta);

        let mut worst = ctx(20 * KIB, 1);
        worst.strategy = AllocationStrategy::WorstFit;
        let (offset, _) = alloc(&mut metadata, &worst, &owner);

        // The tail run is the largest.
        assert!(offset == 101 * KIB);
    }

    #[test]
    fn min_offset_packs_toward_start() {
        let mut metadata = GenericMetadata::new(MIB);
        let owner = pinned_owner();

        let (ga, ta) = alloc(&mut metadata, &ctx(100 * KIB, 1), &owner);
        let (_, _) = alloc(&mut metadata, &ctx(KIB, 1), &owner);
        metadata.free(ga, ta);

        let mut min_offset = ctx(20 * KIB, 1);
        min_offset.strategy = AllocationStrategy::MinOffset;
        let (offset, _) = alloc(&mut metadata, &min_offset, &owner);

        assert!(offset == 0);
    }

    #[test]
    fn no_fit_returns_none() {
        let metadata = GenericMetadata::new(MIB);

        assert!(metadata.create_allocation_request(&ctx(2 * MIB, 1)).is_none());
    }

    #[test]
    fn fragmented_space_is_not_summed() {
        let mut metadata = GenericMetadata::new(300 * KIB);
        let owner = pinned_owner();

        // [gap 100K][a 100K][tail 100K]: 200K free total, no 150K run.
        let (ga, ta) = alloc(&mut metadata, &ctx(100 * KIB, 1), &owner);
        let (_, _) = alloc(&mut metadata, &ctx(100 * KIB, 1), &owner);
        metadata.free(ga, ta);

        assert!(metadata.sum_free_size() == 200 * KIB);
        assert!(metadata
            .create_allocation_request(&ctx(150 * KIB, 1))
            .is_none());
    }

    #[test]
    fn granularity_conflict_pushes_to_next_page() {
        let mut metadata = GenericMetadata::new(MIB);
        let owner = pinned_owner();

        let mut buffer = ctx(100, 1);
        buffer.granularity = KIB;
        buffer.kind = SuballocationKind::Buffer;
        let (offset, _) = alloc(&mut metadata, &buffer, &owner);
        assert!(offset == 0);

        let mut image = ctx(100, 1);
        image.granularity = KIB;
        image.kind = SuballocationKind::ImageOptimal;
        let (offset, _) = alloc(&mut metadata, &image, &owner);

        // Conflicting kind on the same page gets pushed to the next one.
        assert!(offset == KIB);

        // A compatible kind packs right behind the first.
        let mut buffer2 = ctx(100, 1);
        buffer2.granularity = KIB;
        buffer2.kind = SuballocationKind::Buffer;
        let (offset, _) = alloc(&mut metadata, &buffer2, &owner);
        assert!(offset == 100);
    }

    #[test]
    fn eviction_request_counts_stale_allocations() {
        let mut metadata = GenericMetadata::new(300);
        let stale = evictable_owner(0);

        let mut full = ctx(300, 1);
        full.can_make_other_lost = false;
        let (_, _) = alloc(&mut metadata, &full, &stale);
        assert!(metadata.sum_free_size() == 0);

        // Without eviction there is no room at all.
        assert!(metadata.create_allocation_request(&ctx(100, 1)).is_none());

        let mut evicting = ctx(100, 1);
        evicting.can_make_other_lost = true;
        evicting.current_frame = 10;
        evicting.frame_in_use_count = 2;
        let mut request = metadata.create_allocation_request(&evicting).unwrap();

        assert!(request.items_to_make_lost == 1);
        assert!(request.sum_item_size == 300);

        let (ok, bytes) = metadata.make_requested_allocations_lost(10, 2, &mut request);
        assert!(ok);
        assert!(bytes == 300);
        assert!(stale.is_lost());
        assert!(metadata.validate());

        let token = metadata.alloc(&request, evicting.kind, evicting.size, &pinned_owner());
        assert!(metadata.validate());
        assert!(metadata.allocation_count() == 1);
        metadata.free(request.offset, token);
        assert!(metadata.is_empty());
    }

    #[test]
    fn eviction_respects_frame_window() {
        let mut metadata = GenericMetadata::new(300);
        let recent = evictable_owner(9);

        let mut full = ctx(300, 1);
        let (_, _) = alloc(&mut metadata, &full, &recent);

        full.can_make_other_lost = true;
        full.current_frame = 10;
        full.frame_in_use_count = 2;
        // 9 + 2 >= 10: still in flight.
        assert!(metadata.create_allocation_request(&full).is_none());

        full.current_frame = 12;
        // 9 + 2 < 12: fair game.
        assert!(metadata.create_allocation_request(&full).is_some());
    }

    #[test]
    fn eviction_spares_runs_the_alignment_skips() {
        let mut metadata = GenericMetadata::new(2048);
        let pinned = pinned_owner();
        let skipped = evictable_owner(0);
        let host = evictable_owner(0);

        let (_, _) = alloc(&mut metadata, &ctx(64, 1), &pinned);
        let (skipped_offset, _) = alloc(&mut metadata, &ctx(64, 1), &skipped);
        let (_, _) = alloc(&mut metadata, &ctx(1920, 1), &host);
        assert!(skipped_offset == 64);
        assert!(metadata.sum_free_size() == 0);

        // The aligned offset lands past the second run entirely, so only
        // the third needs to go.
        let mut evicting = ctx(512, 1024);
        evicting.can_make_other_lost = true;
        evicting.current_frame = 10;
        evicting.frame_in_use_count = 2;
        evicting.strategy = AllocationStrategy::FirstFit;

        let mut request = metadata.create_allocation_request(&evicting).unwrap();
        assert!(request.offset == 1024);
        assert!(request.items_to_make_lost == 1);
        assert!(request.sum_item_size == 1920);

        let (ok, bytes) = metadata.make_requested_allocations_lost(10, 2, &mut request);
        assert!(ok);
        assert!(bytes == 1920);
        assert!(!skipped.is_lost());
        assert!(host.is_lost());
        assert!(metadata.validate());

        let token = metadata.alloc(&request, evicting.kind, evicting.size, &pinned_owner());
        assert!(metadata.validate());
        metadata.free(request.offset, token);
    }

    #[test]
    fn make_requested_lost_aborts_on_touch_race() {
        let mut metadata = GenericMetadata::new(300);
        let stale = evictable_owner(0);

        let mut full = ctx(300, 1);
        let (_, _) = alloc(&mut metadata, &full, &stale);

        full.can_make_other_lost = true;
        full.current_frame = 10;
        full.frame_in_use_count = 2;
        let mut request = metadata.create_allocation_request(&full).unwrap();

        // The owner gets touched between search and commit.
        assert!(stale.touch(10));

        let (ok, bytes) = metadata.make_requested_allocations_lost(10, 2, &mut request);
        assert!(!ok);
        assert!(bytes == 0);
        assert!(!stale.is_lost());
        assert!(metadata.validate());
    }

    #[test]
    fn sweep_retires_only_stale_allocations() {
        let mut metadata = GenericMetadata::new(MIB);
        let stale = evictable_owner(0);
        let recent = evictable_owner(9);
        let pinned = pinned_owner();

        let (_, _) = alloc(&mut metadata, &ctx(100, 1), &stale);
        let (_, _) = alloc(&mut metadata, &ctx(200, 1), &recent);
        let (_, _) = alloc(&mut metadata, &ctx(300, 1), &pinned);

        let (count, bytes) = metadata.make_allocations_lost(10, 2);

        assert!(count == 1);
        assert!(bytes == 100);
        assert!(stale.is_lost());
        assert!(!recent.is_lost());
        assert!(metadata.validate());
        assert!(metadata.allocation_count() == 2);
    }

    #[test]
    fn small_gaps_stay_out_of_the_index() {
        let mut metadata = GenericMetadata::new(MIB);
        let owner = pinned_owner();

        // Free a gap smaller than the registration threshold.
        let (ga, ta) = alloc(&mut metadata, &ctx(MIN_FREE_SIZE_TO_REGISTER - 1, 1), &owner);
        let (_, _) = alloc(&mut metadata, &ctx(KIB, 1), &owner);
        metadata.free(ga, ta);
        assert!(metadata.validate());

        // Only the tail run is registered; the gap is still counted free.
        assert!(metadata.free_by_size.len() == 1);
        assert!(metadata.free_count == 2);
        assert!(metadata.sum_free_size() == MIB - KIB);
    }
}
