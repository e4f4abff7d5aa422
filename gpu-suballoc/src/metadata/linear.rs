//! The linear (stack / ring / double-stack) engine.
//!
//! Placement is append-only: requests go right after the newest entry, so
//! search and commit are constant time. The layout lives in two vectors:
//!
//! - While frees only happen in LIFO order, the first vector is a plain
//!   stack growing from offset 0.
//! - A free at the oldest entry opens a hole at the bottom; once the top
//!   hits the block end, new entries wrap around into the second vector
//!   and the block behaves as a ring buffer chasing the first vector's
//!   remaining entries.
//! - Upper-address requests instead grow the second vector downward from
//!   the block end (double stack). A block can be a ring or a double
//!   stack, never both.
//!
//! Frees in the middle only mark the entry dead; dead entries are trimmed
//! from the vector edges after every free, and the first vector is
//! rewritten wholesale once dead entries dominate it. This engine never
//! produces eviction requests, but supports the whole-block eviction
//! sweep.

use super::{
    are_blocks_on_same_page, AllocationContext, AllocationRequest, RequestType, Suballocation,
    SuballocationKind,
};
use crate::{align_down, align_up, allocation::AllocationState, DeviceSize};
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SecondVectorMode {
    /// Everything lives in the first vector.
    Empty,
    /// The second vector chases the first around the block end.
    RingBuffer,
    /// The second vector grows down from the block end.
    DoubleStack,
}

#[derive(Debug)]
pub(crate) struct LinearMetadata {
    size: DeviceSize,
    sum_free_size: DeviceSize,
    // The roles swap when the ring's first vector drains, so both live
    // here and `first_vector_index` picks.
    suballocations0: Vec<Suballocation>,
    suballocations1: Vec<Suballocation>,
    first_vector_index: usize,
    second_mode: SecondVectorMode,
    /// Dead entries at the start of the first vector, not yet trimmed.
    first_null_items_begin_count: usize,
    /// Dead entries between live ones in the first vector.
    first_null_items_middle_count: usize,
    second_null_items_count: usize,
}

impl LinearMetadata {
    pub fn new(size: DeviceSize) -> Self {
        debug_assert!(size > 0);

        LinearMetadata {
            size,
            sum_free_size: size,
            suballocations0: Vec::new(),
            suballocations1: Vec::new(),
            first_vector_index: 0,
            second_mode: SecondVectorMode::Empty,
            first_null_items_begin_count: 0,
            first_null_items_middle_count: 0,
            second_null_items_count: 0,
        }
    }

    fn first(&self) -> &Vec<Suballocation> {
        if self.first_vector_index == 0 {
            &self.suballocations0
        } else {
            &self.suballocations1
        }
    }

    fn first_mut(&mut self) -> &mut Vec<Suballocation> {
        if self.first_vector_index == 0 {
            &mut self.suballocations0
        } else {
            &mut self.suballocations1
        }
    }

    fn second(&self) -> &Vec<Suballocation> {
        if self.first_vector_index == 0 {
            &self.suballocations1
        } else {
            &self.suballocations0
        }
    }

    fn second_mut(&mut self) -> &mut Vec<Suballocation> {
        if self.first_vector_index == 0 {
            &mut self.suballocations1
        } else {
            &mut self.suballocations0
        }
    }

    pub fn size(&self) -> DeviceSize {
        self.size
    }

    pub fn sum_free_size(&self) -> DeviceSize {
        self.sum_free_size
    }

    pub fn allocation_count(&self) -> usize {
        self.first().len() - self.first_null_items_begin_count - self.first_null_items_middle_count
            + self.second().len()
            - self.second_null_items_count
    }

    pub fn is_empty(&self) -> bool {
        self.allocation_count() == 0
    }

    /// Size of the largest span a new lower-address request could use.
    /// Dead entries inside the vectors do not count; they are unreachable
    /// for placement.
    pub fn unused_range_size_max(&self) -> DeviceSize {
        if self.is_empty() {
            return self.size;
        }

        let first = self.first();
        match self.second_mode {
            SecondVectorMode::Empty => {
                // Space after the top, or the hole before the oldest entry.
                let head = &first[self.first_null_items_begin_count];
                let last = first.last().unwrap();
                head.offset.max(self.size - (last.offset + last.size))
            }
            SecondVectorMode::RingBuffer => {
                // Space between the ring's head and the chased tail.
                let second_last = self.second().last().unwrap();
                let head = &first[self.first_null_items_begin_count];
                head.offset - (second_last.offset + second_last.size)
            }
            SecondVectorMode::DoubleStack => {
                // Space between the two stacks.
                let top = self.second().last().unwrap();
                let end_of_first = first.last().map_or(0, |s| s.offset + s.size);
                top.offset - end_of_first
            }
        }
    }

    pub fn create_allocation_request(&self, ctx: &AllocationContext) -> Option<AllocationRequest> {
        debug_assert!(ctx.size > 0);
        debug_assert!(ctx.alignment.is_power_of_two());

        if ctx.upper_address {
            self.create_allocation_request_upper(ctx)
        } else {
            self.create_allocation_request_lower(ctx)
        }
    }

    fn create_allocation_request_lower(
        &self,
        ctx: &AllocationContext,
    ) -> Option<AllocationRequest> {
        let first = self.first();
        let second = self.second();

        if matches!(
            self.second_mode,
            SecondVectorMode::Empty | SecondVectorMode::DoubleStack,
        ) {
            // Append after the top of the first vector.
            let base_offset = first.last().map_or(0, |s| s.offset + s.size);
            let mut offset = align_up(base_offset, ctx.alignment);

            // A conflicting entry below us on the same granularity page
            // pushes the start to the next page.
            if ctx.granularity > 1 && !first.is_empty() {
                let mut conflict = false;
                for prev in first.iter().rev() {
                    if !are_blocks_on_same_page(prev.offset, prev.size, offset, ctx.granularity) {
                        break;
                    }
                    if prev.kind.conflicts_on_page(ctx.kind) {
                        conflict = true;
                        break;
                    }
                }
                if conflict {
                    offset = align_up(offset, ctx.granularity);
                }
            }

            let free_space_end = if self.second_mode == SecondVectorMode::DoubleStack {
                second.last().unwrap().offset
            } else {
                self.size
            };

            if offset + ctx.size <= free_space_end {
                // The upper stack's bottom must not share our last page
                // with a conflicting kind; there is no way to move it.
                let mut fits = true;
                if ctx.granularity > 1 && self.second_mode == SecondVectorMode::DoubleStack {
                    for next in second.iter().rev() {
                        if !are_blocks_on_same_page(offset, ctx.size, next.offset, ctx.granularity)
                        {
                            break;
                        }
                        if ctx.kind.conflicts_on_page(next.kind) {
                            fits = false;
                            break;
                        }
                    }
                }

                if fits {
                    return Some(AllocationRequest {
                        offset,
                        sum_free_size: free_space_end - base_offset,
                        sum_item_size: 0,
                        items_to_make_lost: 0,
                        item: 0,
                        request_type: RequestType::EndOfFirst,
                    });
                }
            }
        }

        // Wrap around: place between the second vector's end and the first
        // vector's oldest live entry.
        if matches!(
            self.second_mode,
            SecondVectorMode::Empty | SecondVectorMode::RingBuffer,
        ) {
            if first.is_empty() {
                // Nothing to wrap around; the path above already covered
                // the whole block.
                return None;
            }

            let base_offset = second.last().map_or(0, |s| s.offset + s.size);
            let mut offset = align_up(base_offset, ctx.alignment);

            if ctx.granularity > 1 && !second.is_empty() {
                let mut conflict = false;
                for prev in second.iter().rev() {
                    if !are_blocks_on_same_page(prev.offset, prev.size, offset, ctx.granularity) {
                        break;
                    }
                    if prev.kind.conflicts_on_page(ctx.kind) {
                        conflict = true;
                        break;
                    }
                }
                if conflict {
                    offset = align_up(offset, ctx.granularity);
                }
            }

            let limit = match first.get(self.first_null_items_begin_count) {
                Some(chased) => chased.offset,
                None => self.size,
            };

            if offset + ctx.size <= limit {
                let mut fits = true;
                if ctx.granularity > 1 {
                    for next in &first[self.first_null_items_begin_count..] {
                        if !are_blocks_on_same_page(offset, ctx.size, next.offset, ctx.granularity)
                        {
                            break;
                        }
                        if ctx.kind.conflicts_on_page(next.kind) {
                            fits = false;
                            break;
                        }
                    }
                }

                if fits {
                    return Some(AllocationRequest {
                        offset,
                        sum_free_size: limit - base_offset,
                        sum_item_size: 0,
                        items_to_make_lost: 0,
                        item: 0,
                        request_type: RequestType::EndOfSecond,
                    });
                }
            }
        }

        None
    }

    fn create_allocation_request_upper(
        &self,
        ctx: &AllocationContext,
    ) -> Option<AllocationRequest> {
        // A ring buffer and an upper stack cannot coexist.
        if self.second_mode == SecondVectorMode::RingBuffer {
            return None;
        }
        if ctx.size > self.size {
            return None;
        }

        let first = self.first();
        let second = self.second();

        let base_offset = match second.last() {
            Some(top) => {
                if ctx.size > top.offset {
                    return None;
                }
                top.offset - ctx.size
            }
            None => self.size - ctx.size,
        };

        let mut offset = align_down(base_offset, ctx.alignment);

        // A conflicting entry above us on our last page forces the whole
        // request below that page.
        if ctx.granularity > 1 && !second.is_empty() {
            let mut conflict = false;
            for next in second.iter().rev() {
                if !are_blocks_on_same_page(offset, ctx.size, next.offset, ctx.granularity) {
                    break;
                }
                if ctx.kind.conflicts_on_page(next.kind) {
                    conflict = true;
                    break;
                }
            }
            if conflict {
                let shared_page = align_down(offset + ctx.size - 1, ctx.granularity);
                if shared_page < ctx.size {
                    return None;
                }
                offset = align_down(shared_page - ctx.size, ctx.alignment);
            }
        }

        let end_of_first = first.last().map_or(0, |s| s.offset + s.size);
        if offset < end_of_first {
            return None;
        }

        // The lower stack's top must not share our first page with a
        // conflicting kind.
        if ctx.granularity > 1 {
            for prev in first.iter().rev() {
                if !are_blocks_on_same_page(prev.offset, prev.size, offset, ctx.granularity) {
                    break;
                }
                if prev.kind.conflicts_on_page(ctx.kind) {
                    return None;
                }
            }
        }

        Some(AllocationRequest {
            offset,
            sum_free_size: offset - end_of_first,
            sum_item_size: 0,
            items_to_make_lost: 0,
            item: 0,
            request_type: RequestType::UpperAddress,
        })
    }

    pub fn alloc(
        &mut self,
        request: &AllocationRequest,
        kind: SuballocationKind,
        size: DeviceSize,
        owner: &Arc<AllocationState>,
    ) -> usize {
        debug_assert!(kind != SuballocationKind::Free);

        let suballoc = Suballocation {
            offset: request.offset,
            size,
            kind,
            owner: Some(owner.clone()),
        };

        match request.request_type {
            RequestType::UpperAddress => {
                debug_assert!(self.second_mode != SecondVectorMode::RingBuffer);
                self.second_mut().push(suballoc);
                self.second_mode = SecondVectorMode::DoubleStack;
            }
            RequestType::EndOfFirst => {
                debug_assert!(self
                    .first()
                    .last()
                    .map_or(true, |last| request.offset >= last.offset + last.size));
                debug_assert!(request.offset + size <= self.size);
                self.first_mut().push(suballoc);
            }
            RequestType::EndOfSecond => {
                debug_assert!(self.second_mode != SecondVectorMode::DoubleStack);
                debug_assert!(
                    request.offset + size
                        <= self.first()[self.first_null_items_begin_count].offset
                );
                self.second_mut().push(suballoc);
                self.second_mode = SecondVectorMode::RingBuffer;
            }
            RequestType::Normal => unreachable!(),
        }

        self.sum_free_size -= size;

        // Linear frees locate their entry by offset alone.
        0
    }

    pub fn free(&mut self, offset: DeviceSize) {
        // The ring's oldest entry.
        let begin = self.first_null_items_begin_count;
        if let Some(head) = self.first().get(begin) {
            if head.offset == offset {
                let size = head.size;
                let head = &mut self.first_mut()[begin];
                head.kind = SuballocationKind::Free;
                head.owner = None;
                self.first_null_items_begin_count += 1;
                self.sum_free_size += size;
                self.cleanup_after_free();
                return;
            }
        }

        // The newest entry of whichever vector currently ends the layout.
        match self.second_mode {
            SecondVectorMode::RingBuffer | SecondVectorMode::DoubleStack => {
                if let Some(last) = self.second().last() {
                    if last.offset == offset {
                        let size = last.size;
                        self.second_mut().pop();
                        self.sum_free_size += size;
                        self.cleanup_after_free();
                        return;
                    }
                }
            }
            SecondVectorMode::Empty => {
                if let Some(last) = self.first().last() {
                    if last.offset == offset {
                        let size = last.size;
                        self.first_mut().pop();
                        self.sum_free_size += size;
                        self.cleanup_after_free();
                        return;
                    }
                }
            }
        }

        // The middle of the first vector.
        if let Ok(index) = self.first()[begin..].binary_search_by_key(&offset, |s| s.offset) {
            let suballoc = &mut self.first_mut()[begin + index];
            debug_assert!(!suballoc.is_free());
            let size = suballoc.size;
            suballoc.kind = SuballocationKind::Free;
            suballoc.owner = None;
            self.first_null_items_middle_count += 1;
            self.sum_free_size += size;
            self.cleanup_after_free();
            return;
        }

        // The middle of the second vector. Ring storage is ascending by
        // offset, double-stack storage descending.
        if self.second_mode != SecondVectorMode::Empty {
            let result = if self.second_mode == SecondVectorMode::RingBuffer {
                self.second().binary_search_by_key(&offset, |s| s.offset)
            } else {
                self.second()
                    .binary_search_by(|s| s.offset.cmp(&offset).reverse())
            };

            if let Ok(index) = result {
                let suballoc = &mut self.second_mut()[index];
                debug_assert!(!suballoc.is_free());
                let size = suballoc.size;
                suballoc.kind = SuballocationKind::Free;
                suballoc.owner = None;
                self.second_null_items_count += 1;
                self.sum_free_size += size;
                self.cleanup_after_free();
                return;
            }
        }

        debug_assert!(false, "no suballocation at the freed offset");
    }

    pub fn make_allocations_lost(
        &mut self,
        current_frame: u32,
        frame_in_use_count: u32,
    ) -> (usize, DeviceSize) {
        let mut bytes = 0;
        let mut first_nulled = 0;
        let mut second_nulled = 0;

        let begin = self.first_null_items_begin_count;
        for suballoc in &mut self.first_mut()[begin..] {
            let evict = match &suballoc.owner {
                Some(owner) => {
                    owner.can_become_lost() && owner.try_make_lost(current_frame, frame_in_use_count)
                }
                None => false,
            };
            if evict {
                suballoc.kind = SuballocationKind::Free;
                suballoc.owner = None;
                first_nulled += 1;
                bytes += suballoc.size;
            }
        }

        for suballoc in self.second_mut().iter_mut() {
            let evict = match &suballoc.owner {
                Some(owner) => {
                    owner.can_become_lost() && owner.try_make_lost(current_frame, frame_in_use_count)
                }
                None => false,
            };
            if evict {
                suballoc.kind = SuballocationKind::Free;
                suballoc.owner = None;
                second_nulled += 1;
                bytes += suballoc.size;
            }
        }

        self.first_null_items_middle_count += first_nulled;
        self.second_null_items_count += second_nulled;
        self.sum_free_size += bytes;

        let count = first_nulled + second_nulled;
        if count > 0 {
            self.cleanup_after_free();
        }

        (count, bytes)
    }

    /// Trims dead entries from the vector edges, rewrites the first vector
    /// once dead entries dominate it, and swaps the vectors when the ring's
    /// first drains.
    fn cleanup_after_free(&mut self) {
        if self.is_empty() {
            self.suballocations0.clear();
            self.suballocations1.clear();
            self.first_null_items_begin_count = 0;
            self.first_null_items_middle_count = 0;
            self.second_null_items_count = 0;
            self.second_mode = SecondVectorMode::Empty;
            debug_assert!(self.validate());
            return;
        }

        let first_len = self.first().len();
        debug_assert!(
            self.first_null_items_begin_count + self.first_null_items_middle_count <= first_len
        );

        // Middle nulls that reached the beginning become begin nulls.
        while self.first_null_items_begin_count < first_len
            && self.first()[self.first_null_items_begin_count].is_free()
        {
            self.first_null_items_begin_count += 1;
            self.first_null_items_middle_count -= 1;
        }

        // Nulls that reached the end are dropped outright.
        while self.first_null_items_middle_count > 0 && self.first().last().unwrap().is_free() {
            self.first_null_items_middle_count -= 1;
            self.first_mut().pop();
        }

        while self.second_null_items_count > 0
            && self.second().last().is_some_and(|s| s.is_free())
        {
            self.second_null_items_count -= 1;
            self.second_mut().pop();
        }

        while self.second_null_items_count > 0
            && self.second().first().is_some_and(|s| s.is_free())
        {
            self.second_null_items_count -= 1;
            self.second_mut().remove(0);
        }

        if self.should_compact_first() {
            self.first_mut().retain(|s| !s.is_free());
            self.first_null_items_begin_count = 0;
            self.first_null_items_middle_count = 0;
        }

        if self.second().is_empty() {
            self.second_mode = SecondVectorMode::Empty;
        }

        // The first vector drained; the ring's second vector takes over
        // its role.
        if self.first().len() == self.first_null_items_begin_count {
            self.first_mut().clear();
            self.first_null_items_begin_count = 0;

            if !self.second().is_empty() && self.second_mode == SecondVectorMode::RingBuffer {
                self.second_mode = SecondVectorMode::Empty;
                self.first_null_items_middle_count = self.second_null_items_count;
                self.second_null_items_count = 0;
                self.first_vector_index ^= 1;
            }
        }

        debug_assert!(self.validate());
    }

    fn should_compact_first(&self) -> bool {
        let null_count = self.first_null_items_begin_count + self.first_null_items_middle_count;
        let len = self.first().len();

        len > 32 && null_count * 2 >= (len - null_count) * 3
    }

    pub fn validate(&self) -> bool {
        let first = self.first();
        let second = self.second();

        validate!(second.is_empty() == (self.second_mode == SecondVectorMode::Empty));
        // A ring cannot outlive the vector it chases.
        validate!(self.second_mode != SecondVectorMode::RingBuffer || !first.is_empty());

        if !first.is_empty() {
            validate!(self.first_null_items_begin_count < first.len());
            // Edge nulls are supposed to be trimmed by cleanup.
            validate!(!first[self.first_null_items_begin_count].is_free());
            validate!(!first.last().unwrap().is_free());
        }
        if !second.is_empty() {
            validate!(!second.last().unwrap().is_free());
        }
        validate!(
            self.first_null_items_begin_count + self.first_null_items_middle_count <= first.len()
        );
        validate!(self.second_null_items_count <= second.len());

        let mut sum_used = 0;
        let mut offset = 0;

        // Walk the layout in offset order; the running offset enforces
        // that the pieces do not overlap.
        if self.second_mode == SecondVectorMode::RingBuffer {
            let mut nulls = 0;
            for suballoc in second {
                validate!(suballoc.is_free() == suballoc.owner.is_none());
                validate!(suballoc.offset >= offset);
                if suballoc.is_free() {
                    nulls += 1;
                } else {
                    sum_used += suballoc.size;
                }
                offset = suballoc.offset + suballoc.size;
            }
            validate!(nulls == self.second_null_items_count);
        }

        for suballoc in &first[..self.first_null_items_begin_count] {
            validate!(suballoc.is_free() && suballoc.owner.is_none());
        }

        let mut first_nulls = self.first_null_items_begin_count;
        for suballoc in &first[self.first_null_items_begin_count..] {
            validate!(suballoc.is_free() == suballoc.owner.is_none());
            validate!(suballoc.offset >= offset);
            if suballoc.is_free() {
                first_nulls += 1;
            } else {
                sum_used += suballoc.size;
            }
            offset = suballoc.offset + suballoc.size;
        }
        validate!(
            first_nulls == self.first_null_items_begin_count + self.first_null_items_middle_count
        );

        if self.second_mode == SecondVectorMode::DoubleStack {
            let mut nulls = 0;
            for suballoc in second.iter().rev() {
                validate!(suballoc.is_free() == suballoc.owner.is_none());
                validate!(suballoc.offset >= offset);
                if suballoc.is_free() {
                    nulls += 1;
                } else {
                    sum_used += suballoc.size;
                }
                offset = suballoc.offset + suballoc.size;
            }
            validate!(nulls == self.second_null_items_count);
        }

        validate!(offset <= self.size);
        validate!(self.sum_free_size == self.size - sum_used);

        true
    }

    pub fn add_stat_info(&self, info: &mut crate::stats::StatInfo) {
        fn fold<'a>(
            info: &mut crate::stats::StatInfo,
            last_offset: &mut DeviceSize,
            iter: impl Iterator<Item = &'a Suballocation>,
        ) {
            for suballoc in iter {
                if suballoc.offset > *last_offset {
                    info.add_unused_range(suballoc.offset - *last_offset);
                }
                if suballoc.is_free() {
                    info.add_unused_range(suballoc.size);
                } else {
                    info.add_allocation(suballoc.size);
                }
                *last_offset = suballoc.offset + suballoc.size;
            }
        }

        info.block_count += 1;

        // Dead entries at the first vector's start are skipped: the ring's
        // second vector reuses their offsets.
        let first = &self.first()[self.first_null_items_begin_count..];
        let second = self.second();

        let mut last_offset = 0;
        match self.second_mode {
            SecondVectorMode::Empty => {
                fold(info, &mut last_offset, first.iter());
            }
            SecondVectorMode::RingBuffer => {
                fold(info, &mut last_offset, second.iter());
                fold(info, &mut last_offset, first.iter());
            }
            SecondVectorMode::DoubleStack => {
                fold(info, &mut last_offset, first.iter());
                fold(info, &mut last_offset, second.iter().rev());
            }
        }

        if last_offset < self.size {
            info.add_unused_range(self.size - last_offset);
        }
    }
}
