//! Per-heap accounting of committed and handed-out memory.
//!
//! Two byte counters exist per heap: `block_bytes`, what the backend has
//! committed for us (shared and dedicated blocks alike), and
//! `allocation_bytes`, what is handed out to live allocations. Block
//! admission happens against `block_bytes` *before* the backend call, with a
//! compare-and-swap loop when the heap has a configured size limit, and is
//! rolled back if the backend then refuses. The counters are atomics; no
//! allocation or free ever takes a lock for budget accounting.
//!
//! Usage numbers reported by the backend include other consumers of the
//! device, so they cannot be tracked, only sampled. A sample is taken at
//! most every [`BUDGET_REFRESH_INTERVAL`] accounting operations and on
//! frame-index changes, and usage in between is extrapolated by adding the
//! movement of our own `block_bytes` since the sample.

use crate::{
    backend::{MemoryBackend, MemoryProperties, MAX_MEMORY_HEAPS},
    AllocationError, DeviceSize,
};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Number of accounting operations after which the next budget query
/// re-samples the backend.
pub const BUDGET_REFRESH_INTERVAL: u32 = 30;

/// Budget numbers of one heap, as returned by
/// [`Allocator::get_budget`](crate::allocator::Allocator::get_budget).
#[derive(Clone, Copy, Debug, Default)]
pub struct BudgetInfo {
    /// Bytes currently committed in backend blocks for this allocator.
    pub block_bytes: DeviceSize,
    /// Bytes of those blocks handed out to live allocations.
    pub allocation_bytes: DeviceSize,
    /// Estimated total usage of the heap, other consumers included when the
    /// backend reports budgets, `block_bytes` otherwise.
    pub usage: DeviceSize,
    /// Usable size of the heap: the backend's advised budget when
    /// available, a fixed fraction of the heap size otherwise.
    pub budget: DeviceSize,
}

#[derive(Debug, Default)]
struct HeapCounters {
    block_bytes: AtomicU64,
    allocation_bytes: AtomicU64,
}

/// The backend sample the extrapolation is based on. Kept coherent as one
/// unit behind a mutex; only refreshes write it.
#[derive(Debug)]
struct FetchedBudgets {
    usage: SmallVec<[DeviceSize; MAX_MEMORY_HEAPS]>,
    budget: SmallVec<[DeviceSize; MAX_MEMORY_HEAPS]>,
    /// Our own `block_bytes` at sample time, per heap.
    block_bytes_at_fetch: SmallVec<[DeviceSize; MAX_MEMORY_HEAPS]>,
}

#[derive(Debug)]
pub(crate) struct BudgetTracker {
    heaps: SmallVec<[HeapCounters; MAX_MEMORY_HEAPS]>,
    /// Heap sizes with configured limits already applied.
    heap_sizes: SmallVec<[DeviceSize; MAX_MEMORY_HEAPS]>,
    /// Bit i set when heap i has a configured size limit and block
    /// admission must check it.
    limit_mask: u32,
    /// `None` when the backend answered the construction-time probe with
    /// `None`; the capability is constant, so it is never asked again.
    fetched: Option<Mutex<FetchedBudgets>>,
    operations_since_fetch: AtomicU32,
}

impl BudgetTracker {
    /// `heap_size_limits` pairs up with the backend's heaps by index;
    /// missing entries and `None` entries leave the heap uncapped.
    pub fn new(
        backend: &dyn MemoryBackend,
        properties: &MemoryProperties,
        heap_size_limits: &[Option<DeviceSize>],
    ) -> Self {
        let heap_count = properties.memory_heaps.len();
        debug_assert!(heap_count > 0 && heap_count <= MAX_MEMORY_HEAPS);

        let mut heap_sizes: SmallVec<[DeviceSize; MAX_MEMORY_HEAPS]> =
            properties.memory_heaps.iter().map(|heap| heap.size).collect();

        let mut limit_mask = 0;
        for (heap_index, &limit) in heap_size_limits.iter().take(heap_count).enumerate() {
            if let Some(limit) = limit {
                limit_mask |= 1 << heap_index;
                heap_sizes[heap_index] = heap_sizes[heap_index].min(limit);
            }
        }

        let heaps = (0..heap_count).map(|_| HeapCounters::default()).collect();

        // One probe decides whether the backend can report budgets at all.
        let fetched = backend.query_budget().map(|budgets| {
            debug_assert!(budgets.len() == heap_count);

            Mutex::new(FetchedBudgets {
                usage: budgets.iter().map(|b| b.usage).collect(),
                budget: budgets.iter().map(|b| b.budget).collect(),
                block_bytes_at_fetch: smallvec::smallvec![0; heap_count],
            })
        });

        BudgetTracker {
            heaps,
            heap_sizes,
            limit_mask,
            fetched,
            operations_since_fetch: AtomicU32::new(0),
        }
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    /// Admits `size` bytes of a new backend block against the heap's
    /// limit, or refuses without side effects.
    ///
    /// On success the bytes are committed in the counters even though the
    /// backend has not been called yet; a failing backend call must be
    /// settled with [`on_block_freed`](Self::on_block_freed).
    pub fn try_add_block(
        &self,
        heap_index: usize,
        size: DeviceSize,
    ) -> Result<(), AllocationError> {
        let block_bytes = &self.heaps[heap_index].block_bytes;

        if self.limit_mask & (1 << heap_index) != 0 {
            let heap_size = self.heap_sizes[heap_index];
            let mut current = block_bytes.load(Ordering::Acquire);

            loop {
                let after = current
                    .checked_add(size)
                    .filter(|&after| after <= heap_size)
                    .ok_or(AllocationError::OutOfDeviceMemory)?;

                match block_bytes.compare_exchange_weak(
                    current,
                    after,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(()),
                    Err(observed) => current = observed,
                }
            }
        } else {
            block_bytes.fetch_add(size, Ordering::AcqRel);
            Ok(())
        }
    }

    /// Settles the counters after a block was returned to the backend, or
    /// after a backend block allocation failed post-admission.
    pub fn on_block_freed(&self, heap_index: usize, size: DeviceSize) {
        let prev = self.heaps[heap_index]
            .block_bytes
            .fetch_sub(size, Ordering::AcqRel);
        debug_assert!(prev >= size);
    }

    /// Counts a backend operation toward the refresh interval.
    pub fn note_operation(&self) {
        self.operations_since_fetch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_allocation(&self, heap_index: usize, size: DeviceSize) {
        self.heaps[heap_index]
            .allocation_bytes
            .fetch_add(size, Ordering::AcqRel);
        self.note_operation();
    }

    pub fn remove_allocation(&self, heap_index: usize, size: DeviceSize) {
        let prev = self.heaps[heap_index]
            .allocation_bytes
            .fetch_sub(size, Ordering::AcqRel);
        debug_assert!(prev >= size);
        self.note_operation();
    }

    /// Re-samples the backend's budget numbers, if it reports any.
    pub fn refresh(&self, backend: &dyn MemoryBackend) {
        let Some(fetched) = &self.fetched else {
            return;
        };

        let Some(budgets) = backend.query_budget() else {
            return;
        };
        debug_assert!(budgets.len() == self.heaps.len());

        let mut fetched = fetched.lock();
        for (heap_index, budget) in budgets.iter().enumerate().take(self.heaps.len()) {
            fetched.usage[heap_index] = budget.usage;
            fetched.budget[heap_index] = budget.budget;
            fetched.block_bytes_at_fetch[heap_index] =
                self.heaps[heap_index].block_bytes.load(Ordering::Acquire);
        }

        self.operations_since_fetch.store(0, Ordering::Relaxed);
    }

    /// Current budget numbers for one heap.
    ///
    /// Usage is extrapolated from the last sample; the sample is renewed
    /// first when enough operations have passed since.
    pub fn get_budget(&self, backend: &dyn MemoryBackend, heap_index: usize) -> BudgetInfo {
        if self.fetched.is_some()
            && self.operations_since_fetch.load(Ordering::Relaxed) >= BUDGET_REFRESH_INTERVAL
        {
            self.refresh(backend);
        }

        let counters = &self.heaps[heap_index];
        let block_bytes = counters.block_bytes.load(Ordering::Acquire);
        let allocation_bytes = counters.allocation_bytes.load(Ordering::Acquire);

        match &self.fetched {
            Some(fetched) => {
                let fetched = fetched.lock();

                // Our own movement since the sample shifts the sampled
                // usage; other consumers' movement is invisible until the
                // next sample.
                let usage = (fetched.usage[heap_index] + block_bytes)
                    .saturating_sub(fetched.block_bytes_at_fetch[heap_index]);

                BudgetInfo {
                    block_bytes,
                    allocation_bytes,
                    usage,
                    budget: fetched.budget[heap_index].min(self.heap_sizes[heap_index]),
                }
            }
            None => BudgetInfo {
                block_bytes,
                allocation_bytes,
                usage: block_bytes,
                budget: self.heap_sizes[heap_index] * 8 / 10,
            },
        }
    }

    #[cfg(test)]
    pub fn block_bytes(&self, heap_index: usize) -> DeviceSize {
        self.heaps[heap_index].block_bytes.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeapBudget;
    use crate::tests::TestBackend;

    const MIB: DeviceSize = 1 << 20;

    #[test]
    fn heuristic_budget_without_backend_support() {
        let backend = TestBackend::new();
        let properties = backend.memory_properties().clone();
        let tracker = BudgetTracker::new(&backend, &properties, &[]);

        tracker.try_add_block(0, 8 * MIB).unwrap();

        let info = tracker.get_budget(&backend, 0);
        assert!(info.block_bytes == 8 * MIB);
        assert!(info.usage == 8 * MIB);
        assert!(info.budget == properties.memory_heaps[0].size * 8 / 10);
    }

    #[test]
    fn limited_heap_refuses_over_admission() {
        let backend = TestBackend::new();
        let properties = backend.memory_properties().clone();
        let tracker = BudgetTracker::new(&backend, &properties, &[Some(MIB)]);

        tracker.try_add_block(0, 600 * 1024).unwrap();
        assert!(tracker.try_add_block(0, 600 * 1024) == Err(AllocationError::OutOfDeviceMemory));

        // Freeing makes room again.
        tracker.on_block_freed(0, 600 * 1024);
        tracker.try_add_block(0, 600 * 1024).unwrap();
        assert!(tracker.block_bytes(0) == 600 * 1024);
    }

    #[test]
    fn limit_caps_the_reported_budget() {
        let backend = TestBackend::new();
        let properties = backend.memory_properties().clone();
        let tracker = BudgetTracker::new(&backend, &properties, &[None, Some(MIB)]);

        let info = tracker.get_budget(&backend, 1);
        assert!(info.budget == MIB * 8 / 10);
    }

    #[test]
    fn unlimited_heap_admits_anything() {
        let backend = TestBackend::new();
        let properties = backend.memory_properties().clone();
        let tracker = BudgetTracker::new(&backend, &properties, &[]);

        tracker
            .try_add_block(0, properties.memory_heaps[0].size * 4)
            .unwrap();
    }

    #[test]
    fn backend_usage_is_extrapolated_between_samples() {
        let backend = TestBackend::new();
        let heap_count = backend.memory_properties().memory_heaps.len();
        backend.set_budget(Some(vec![
            HeapBudget {
                usage: 10 * MIB,
                budget: 40 * MIB,
            };
            heap_count
        ]));

        let properties = backend.memory_properties().clone();
        let tracker = BudgetTracker::new(&backend, &properties, &[]);

        // Sampled usage 10 MiB, plus 2 MiB of our own blocks since.
        tracker.try_add_block(0, 2 * MIB).unwrap();
        let info = tracker.get_budget(&backend, 0);
        assert!(info.usage == 12 * MIB);
        assert!(info.budget == 40 * MIB);
    }

    #[test]
    fn racing_admissions_never_overshoot_the_limit() {
        const THREADS: u64 = 4;
        const ATTEMPTS: u64 = 64;
        const CHUNK: DeviceSize = 64 * 1024;

        let backend = TestBackend::new();
        let properties = backend.memory_properties().clone();
        let limit = 10 * CHUNK;
        let tracker = BudgetTracker::new(&backend, &properties, &[Some(limit)]);

        let admitted: u64 = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    scope.spawn(|| {
                        (0..ATTEMPTS)
                            .filter(|_| tracker.try_add_block(0, CHUNK).is_ok())
                            .count() as u64
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).sum()
        });

        // Far more attempts than fit; every admission must be accounted
        // and the cap never crossed.
        assert!(admitted == limit / CHUNK);
        assert!(tracker.block_bytes(0) == limit);
    }

    #[test]
    fn sample_renews_after_enough_operations() {
        let backend = TestBackend::new();
        let heap_count = backend.memory_properties().memory_heaps.len();
        backend.set_budget(Some(vec![HeapBudget::default(); heap_count]));

        let properties = backend.memory_properties().clone();
        let tracker = BudgetTracker::new(&backend, &properties, &[]);

        backend.set_budget(Some(vec![
            HeapBudget {
                usage: 30 * MIB,
                budget: 50 * MIB,
            };
            heap_count
        ]));

        // Stale until the operation counter crosses the interval.
        assert!(tracker.get_budget(&backend, 0).usage == 0);

        for _ in 0..BUDGET_REFRESH_INTERVAL {
            tracker.add_allocation(0, 1);
        }
        let info = tracker.get_budget(&backend, 0);
        assert!(info.usage == 30 * MIB);
        assert!(info.budget == 50 * MIB);
    }
}
