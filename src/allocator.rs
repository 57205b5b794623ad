//! The page allocator: end-to-end orchestration from an allocation
//! request to a returned page.  Claiming takes memory from the mapped
//! cache or raises capacity; harvesting gathers discontiguous cache
//! ranges and remaps them contiguous; committing and mapping finish
//! the job.  Requests that cannot be satisfied stall on a latch until
//! a free or a collection supplies memory, and a per-node background
//! worker returns idle cached memory to the system.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::collections::VecDeque;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use log::debug;
use log::error;
use log::info;
use log::trace;

use crate::address::align_up;
use crate::address::is_granule_aligned;
use crate::address::BackingIndex;
use crate::address::TypedOffset;
use crate::address::ADDRESS_OFFSET_MAX;
use crate::address::GRANULE_SIZE;
use crate::address::M;
use crate::backend::get_backend;
use crate::backend::MemoryBackend;
use crate::collector::CollectorDriver;
use crate::collector::Generations;
use crate::granule_map::GranuleMap;
use crate::latch::Latch;
use crate::mapped_cache::MappedCache;
use crate::numa::NumaTopology;
use crate::numa::PerNuma;
use crate::page::AllocationFlags;
use crate::page::GenerationId;
use crate::page::MultiNumaTracker;
use crate::page::Page;
use crate::page::PageAge;
use crate::page::PageType;
use crate::page::NUM_GENERATIONS;
use crate::physical::PhysicalMemoryManager;
use crate::range::VirtualRange;
use crate::safe_delete::SafeDelete;
use crate::settings::HeapSettings;
use crate::uncommitter::Uncommitter;
use crate::virtual_memory::VirtualMemoryManager;

/// Per-node accounting readable without the allocator lock.  All
/// counters are updated with relaxed atomics; consistency across
/// counters is only guaranteed under the lock.
pub(crate) struct CacheCounters {
    current_max_capacity: AtomicUsize,
    capacity: AtomicUsize,
    claimed: AtomicUsize,
    used: AtomicUsize,
    used_generations: [AtomicUsize; NUM_GENERATIONS],
}

impl CacheCounters {
    fn new(max_capacity: usize) -> Self {
        CacheCounters {
            current_max_capacity: AtomicUsize::new(max_capacity),
            capacity: AtomicUsize::new(0),
            claimed: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            used_generations: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    fn current_max_capacity(&self) -> usize {
        self.current_max_capacity.load(Ordering::Relaxed)
    }

    fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }

    fn claimed(&self) -> usize {
        self.claimed.load(Ordering::Relaxed)
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    fn used_generation(&self, id: GenerationId) -> usize {
        self.used_generations[id as usize].load(Ordering::Relaxed)
    }

    fn increase_used_generation(&self, id: GenerationId, size: usize) {
        self.used_generations[id as usize].fetch_add(size, Ordering::Relaxed);
    }

    fn decrease_used_generation(&self, id: GenerationId, size: usize) {
        let old = self.used_generations[id as usize].fetch_sub(size, Ordering::Relaxed);
        debug_assert!(old >= size, "generation accounting underflow");
    }
}

#[derive(Clone, Copy, Default)]
struct CollectionStats {
    used_high: usize,
    used_low: usize,
}

/// Per-node state owned by the allocator lock: the mapped cache plus
/// the uncommit phase bookkeeping.
pub(crate) struct CacheState {
    numa_id: u32,
    counters: Arc<CacheCounters>,
    cache: MappedCache,
    collection_stats: [CollectionStats; NUM_GENERATIONS],
    last_commit: f64,
    last_uncommit: f64,
    to_uncommit: usize,
}

impl CacheState {
    fn new(numa_id: u32, counters: Arc<CacheCounters>, medium_page_size: usize) -> Self {
        CacheState {
            numa_id,
            counters,
            cache: MappedCache::new(medium_page_size),
            collection_stats: [Default::default(); NUM_GENERATIONS],
            last_commit: 0.0,
            last_uncommit: 0.0,
            to_uncommit: 0,
        }
    }

    fn available_capacity(&self) -> usize {
        self.counters
            .current_max_capacity()
            .saturating_sub(self.counters.used())
            .saturating_sub(self.counters.claimed())
    }

    /// Raises capacity by up to `size`, bounded by the current max.
    /// Returns the increase.  Committing resets the uncommit clock.
    fn increase_capacity(&mut self, size: usize, now: f64) -> usize {
        let headroom = self
            .counters
            .current_max_capacity()
            .saturating_sub(self.counters.capacity());
        let increased = size.min(headroom);

        if increased > 0 {
            self.counters.capacity.fetch_add(increased, Ordering::Relaxed);

            self.last_commit = now;
            self.last_uncommit = 0.0;
            self.cache.reset_min();
        }

        increased
    }

    /// Lowers capacity; with `set_max_capacity` the node's ceiling is
    /// permanently clamped to the new capacity.
    fn decrease_capacity(&mut self, size: usize, set_max_capacity: bool) {
        let old = self.counters.capacity.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(old >= size, "capacity underflow");

        if set_max_capacity {
            self.counters
                .current_max_capacity
                .store(old - size, Ordering::Relaxed);
        }
    }

    fn increase_used(&mut self, size: usize) {
        let used = self.counters.used.fetch_add(size, Ordering::Relaxed) + size;

        for stats in self.collection_stats.iter_mut() {
            if used > stats.used_high {
                stats.used_high = used;
            }
        }
    }

    fn decrease_used(&mut self, size: usize) {
        let old = self.counters.used.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(old >= size, "used accounting underflow");
        let used = old - size;

        for stats in self.collection_stats.iter_mut() {
            if used < stats.used_low {
                stats.used_low = used;
            }
        }
    }

    fn reset_statistics(&mut self, id: GenerationId) {
        let used = self.counters.used();
        self.collection_stats[id as usize] = CollectionStats {
            used_high: used,
            used_low: used,
        };
    }

    /// Claims `size` bytes of memory for `allocation`: one contiguous
    /// cache range, else a capacity increase, else a discontiguous
    /// harvest of the cache.
    fn claim_mapped_or_increase_capacity(
        &mut self,
        allocation: &mut MemoryAllocation,
        now: f64,
    ) -> bool {
        let size = allocation.size;

        // Try to claim a contiguous mapping.
        let mapping = self.cache.remove_contiguous(size);
        if !mapping.is_null() {
            allocation.claimed_mappings.push(mapping);
            return true;
        }

        // The cache holds no contiguous fit.  It may still hold enough
        // memory dispersed over several mappings, but prefer raising
        // capacity, which yields fresh unfragmented memory.
        let increased = self.increase_capacity(size, now);
        if increased == size {
            // The capacity increase covers the entire request.
            return true;
        }

        // Could not increase capacity enough.  Harvest the cache for
        // the remainder, but only if the cache holds enough to cover
        // it completely.
        let remaining = size - increased;
        if self.cache.size() >= remaining {
            let removed = self.cache.remove_discontiguous(&mut allocation.claimed_mappings, remaining);
            debug_assert_eq!(removed, remaining, "cache must cover the remainder");
            allocation.harvested = removed;
            return true;
        }

        debug_assert_eq!(increased, 0, "partial capacity increase must not leak");

        // Neither cache memory nor capacity satisfies the request.
        false
    }

    /// The whole per-node claim: availability gate, claim, and the
    /// `used` bump on success.
    fn claim_physical(&mut self, allocation: &mut MemoryAllocation, now: f64) -> bool {
        let size = allocation.size;

        if self.available_capacity() < size {
            // Out of memory on this node.
            return false;
        }

        if !self.claim_mapped_or_increase_capacity(allocation, now) {
            return false;
        }

        self.increase_used(size);
        true
    }
}

/// The per-request bookkeeping record for one node's worth of claim,
/// commit and map.
#[derive(Debug, Default)]
struct MemoryAllocation {
    size: usize,
    numa_id: u32,
    claimed_mappings: Vec<VirtualRange>,
    harvested: usize,
    committed: usize,
    commit_failed: bool,
}

impl MemoryAllocation {
    fn new(size: usize) -> Self {
        MemoryAllocation {
            size,
            ..Default::default()
        }
    }
}

/// The claim state of a request: the top-level allocation, plus the
/// per-node sub-allocations once the request flips to multi-node mode.
#[derive(Debug, Default)]
struct AllocationData {
    allocation: MemoryAllocation,
    multi_numa: Vec<MemoryAllocation>,
    is_multi_numa: bool,
}

impl AllocationData {
    fn reset_for_retry(&mut self) {
        self.allocation.claimed_mappings.clear();
        self.allocation.harvested = 0;
        self.allocation.committed = 0;
        self.allocation.commit_failed = false;
        self.multi_numa.clear();
        self.is_multi_numa = false;
    }
}

/// A stallable allocation request.  Shared between the requester and
/// whoever satisfies it from the stall queue.
pub(crate) struct PageAllocation {
    page_type: PageType,
    size: usize,
    flags: AllocationFlags,
    young_seqnum: u32,
    old_seqnum: u32,
    initiating_numa_id: u32,
    data: Mutex<AllocationData>,
    latch: Latch,
}

impl PageAllocation {
    fn new(
        page_type: PageType,
        size: usize,
        flags: AllocationFlags,
        generations: &Generations,
        initiating_numa_id: u32,
    ) -> Self {
        PageAllocation {
            page_type,
            size,
            flags,
            young_seqnum: generations.seqnum(GenerationId::Young),
            old_seqnum: generations.seqnum(GenerationId::Old),
            initiating_numa_id,
            data: Mutex::new(Default::default()),
            latch: Latch::new(),
        }
    }
}

/// Granule-map contents saved across an unmap/remap dance: reading
/// stashes (sorted, so remapping produces OS-friendly runs), popping
/// writes the segments back at the ranges' new positions.
struct SegmentStash {
    stash: Vec<BackingIndex>,
}

impl SegmentStash {
    fn new(num_granules: usize) -> Self {
        SegmentStash {
            stash: Vec::with_capacity(num_granules),
        }
    }

    fn stash_one(&mut self, map: &GranuleMap, vmem: &VirtualRange) {
        self.stash.extend(map.read(vmem));
        self.stash.sort();
    }

    fn stash_many(&mut self, map: &GranuleMap, mappings: &[VirtualRange]) {
        for vmem in mappings {
            self.stash.extend(map.read(vmem));
        }
        self.stash.sort();
    }

    /// Restores the stash into `mappings`, in order.  When the stash
    /// runs short the write is truncated: the tail of the last range
    /// keeps whatever fresh segments are installed later.
    fn pop(&self, map: &GranuleMap, mappings: &[VirtualRange]) {
        let mut stash_index = 0;
        for vmem in mappings {
            let num_granules = vmem.size_in_granules();
            let granules_left = self.stash.len() - stash_index;

            if num_granules >= granules_left {
                map.write(vmem.start(), &self.stash[stash_index..]);
                return;
            }

            map.write(vmem.start(), &self.stash[stash_index..stash_index + num_granules]);
            stash_index += num_granules;
        }
    }
}

struct AllocatorShared {
    states: PerNuma<CacheState>,
    stalled: VecDeque<Arc<PageAllocation>>,
}

/// Statistics snapshot, taken under the allocator lock.
#[derive(Clone, Copy, Debug)]
pub struct PageAllocatorStats {
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub soft_max_capacity: usize,
    pub capacity: usize,
    pub used: usize,
    pub used_high: usize,
    pub used_low: usize,
    pub used_generation: usize,
    pub allocation_stalls: usize,
}

pub struct PageAllocator {
    backend: &'static dyn MemoryBackend,
    topology: NumaTopology,
    virtual_mgr: VirtualMemoryManager,
    physical: PhysicalMemoryManager,
    physical_mappings: GranuleMap,
    min_capacity: usize,
    initial_capacity: usize,
    max_capacity: usize,
    soft_max_capacity: usize,
    always_pretouch: bool,
    counters: PerNuma<Arc<CacheCounters>>,
    shared: Mutex<AllocatorShared>,
    safe_destroy: SafeDelete<Page>,
    generations: Arc<Generations>,
    driver: Box<dyn CollectorDriver>,
    uncommit_enabled: bool,
    uncommit_delay_seconds: u64,
    epoch: Instant,
    defragment_count: AtomicUsize,
    uncommitters: Mutex<Vec<Uncommitter>>,
}

impl PageAllocator {
    /// Builds the allocator: validates settings, reserves address
    /// space, installs per-node backing pools, and (when enabled)
    /// starts the per-node uncommitters.
    pub fn new(
        settings: &HeapSettings,
        driver: Box<dyn CollectorDriver>,
    ) -> Result<Arc<PageAllocator>, &'static str> {
        settings.validate()?;

        let backend = get_backend(settings.backend.as_deref())?;
        let topology = settings.numa;

        let virtual_mgr = VirtualMemoryManager::new(backend, settings)?;
        let physical = PhysicalMemoryManager::new(backend, &topology, settings.max_capacity);

        let counters = PerNuma::from_fn(&topology, |numa_id| {
            Arc::new(CacheCounters::new(
                topology.calculate_share(numa_id, settings.max_capacity),
            ))
        });
        let states = PerNuma::from_fn(&topology, |numa_id| {
            let mut state = CacheState::new(
                numa_id,
                Arc::clone(counters.get(numa_id)),
                settings.medium_page_size,
            );
            // The mapped cache mutates reserved ranges like the range
            // lists do; placeholder backends shadow it the same way.
            state.cache.register_callbacks(backend.reservation().callbacks());
            state
        });

        info!("min capacity: {}M", settings.min_capacity / M);
        info!("initial capacity: {}M", settings.initial_capacity / M);
        info!("max capacity: {}M", settings.max_capacity / M);
        info!("soft max capacity: {}M", settings.soft_max_capacity / M);
        if settings.medium_page_size > 0 {
            info!("medium page size: {}M", settings.medium_page_size / M);
        } else {
            info!("medium page size: n/a");
        }
        info!(
            "pre-touch: {}",
            if settings.always_pretouch { "enabled" } else { "disabled" }
        );

        // Decide whether uncommit can be enabled at all.
        let uncommit_enabled = if !settings.uncommit {
            info!("uncommit: disabled");
            false
        } else if settings.max_capacity == settings.min_capacity {
            info!("uncommit: implicitly disabled (min capacity equals max capacity)");
            false
        } else if !physical.probe_uncommit_support() {
            false
        } else {
            info!("uncommit: enabled");
            info!("uncommit delay: {}s", settings.uncommit_delay.as_secs());
            true
        };

        let allocator = Arc::new(PageAllocator {
            backend,
            topology,
            virtual_mgr,
            physical,
            physical_mappings: GranuleMap::new(ADDRESS_OFFSET_MAX),
            min_capacity: settings.min_capacity,
            initial_capacity: settings.initial_capacity,
            max_capacity: settings.max_capacity,
            soft_max_capacity: settings.soft_max_capacity,
            always_pretouch: settings.always_pretouch,
            counters,
            shared: Mutex::new(AllocatorShared {
                states,
                stalled: VecDeque::new(),
            }),
            safe_destroy: SafeDelete::new(),
            generations: Arc::new(Generations::new()),
            driver,
            uncommit_enabled,
            uncommit_delay_seconds: settings.uncommit_delay.as_secs(),
            epoch: Instant::now(),
            defragment_count: AtomicUsize::new(0),
            uncommitters: Mutex::new(Vec::new()),
        });

        if uncommit_enabled {
            let mut uncommitters = allocator.uncommitters.lock().unwrap();
            for numa_id in 0..topology.count() {
                uncommitters.push(Uncommitter::spawn(
                    numa_id,
                    Arc::downgrade(&allocator),
                    settings.uncommit_delay,
                ));
            }
        }

        Ok(allocator)
    }

    pub fn generations(&self) -> &Arc<Generations> {
        &self.generations
    }

    pub fn min_capacity(&self) -> usize {
        self.min_capacity
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn soft_max_capacity(&self) -> usize {
        let current_max: usize = (0..self.topology.count())
            .map(|id| self.counters.get(id).current_max_capacity())
            .sum();
        self.soft_max_capacity.min(current_max)
    }

    pub fn current_max_capacity(&self) -> usize {
        (0..self.topology.count())
            .map(|id| self.counters.get(id).current_max_capacity())
            .sum()
    }

    pub fn capacity(&self) -> usize {
        (0..self.topology.count())
            .map(|id| self.counters.get(id).capacity())
            .sum()
    }

    pub fn used(&self) -> usize {
        (0..self.topology.count())
            .map(|id| self.counters.get(id).used())
            .sum()
    }

    pub fn used_generation(&self, id: GenerationId) -> usize {
        (0..self.topology.count())
            .map(|numa_id| self.counters.get(numa_id).used_generation(id))
            .sum()
    }

    pub fn unused(&self) -> usize {
        let mut capacity = 0isize;
        let mut used = 0isize;
        let mut claimed = 0isize;

        for numa_id in 0..self.topology.count() {
            let counters = self.counters.get(numa_id);
            capacity += counters.capacity() as isize;
            used += counters.used() as isize;
            claimed += counters.claimed() as isize;
        }

        (capacity - used - claimed).max(0) as usize
    }

    fn elapsed_seconds(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    // -- physical and virtual plumbing ------------------------------

    fn alloc_physical(&self, vmem: &VirtualRange, numa_id: u32) {
        self.physical.alloc(&self.physical_mappings, vmem, numa_id);
    }

    fn free_physical(&self, vmem: &VirtualRange, numa_id: u32) {
        self.physical.free(&self.physical_mappings, vmem, numa_id);
    }

    fn commit_physical(&self, vmem: &VirtualRange, numa_id: u32) -> usize {
        self.physical.commit(&self.physical_mappings, vmem, numa_id)
    }

    fn uncommit_physical(&self, vmem: &VirtualRange) -> usize {
        self.physical.uncommit(&self.physical_mappings, vmem)
    }

    fn map_virtual_to_physical(&self, vmem: &VirtualRange, numa_id: u32) {
        self.physical.map(&self.physical_mappings, vmem, numa_id);
    }

    fn unmap_virtual(&self, vmem: &VirtualRange) {
        self.physical.unmap(vmem);
    }

    fn sort_segments_physical(&self, vmem: &VirtualRange) {
        self.physical_mappings.sort_range(vmem);
    }

    fn count_segments_physical(&self, vmem: &VirtualRange) -> usize {
        self.physical.count_segments(&self.physical_mappings, vmem)
    }

    // -- priming ----------------------------------------------------

    /// Commits, maps and caches the initial capacity, split across the
    /// nodes.  Runs before the allocator is shared.
    pub fn prime_cache(&self, size: usize) -> Result<(), &'static str> {
        for numa_id in 0..self.topology.count() {
            let to_prime = self.topology.calculate_share(numa_id, size);
            if to_prime == 0 {
                continue;
            }
            self.prime_state_cache(numa_id, to_prime)?;
        }

        Ok(())
    }

    fn prime_state_cache(&self, numa_id: u32, to_prime: usize) -> Result<(), &'static str> {
        let vmem = self.virtual_mgr.alloc(to_prime, numa_id, true);
        if vmem.is_null() {
            return Err("out of address space while priming the heap");
        }

        {
            let mut shared = self.shared.lock().unwrap();
            let now = self.elapsed_seconds();
            let state = shared.states.get_mut(numa_id);
            let increased = state.increase_capacity(to_prime, now);
            assert_eq!(increased, to_prime, "priming must fit the initial capacity");
        }

        self.alloc_physical(&vmem, numa_id);
        if self.commit_physical(&vmem, numa_id) != vmem.size() {
            return Err("failed to commit the initial heap capacity");
        }

        self.map_virtual_to_physical(&vmem, numa_id);
        self.check_numa_placement(&vmem, numa_id);

        if self.always_pretouch {
            self.backend.pretouch(vmem.start(), vmem.size());
        }

        let mut shared = self.shared.lock().unwrap();
        shared.states.get_mut(numa_id).cache.insert(vmem);

        Ok(())
    }

    fn check_numa_placement(&self, vmem: &VirtualRange, numa_id: u32) {
        if !self.topology.is_enabled() {
            return;
        }

        if let Some(actual_id) = self.backend.memory_numa_id(vmem.start()) {
            if actual_id != numa_id {
                debug!("numa mismatch: desired {}, actual {}", numa_id, actual_id);
            }
        }
    }

    // -- claiming ---------------------------------------------------

    fn claim_physical_round_robin(
        &self,
        shared: &mut AllocatorShared,
        request: &PageAllocation,
        data: &mut AllocationData,
    ) -> bool {
        let start_node = request.initiating_numa_id;
        let numa_nodes = self.topology.count();
        let now = self.elapsed_seconds();
        let mut total_available = 0;

        for i in 0..numa_nodes {
            let current_node = (start_node + i) % numa_nodes;
            let state = shared.states.get_mut(current_node);

            if state.claim_physical(&mut data.allocation, now) {
                data.allocation.numa_id = current_node;
                return true;
            }

            // Track total availability for a potential multi-node
            // allocation.
            total_available += state.available_capacity();
        }

        if numa_nodes > 1 && total_available >= request.size {
            if !self.claim_physical_multi_numa(shared, request, data) {
                // May have partially succeeded; undo the sub-claims.
                self.free_memory_alloc_failed_multi_numa(shared, data);
                data.reset_for_retry();
                return false;
            }

            return true;
        }

        false
    }

    /// Splits the request into even per-node shares, claims each, then
    /// sweeps again for any remainder.
    fn claim_physical_multi_numa(
        &self,
        shared: &mut AllocatorShared,
        request: &PageAllocation,
        data: &mut AllocationData,
    ) -> bool {
        let start_node = request.initiating_numa_id;
        let numa_nodes = self.topology.count();
        let size = request.size;
        let mut remaining = size;
        let split_size = align_up(size / numa_nodes as usize, GRANULE_SIZE);
        let now = self.elapsed_seconds();

        data.is_multi_numa = true;

        // First pass claims up to the even share per node; the second
        // takes whatever each node still has.
        for even_pass in &[true, false] {
            for i in 0..numa_nodes {
                let current_node = (start_node + i) % numa_nodes;
                let state = shared.states.get_mut(current_node);

                let available = state.available_capacity();
                let alloc_size = if *even_pass {
                    split_size.min(available).min(remaining)
                } else {
                    available.min(remaining)
                };

                if alloc_size == 0 {
                    continue;
                }

                let mut partial = MemoryAllocation::new(alloc_size);
                if !state.claim_physical(&mut partial, now) {
                    return false;
                }

                partial.numa_id = current_node;
                data.multi_numa.push(partial);

                remaining -= alloc_size;
                if remaining == 0 {
                    return true;
                }
            }
        }

        remaining == 0
    }

    fn claim_physical_or_stall(&self, request: &Arc<PageAllocation>) -> bool {
        {
            let mut shared = self.shared.lock().unwrap();
            let mut data = request.data.lock().unwrap();

            if self.claim_physical_round_robin(&mut shared, request, &mut data) {
                return true;
            }

            if request.flags.contains(AllocationFlags::NON_BLOCKING) {
                // Don't stall.
                return false;
            }

            // Enqueue the request before dropping the lock; the next
            // free may satisfy it.
            drop(data);
            shared.stalled.push_back(Arc::clone(request));
        }

        self.alloc_page_stall(request)
    }

    fn alloc_page_stall(&self, request: &PageAllocation) -> bool {
        // Kick off an asynchronous minor collection and wait for the
        // request to be satisfied or failed.
        self.driver.collect_minor();

        request.latch.wait()
    }

    /// Serves the stall queue head-first; a head that cannot be
    /// satisfied blocks everything behind it.
    fn satisfy_stalled(&self, shared: &mut AllocatorShared) {
        loop {
            let request = match shared.stalled.front() {
                Some(request) => Arc::clone(request),
                None => return,
            };

            let mut data = request.data.lock().unwrap();
            if !self.claim_physical_round_robin(shared, &request, &mut data) {
                // Head of line cannot be satisfied; give up.
                return;
            }
            drop(data);

            // Dequeue before satisfying: the waiter may deallocate the
            // request as soon as the latch fires.
            shared.stalled.pop_front();
            request.latch.set(true);
        }
    }

    // -- virtual claim and harvest ----------------------------------

    fn is_alloc_satisfied(data: &AllocationData) -> bool {
        let mappings = &data.allocation.claimed_mappings;
        mappings.len() == 1 && mappings[0].size() == data.allocation.size
    }

    fn pop_final_mapping(data: &mut AllocationData) -> VirtualRange {
        let mappings = &mut data.allocation.claimed_mappings;
        debug_assert_eq!(mappings.len(), 1, "must contain one mapping");
        debug_assert_eq!(mappings[0].size(), data.allocation.size, "must be complete");

        mappings.pop().unwrap()
    }

    /// Unmaps the claimed cache ranges, shuffles their virtual
    /// addresses into a (hopefully contiguous) low-address cover, and
    /// restores the physical segments at the new positions.
    fn harvest_claimed_physical(&self, allocation: &mut MemoryAllocation) {
        let num_mappings_harvested = allocation.claimed_mappings.len();
        let num_granules = allocation.harvested >> crate::address::GRANULE_SIZE_SHIFT;
        let mut segments = SegmentStash::new(num_granules);

        for vmem in &allocation.claimed_mappings {
            self.unmap_virtual(vmem);
        }

        segments.stash_many(&self.physical_mappings, &allocation.claimed_mappings);

        // Attempt to claim enough contiguous virtual memory to cover
        // the entire allocation, not just the harvested part.
        let contiguous = self.virtual_mgr.shuffle_to_low_addresses_contiguous(
            allocation.size,
            allocation.numa_id,
            &mut allocation.claimed_mappings,
        );
        if !contiguous.is_null() {
            allocation.claimed_mappings.push(contiguous);
        }

        segments.pop(&self.physical_mappings, &allocation.claimed_mappings);

        if allocation.harvested > 0 {
            debug!(
                "mapped cache harvest: {}M from {} mappings",
                allocation.harvested / M,
                num_mappings_harvested
            );
        }
    }

    fn claim_virtual_memory(&self, data: &mut AllocationData) -> bool {
        if data.is_multi_numa {
            return self.claim_virtual_memory_multi_numa(data);
        }

        let allocation = &mut data.allocation;
        if allocation.harvested > 0 {
            // Claim virtual memory out of the harvested mappings,
            // possibly extended to the full allocation size.
            self.harvest_claimed_physical(allocation);
        } else {
            // Nothing harvested: the claim was a pure capacity
            // increase.  Allocate fresh virtual memory.
            let vmem = self
                .virtual_mgr
                .alloc(allocation.size, allocation.numa_id, true);
            if !vmem.is_null() {
                allocation.claimed_mappings.push(vmem);
            }
        }

        if Self::is_alloc_satisfied(data) {
            return true;
        }

        // Failed to produce a contiguous cover.  Harvested memory must
        // be remapped before it can go back to the cache.
        let allocation = &mut data.allocation;
        if allocation.harvested > 0 {
            for vmem in &allocation.claimed_mappings {
                self.map_virtual_to_physical(vmem, allocation.numa_id);
            }
        }

        false
    }

    /// Copies every sub-allocation's claimed segments to its slice of
    /// the final contiguous range.  The original mappings stay mapped
    /// until commit succeeds, so a failed commit can simply put them
    /// back.
    fn copy_claimed_physical_multi_numa(&self, data: &mut AllocationData, vmem: &VirtualRange) {
        let mut destination = vmem.start();
        let mut total_harvested = 0;

        for partial in data.multi_numa.iter_mut() {
            let mut partial_destination = destination;
            let mut harvested = 0;

            for partial_vmem in &partial.claimed_mappings {
                self.physical_mappings.copy(partial_destination, partial_vmem);
                harvested += partial_vmem.size();
                partial_destination = partial_destination.offset_by(partial_vmem.size());
            }

            total_harvested += harvested;
            partial.harvested = harvested;
            destination = destination.offset_by(partial.size);
        }

        data.allocation.harvested = total_harvested;
    }

    fn claim_virtual_memory_multi_numa(&self, data: &mut AllocationData) -> bool {
        let size = data.allocation.size;

        // Any node's inventory will do; the sub-allocations are
        // remapped into whatever contiguous range we find.
        for numa_id in 0..self.topology.count() {
            let vmem = self.virtual_mgr.alloc(size, numa_id, false);
            if !vmem.is_null() {
                self.copy_claimed_physical_multi_numa(data, &vmem);
                data.allocation.claimed_mappings.push(vmem);
                return true;
            }
        }

        // Fall back to the dedicated multi-node pool.
        if self.virtual_mgr.is_multi_node_enabled() {
            let vmem = self.virtual_mgr.remove_from_low_multi_node(size);
            if !vmem.is_null() {
                self.copy_claimed_physical_multi_numa(data, &vmem);
                data.allocation.claimed_mappings.push(vmem);
                return true;
            }
        }

        false
    }

    // -- physical tail, commit, map ---------------------------------

    fn allocate_remaining_physical(&self, data: &mut AllocationData, vmem: &VirtualRange) {
        debug_assert_eq!(data.allocation.size, vmem.size(), "vmem is the final mapping");

        if data.is_multi_numa {
            let mut remaining_vmem = *vmem;
            for partial in data.multi_numa.iter_mut() {
                let partial_vmem = remaining_vmem.split_from_front(partial.size);
                Self::allocate_remaining_physical_one(self, partial, &partial_vmem);
            }
        } else {
            Self::allocate_remaining_physical_one(self, &mut data.allocation, vmem);
        }
    }

    fn allocate_remaining_physical_one(&self, allocation: &mut MemoryAllocation, vmem: &VirtualRange) {
        let remaining_physical = allocation.size - allocation.harvested;
        if remaining_physical > 0 {
            let uncommitted_range = VirtualRange::new(
                vmem.start().offset_by(allocation.harvested),
                remaining_physical,
            );
            self.alloc_physical(&uncommitted_range, allocation.numa_id);
        }
    }

    fn commit_and_map_memory(&self, data: &mut AllocationData, vmem: &VirtualRange) -> bool {
        debug_assert_eq!(data.allocation.size, vmem.size(), "vmem is the final mapping");

        if data.is_multi_numa {
            self.commit_and_map_memory_multi_numa(data, vmem)
        } else {
            self.commit_and_map_memory_one(&mut data.allocation, vmem)
        }
    }

    fn commit_and_map_memory_one(&self, allocation: &mut MemoryAllocation, vmem: &VirtualRange) -> bool {
        // The harvested prefix is already committed; commit the tail.
        let mut to_commit = vmem.last_part(allocation.harvested);

        let committed = if to_commit.is_null() {
            0
        } else {
            self.commit_physical(&to_commit, allocation.numa_id)
        };
        allocation.committed = committed;

        if !to_commit.is_null() && committed != to_commit.size() {
            // Free the uncommitted physical and virtual tail.
            let not_committed = to_commit.split_from_back(to_commit.size() - committed);
            self.free_physical(&not_committed, allocation.numa_id);
            self.virtual_mgr.free(&not_committed);
            allocation.commit_failed = true;
        }

        let committed_size = allocation.harvested + committed;
        if committed_size == 0 {
            // Nothing usable at all: the claim was a capacity increase
            // and the commit failed outright.
            return false;
        }

        let committed_vmem = vmem.first_part(committed_size);
        self.sort_segments_physical(&committed_vmem);
        self.map_virtual_to_physical(&committed_vmem, allocation.numa_id);
        allocation.claimed_mappings.push(committed_vmem);

        self.check_numa_placement(&committed_vmem, allocation.numa_id);

        if committed_size != vmem.size() {
            trace!(
                "split memory [{:#x}, {:#x}, {:#x}]",
                vmem.start().raw(),
                committed_vmem.end().raw(),
                vmem.end().raw()
            );
            return false;
        }

        true
    }

    fn commit_and_map_memory_multi_numa(&self, data: &mut AllocationData, vmem: &VirtualRange) -> bool {
        // Commit each sub-allocation's uncommitted tail.
        let mut commit_failed = false;
        let mut total_committed = 0;

        {
            let mut remaining_vmem = *vmem;
            for partial in data.multi_numa.iter_mut() {
                let mut partial_vmem = remaining_vmem.split_from_front(partial.size);
                if commit_failed {
                    // Skip committing the rest after a failure.
                    continue;
                }

                partial_vmem.shrink_from_front(partial.harvested);
                if partial_vmem.size() == 0 {
                    continue;
                }

                let to_commit = partial_vmem.size();
                let committed = self.commit_physical(&partial_vmem, partial.numa_id);
                partial.committed = committed;
                total_committed += committed;

                if committed != to_commit {
                    commit_failed = true;
                    partial.commit_failed = true;
                }
            }
        }

        if !commit_failed {
            // Unmap and free the original mappings, then map each
            // sub-allocation's slice of the final range.
            let mut remaining_vmem = *vmem;
            for partial in data.multi_numa.iter_mut() {
                let partial_vmem = remaining_vmem.split_from_front(partial.size);

                while let Some(to_unmap) = partial.claimed_mappings.pop() {
                    self.unmap_virtual(&to_unmap);
                    self.virtual_mgr.free(&to_unmap);
                }

                self.sort_segments_physical(&partial_vmem);
                self.map_virtual_to_physical(&partial_vmem, partial.numa_id);
            }

            data.allocation.committed = total_committed;
            return true;
        }

        // A sub-allocation failed to commit.  The original mappings
        // are still mapped; additionally, remap whatever committed
        // onto each node's own address space so it is cache-ready, or
        // uncommit it when the node is out of address ranges.
        let mut remaining_vmem = *vmem;
        for partial in data.multi_numa.iter_mut() {
            let mut partial_vmem = remaining_vmem.split_from_front(partial.size);
            let committed = partial.committed;

            partial_vmem.shrink_from_front(partial.harvested);

            // Return the segments that never committed, both on the
            // failing sub-allocation and on every one skipped after
            // it, to their node's free pool.
            if partial_vmem.size() > committed {
                let never_committed = partial_vmem.split_from_back(partial_vmem.size() - committed);
                self.free_physical(&never_committed, partial.numa_id);
            }

            if committed == 0 {
                continue;
            }

            let start_index = partial.claimed_mappings.len();
            let to_map = self.virtual_mgr.alloc_low_address_many_at_most(
                committed,
                partial.numa_id,
                &mut partial.claimed_mappings,
            );

            if to_map != committed {
                // No address space for part of the committed memory;
                // uncommit it.  It is not tracked separately, so it
                // counts toward the capacity reduction below.
                let unmappable = partial_vmem.split_from_back(committed - to_map);
                self.uncommit_physical(&unmappable);
                self.free_physical(&unmappable, partial.numa_id);
                total_committed -= unmappable.size();
            }

            for i in start_index..partial.claimed_mappings.len() {
                let to_vmem = partial.claimed_mappings[i];
                let from_vmem = partial_vmem.split_from_front(to_vmem.size());

                self.physical_mappings.copy(to_vmem.start(), &from_vmem);
                self.map_virtual_to_physical(&to_vmem, partial.numa_id);
            }

            debug_assert_eq!(partial_vmem.size(), 0, "all memory accounted for");
        }

        data.allocation.committed = total_committed;

        // The final contiguous range goes back unused.
        self.virtual_mgr.free(vmem);

        false
    }

    // -- allocation entry points ------------------------------------

    fn alloc_page_inner(&self, request: &Arc<PageAllocation>) -> Option<Page> {
        loop {
            // Claim memory from the mapped cache or raise capacity.
            // Blocks unless the request is non-blocking.
            if !self.claim_physical_or_stall(request) {
                // Out of memory.
                return None;
            }

            let mut data = request.data.lock().unwrap();

            // A single contiguous claim of the right size is done.
            if Self::is_alloc_satisfied(&data) {
                let vmem = Self::pop_final_mapping(&mut data);
                return Some(Page::new(request.page_type, vmem));
            }

            // Produce a contiguous virtual range, by harvesting or by
            // allocating from the virtual manager.
            if !self.claim_virtual_memory(&mut data) {
                error!("out of address space");
                drop(data);
                self.free_memory_alloc_failed(request);
                return None;
            }

            let vmem = Self::pop_final_mapping(&mut data);

            // Fetch backing for the tail beyond the harvested prefix.
            // Capacity is already claimed, so this cannot fail.
            self.allocate_remaining_physical(&mut data, &vmem);

            if !self.commit_and_map_memory(&mut data, &vmem) {
                drop(data);
                self.free_memory_alloc_failed(request);
                continue;
            }

            return Some(Page::new(request.page_type, vmem));
        }
    }

    fn alloc_page_age_update(&self, request: &PageAllocation, page: &mut Page, age: PageAge) {
        let id = age.generation_id();
        let data = request.data.lock().unwrap();

        if data.is_multi_numa {
            for partial in &data.multi_numa {
                self.counters
                    .get(partial.numa_id)
                    .increase_used_generation(id, partial.size);
            }
        } else {
            self.counters
                .get(data.allocation.numa_id)
                .increase_used_generation(id, data.allocation.size);
        }

        // Stamp the page after any stall, so its sequence number
        // reflects collections the request already waited through.
        page.reset(age, self.generations.seqnum(id));
    }

    fn install_multi_numa_tracker(&self, request: &PageAllocation, page: &mut Page) {
        let data = request.data.lock().unwrap();
        if !data.is_multi_numa {
            return;
        }

        // Each sub-allocation maps to the final range in claim order.
        let mut vmem = page.virtual_range();
        let map = data
            .multi_numa
            .iter()
            .map(|partial| (vmem.split_from_front(partial.size), partial.numa_id))
            .collect();

        page.set_multi_numa_tracker(MultiNumaTracker::new(map));
    }

    /// Allocates a page of `size` bytes.  Blocks under memory pressure
    /// unless `NON_BLOCKING`; returns `None` on out-of-memory.
    #[requires(size > 0)]
    #[requires(is_granule_aligned(size))]
    pub fn alloc_page(
        &self,
        page_type: PageType,
        size: usize,
        flags: AllocationFlags,
        age: PageAge,
    ) -> Option<Page> {
        debug_assert!(size > 0 && is_granule_aligned(size), "invalid page size");

        let request = Arc::new(PageAllocation::new(
            page_type,
            size,
            flags,
            &self.generations,
            self.topology.current_id(),
        ));

        let mut page = self.alloc_page_inner(&request)?;

        self.alloc_page_age_update(&request, &mut page, age);
        self.install_multi_numa_tracker(&request, &mut page);

        // Mutator allocation rate excludes relocations, which would
        // inflate it artificially.
        if !flags.contains(AllocationFlags::GC_RELOCATION) {
            trace!(
                "allocated {}M page ({} segments)",
                size / M,
                self.count_segments_physical(&page.virtual_range())
            );
        }

        Some(page)
    }

    // -- failure unwinding ------------------------------------------

    fn free_memory_alloc_failed_multi_numa(&self, shared: &mut AllocatorShared, data: &mut AllocationData) {
        for partial in data.multi_numa.iter_mut() {
            self.free_memory_alloc_failed_one(shared, partial);
        }
    }

    fn free_memory_alloc_failed(&self, request: &PageAllocation) {
        let mut shared = self.shared.lock().unwrap();
        let mut data = request.data.lock().unwrap();

        if data.is_multi_numa {
            self.free_memory_alloc_failed_multi_numa(&mut shared, &mut data);
        } else {
            let allocation = &mut data.allocation;
            self.free_memory_alloc_failed_one(&mut shared, allocation);
        }

        // Reset for a potential retry.
        data.reset_for_retry();
        drop(data);

        self.satisfy_stalled(&mut shared);
    }

    /// Returns a failed claim's memory: mapped ranges go back to the
    /// cache, the unbacked remainder reverses the capacity increase.
    /// A commit failure clamps the node's max capacity for good.
    fn free_memory_alloc_failed_one(&self, shared: &mut AllocatorShared, allocation: &mut MemoryAllocation) {
        let state = shared.states.get_mut(allocation.numa_id);

        // Only overall used is decreased: generation used was never
        // bumped for a failed allocation.
        state.decrease_used(allocation.size);

        let mut freed = 0;
        for vmem in allocation.claimed_mappings.drain(..) {
            freed += vmem.size();
            state.cache.insert(vmem);
        }
        debug_assert!(
            freed == allocation.size || freed <= allocation.harvested + allocation.committed,
            "freed memory exceeds what was claimed"
        );

        let remaining = allocation.size - freed;
        if remaining > 0 {
            let set_max_capacity = allocation.commit_failed;
            state.decrease_capacity(remaining, set_max_capacity);
            if set_max_capacity {
                error!(
                    "forced to lower max heap size to {}M on node {}",
                    state.counters.current_max_capacity() / M,
                    state.numa_id
                );
            }
        }
    }

    // -- freeing ----------------------------------------------------

    pub fn safe_destroy_page(&self, page: Page) {
        self.safe_destroy.schedule_delete(page);
    }

    pub fn enable_safe_destroy(&self) {
        self.safe_destroy.enable_deferred_delete();
    }

    pub fn disable_safe_destroy(&self) {
        self.safe_destroy.disable_deferred_delete();
    }

    /// Remaps a freed range to the lowest addresses available on its
    /// node, so the address space defragments as pages churn.
    fn remap_and_defragment(&self, vmem: &VirtualRange, entries: &mut Vec<VirtualRange>) {
        let numa_id = self.virtual_mgr.get_numa_id(vmem);

        // If no lower address is available, don't remap.
        if self.virtual_mgr.lowest_available_address(numa_id) > vmem.start() {
            entries.push(*vmem);
            return;
        }

        self.defragment_count.fetch_add(1, Ordering::Relaxed);

        self.unmap_virtual(vmem);

        let mut segments = SegmentStash::new(vmem.size_in_granules());
        segments.stash_one(&self.physical_mappings, vmem);

        let num_ranges = self.virtual_mgr.shuffle_to_low_addresses(vmem, entries);

        // Only the ranges just appended belong to this shuffle.
        let new_entries = &entries[entries.len() - num_ranges..];
        segments.pop(&self.physical_mappings, new_entries);

        for new_vmem in new_entries {
            self.map_virtual_to_physical(new_vmem, numa_id);
            self.backend.pretouch(new_vmem.start(), new_vmem.size());
        }
    }

    pub fn defragment_count(&self) -> usize {
        self.defragment_count.load(Ordering::Relaxed)
    }

    fn prepare_memory_for_free(&self, page: Page, entries: &mut Vec<VirtualRange>, allow_defragment: bool) {
        let vmem = page.virtual_range();
        let page_type = page.page_type();
        self.safe_destroy_page(page);

        if page_type == PageType::Large && allow_defragment {
            self.remap_and_defragment(&vmem, entries);
        } else {
            entries.push(vmem);
        }
    }

    /// Returns a page to its node's mapped cache.  `allow_defragment`
    /// lets large pages remap to lower addresses on the way.
    pub fn free_page(&self, page: Page, allow_defragment: bool) {
        if page.is_multi_numa() {
            // Multi-node pages take the remap-home path and are
            // effectively always defragmented.
            return self.free_page_multi_numa(page);
        }

        let generation_id = page.generation_id();
        let numa_id = self.virtual_mgr.get_numa_id(&page.virtual_range());

        let mut entries = Vec::new();
        self.prepare_memory_for_free(page, &mut entries, allow_defragment);

        let mut shared = self.shared.lock().unwrap();

        let state = shared.states.get_mut(numa_id);
        for vmem in &entries {
            state.decrease_used(vmem.size());
            state.counters.decrease_used_generation(generation_id, vmem.size());
            state.cache.insert(*vmem);
        }

        self.satisfy_stalled(&mut shared);
    }

    /// Batch free under a single lock acquisition.  All pages belong
    /// to the same generation.
    pub fn free_pages(&self, pages: Vec<Page>) {
        let generation_id = match pages.first() {
            Some(page) => page.generation_id(),
            None => return,
        };

        let mut entries = Vec::new();
        for page in pages {
            debug_assert_eq!(page.generation_id(), generation_id, "one generation per batch");

            if page.is_multi_numa() {
                // Multi-node pages are handled separately.
                self.free_page_multi_numa(page);
                continue;
            }

            self.prepare_memory_for_free(page, &mut entries, true);
        }

        let mut shared = self.shared.lock().unwrap();

        for vmem in &entries {
            let numa_id = self.virtual_mgr.get_numa_id(vmem);
            let state = shared.states.get_mut(numa_id);

            state.cache.insert(*vmem);
            state.decrease_used(vmem.size());
            state.counters.decrease_used_generation(generation_id, vmem.size());
        }

        self.satisfy_stalled(&mut shared);
    }

    /// Frees a multi-node page: every sub-range is remapped back onto
    /// its origin node's own address space and reinserted into that
    /// node's cache.  Sub-ranges whose origin node has no address
    /// space left are uncommitted instead.
    pub fn free_page_multi_numa(&self, mut page: Page) {
        let vmem = page.virtual_range();
        let generation_id = page.generation_id();
        let tracker = page
            .take_multi_numa_tracker()
            .expect("only used for multi-node pages");
        self.safe_destroy_page(page);

        #[derive(Default)]
        struct PerNodeFree {
            mappings: Vec<VirtualRange>,
            mapped: usize,
            uncommitted: usize,
        }

        let numa_nodes = self.topology.count();
        let mut per_node: Vec<PerNodeFree> =
            (0..numa_nodes).map(|_| Default::default()).collect();

        for (sub_range, numa_id) in tracker.sub_ranges() {
            let mut remaining_vmem = *sub_range;
            let node_data = &mut per_node[*numa_id as usize];

            // Allocate new address ranges on the origin node.
            let start_index = node_data.mappings.len();
            let allocated = self.virtual_mgr.alloc_low_address_many_at_most(
                remaining_vmem.size(),
                *numa_id,
                &mut node_data.mappings,
            );

            // Remap onto the newly allocated ranges.
            let mut mapped = 0;
            for i in start_index..node_data.mappings.len() {
                let to_vmem = node_data.mappings[i];
                let from_vmem = remaining_vmem.split_from_front(to_vmem.size());

                self.physical_mappings.copy(to_vmem.start(), &from_vmem);
                self.unmap_virtual(&from_vmem);
                self.map_virtual_to_physical(&to_vmem, *numa_id);

                mapped += to_vmem.size();
            }
            debug_assert_eq!(allocated, mapped, "must map all allocated");

            if remaining_vmem.size() != 0 {
                // No address space for the rest: unmap, uncommit and
                // return the backing to the origin node's pool.
                self.unmap_virtual(&remaining_vmem);
                self.uncommit_physical(&remaining_vmem);
                self.free_physical(&remaining_vmem, *numa_id);
            }

            node_data.mapped += mapped;
            node_data.uncommitted += remaining_vmem.size();
        }

        // The combined range goes back to wherever it came from.
        self.virtual_mgr.free(&vmem);

        let mut shared = self.shared.lock().unwrap();

        for numa_id in 0..numa_nodes {
            let node_data = &per_node[numa_id as usize];
            let state = shared.states.get_mut(numa_id);

            state.decrease_used(node_data.mapped + node_data.uncommitted);
            state
                .counters
                .decrease_used_generation(generation_id, node_data.mapped + node_data.uncommitted);
            state.decrease_capacity(node_data.uncommitted, false);

            for mapping in &node_data.mappings {
                state.cache.insert(*mapping);
            }
        }

        self.satisfy_stalled(&mut shared);
    }

    /// Moves a promoted page's accounting from young to old.
    pub fn promote_used(&self, from: &Page, to: &Page) {
        debug_assert_eq!(from.size(), to.size(), "pages are the same size");
        let size = from.size();

        if let Some(tracker) = from.multi_numa_tracker() {
            for (sub_range, numa_id) in tracker.sub_ranges() {
                let counters = self.counters.get(*numa_id);
                counters.decrease_used_generation(GenerationId::Young, sub_range.size());
                counters.increase_used_generation(GenerationId::Old, sub_range.size());
            }
            return;
        }

        let numa_id = self.virtual_mgr.get_numa_id(&from.virtual_range());
        let counters = self.counters.get(numa_id);
        counters.decrease_used_generation(GenerationId::Young, size);
        counters.increase_used_generation(GenerationId::Old, size);
    }

    // -- stalls and collection handshakes ---------------------------

    fn has_alloc_seen_young(&self, request: &PageAllocation) -> bool {
        request.young_seqnum != self.generations.seqnum(GenerationId::Young)
    }

    fn has_alloc_seen_old(&self, request: &PageAllocation) -> bool {
        request.old_seqnum != self.generations.seqnum(GenerationId::Old)
    }

    pub fn is_alloc_stalling(&self) -> bool {
        let shared = self.shared.lock().unwrap();
        !shared.stalled.is_empty()
    }

    pub fn is_alloc_stalling_for_old(&self) -> bool {
        let shared = self.shared.lock().unwrap();

        match shared.stalled.front() {
            Some(request) => self.has_alloc_seen_young(request) && !self.has_alloc_seen_old(request),
            None => false,
        }
    }

    /// Fails every stalled request that has already waited through a
    /// complete major cycle; the caller surfaces out-of-memory.
    fn notify_out_of_memory(&self, shared: &mut AllocatorShared) {
        while let Some(request) = shared.stalled.front() {
            if !self.has_alloc_seen_old(request) {
                // Not out of memory; keep the remaining requests.
                return;
            }

            let request = shared.stalled.pop_front().unwrap();
            request.latch.set(false);
        }
    }

    /// Restarts collection on behalf of the stall queue head: a young
    /// collection if it has not seen one, otherwise a major one.
    fn restart_collection(&self, shared: &AllocatorShared) {
        let request = match shared.stalled.front() {
            Some(request) => request,
            None => return,
        };

        if !self.has_alloc_seen_young(request) {
            self.driver.collect_minor();
        } else {
            self.driver.collect_major();
        }
    }

    /// The embedder calls this after a minor collection finishes.
    pub fn handle_alloc_stalling_for_young(&self) {
        let shared = self.shared.lock().unwrap();
        self.restart_collection(&shared);
    }

    /// The embedder calls this after a major collection finishes.
    /// With soft references cleared a still-unsatisfiable head request
    /// is genuinely out of memory.
    pub fn handle_alloc_stalling_for_old(&self, cleared_soft_refs: bool) {
        let mut shared = self.shared.lock().unwrap();
        if cleared_soft_refs {
            self.notify_out_of_memory(&mut shared);
        }
        self.restart_collection(&shared);
    }

    // -- statistics -------------------------------------------------

    pub fn stats(&self, generation_id: GenerationId) -> PageAllocatorStats {
        let shared = self.shared.lock().unwrap();

        let mut stats = PageAllocatorStats {
            min_capacity: self.min_capacity,
            max_capacity: self.max_capacity,
            soft_max_capacity: self.soft_max_capacity(),
            capacity: 0,
            used: 0,
            used_high: 0,
            used_low: 0,
            used_generation: 0,
            allocation_stalls: shared.stalled.len(),
        };

        for (_, state) in shared.states.iter() {
            stats.capacity += state.counters.capacity();
            stats.used += state.counters.used();
            stats.used_high += state.collection_stats[generation_id as usize].used_high;
            stats.used_low += state.collection_stats[generation_id as usize].used_low;
            stats.used_generation += state.counters.used_generation(generation_id);
        }

        stats
    }

    pub fn reset_statistics(&self, generation_id: GenerationId) {
        let mut shared = self.shared.lock().unwrap();
        for (_, state) in shared.states.iter_mut() {
            state.reset_statistics(generation_id);
        }
    }

    // -- uncommit ---------------------------------------------------

    /// One uncommitter tick for `numa_id`: decides how much cached
    /// memory is eligible, flushes it from the cache, and returns it
    /// to the system.  `timeout` is set to the seconds the worker
    /// should sleep before the next tick.
    pub fn uncommit_tick(&self, numa_id: u32, timeout: &mut u64) -> usize {
        if !self.uncommit_enabled {
            return 0;
        }

        let delay = self.uncommit_delay_seconds as f64;
        let mut flushed_mappings: Vec<VirtualRange> = Vec::new();
        let flushed;

        {
            let mut shared = self.shared.lock().unwrap();
            let now = self.elapsed_seconds();
            let state = shared.states.get_mut(numa_id);

            let time_since_last_commit = (now - state.last_commit).floor();
            let time_since_last_uncommit = (now - state.last_uncommit).floor();

            if time_since_last_commit < delay {
                // Committed within the delay window; back off until it
                // expires.
                *timeout = (delay - time_since_last_commit) as u64;
                return 0;
            }

            // Uncommit in chunks, so demand spikes can interrupt the
            // drain: a slice of the current max, at least a granule,
            // at most a fixed share per node.
            let upper = (256 * M / self.topology.count() as usize).max(GRANULE_SIZE);
            let limit = align_up(state.counters.current_max_capacity() >> 7, GRANULE_SIZE)
                .clamp(GRANULE_SIZE, upper);

            if time_since_last_uncommit < delay {
                // Mid uncommit phase; speed up if the remaining budget
                // cannot drain in the time left.
                let num_uncommits_left = state.to_uncommit / limit;
                let time_left = delay - time_since_last_uncommit;
                if num_uncommits_left > 0 && time_left < (*timeout * num_uncommits_left as u64) as f64 {
                    *timeout = (time_left / (num_uncommits_left + 1) as f64).floor() as u64;
                }
            } else {
                // Start a new phase from the cache's low watermark.
                state.to_uncommit = state.cache.reset_min();
                state.last_uncommit = now;

                let split = state.to_uncommit / limit + 1;
                *timeout = self.uncommit_delay_seconds / split as u64;
            }

            // Never drop below what is used, nor below the node's
            // share of the minimum capacity.
            let retain = state
                .counters
                .used()
                .max(self.min_capacity / self.topology.count() as usize);
            let release = state.counters.capacity().saturating_sub(retain);
            let flush = release.min(limit).min(state.to_uncommit);

            if flush == 0 {
                return 0;
            }

            flushed = state.cache.remove_from_min(&mut flushed_mappings, flush);
            if flushed == 0 {
                return 0;
            }

            // The flushed memory leaves the cache but stays in
            // capacity until actually uncommitted; track it as claimed
            // so concurrent claims do not oversubscribe.
            state.counters.claimed.fetch_add(flushed, Ordering::Relaxed);
            state.to_uncommit -= flushed;
        }

        // Unmap and uncommit outside the lock.
        for vmem in &flushed_mappings {
            self.unmap_virtual(vmem);
            self.uncommit_physical(vmem);
            self.free_physical(vmem, numa_id);
            self.virtual_mgr.free(vmem);
        }

        {
            let mut shared = self.shared.lock().unwrap();
            let state = shared.states.get_mut(numa_id);

            state.counters.claimed.fetch_sub(flushed, Ordering::Relaxed);
            state.decrease_capacity(flushed, false);
        }

        flushed
    }

    pub fn stop_uncommitters(&self) {
        let uncommitters = self.uncommitters.lock().unwrap();
        for uncommitter in uncommitters.iter() {
            uncommitter.stop();
        }
    }

    // -- verification aids ------------------------------------------

    #[cfg(test)]
    pub(crate) fn cache_size(&self, numa_id: u32) -> usize {
        let shared = self.shared.lock().unwrap();
        shared.states.get(numa_id).cache.size()
    }

    #[cfg(test)]
    pub(crate) fn cache_ranges(&self, numa_id: u32) -> Vec<VirtualRange> {
        let shared = self.shared.lock().unwrap();
        shared.states.get(numa_id).cache.ranges()
    }

    #[cfg(test)]
    pub(crate) fn node_counters(&self, numa_id: u32) -> (usize, usize, usize, usize) {
        let counters = self.counters.get(numa_id);
        (
            counters.capacity(),
            counters.used(),
            counters.claimed(),
            counters.current_max_capacity(),
        )
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_commit(&self, numa_id: u32, seconds: f64) {
        let mut shared = self.shared.lock().unwrap();
        let state = shared.states.get_mut(numa_id);
        state.last_commit -= seconds;
        state.last_uncommit -= seconds;
    }

    #[cfg(test)]
    pub(crate) fn deferred_destroy_count(&self) -> usize {
        self.safe_destroy.deferred_count()
    }
}

impl Drop for PageAllocator {
    fn drop(&mut self) {
        self.stop_uncommitters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::register_backend;
    use crate::backend::SimBackend;
    use crate::collector::NullDriver;
    use crate::settings::HeapSettings;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn granules(count: usize) -> usize {
        count * GRANULE_SIZE
    }

    /// Registers a fresh backend under a unique name and builds an
    /// allocator on top of it.
    fn new_allocator(
        backend: SimBackend,
        driver: Box<dyn CollectorDriver>,
        configure: impl FnOnce(&mut HeapSettings),
    ) -> (Arc<PageAllocator>, &'static SimBackend) {
        static NEXT_BACKEND: AtomicU32 = AtomicU32::new(0);

        let backend: &'static SimBackend = Box::leak(Box::new(backend));
        let name = format!("sim-{}", NEXT_BACKEND.fetch_add(1, Ordering::Relaxed));
        register_backend(name.clone(), backend);

        let mut settings = HeapSettings {
            min_capacity: 0,
            initial_capacity: 0,
            soft_max_capacity: granules(128),
            max_capacity: granules(128),
            uncommit: false,
            backend: Some(name),
            ..Default::default()
        };
        configure(&mut settings);

        let allocator = PageAllocator::new(&settings, driver).expect("allocator should build");
        (allocator, backend)
    }

    fn single_node(
        configure: impl FnOnce(&mut HeapSettings),
    ) -> (Arc<PageAllocator>, &'static SimBackend) {
        new_allocator(SimBackend::new(), Box::new(NullDriver), configure)
    }

    /// Capacity must always equal used plus cached plus claimed, per
    /// node.
    fn assert_accounting(allocator: &PageAllocator, numa_id: u32) {
        let (capacity, used, claimed, current_max) = allocator.node_counters(numa_id);
        let cached = allocator.cache_size(numa_id);

        assert_eq!(capacity, used + cached + claimed, "node {} accounting", numa_id);
        assert!(used <= capacity, "used within capacity");
        assert!(capacity <= current_max, "capacity within current max");
    }

    fn wait_until(what: &str, mut predicate: impl FnMut() -> bool) {
        for _ in 0..2000 {
            if predicate() {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn warm_allocation_hits_cache() {
        let (allocator, backend) = single_node(|_| {});

        let p1 = allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();
        let p2 = allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();
        let p3 = allocator
            .alloc_page(PageType::Medium, granules(16), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();

        allocator.free_page(p1, false);
        allocator.free_page(p3, false);
        assert_eq!(allocator.cache_size(0), granules(17));
        assert_eq!(allocator.capacity(), granules(18));

        let commits_before = backend.counters().commits.load(Ordering::Relaxed);
        let maps_before = backend.counters().maps.load(Ordering::Relaxed);

        let page = allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();

        // Served entirely from the cache: no commit, no mapping churn,
        // capacity unchanged.
        assert_eq!(page.size(), granules(1));
        assert_eq!(allocator.cache_size(0), granules(16));
        assert_eq!(allocator.capacity(), granules(18));
        assert_eq!(allocator.used(), granules(2));
        assert_eq!(backend.counters().commits.load(Ordering::Relaxed), commits_before);
        assert_eq!(backend.counters().maps.load(Ordering::Relaxed), maps_before);
        assert_accounting(&allocator, 0);

        allocator.free_page(p2, false);
        allocator.free_page(page, false);
    }

    #[test]
    fn cold_allocation_raises_capacity() {
        let (allocator, backend) = single_node(|_| {});

        let page = allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();

        assert_eq!(page.virtual_range().start(), crate::address::Offset::zero());
        assert_eq!(allocator.capacity(), granules(1));
        assert_eq!(allocator.used(), granules(1));
        assert_eq!(backend.counters().commits.load(Ordering::Relaxed), 1);
        assert_eq!(
            backend.counters().committed_bytes.load(Ordering::Relaxed),
            granules(1)
        );
        assert_eq!(backend.counters().maps.load(Ordering::Relaxed), 1);
        assert_eq!(
            backend.mapping_at(page.virtual_range().start()),
            Some(BackingIndex::new(0))
        );
        assert_accounting(&allocator, 0);
    }

    #[test]
    fn harvest_combines_fragmented_cache() {
        let (allocator, backend) = single_node(|settings| {
            settings.max_capacity = granules(3);
            settings.soft_max_capacity = granules(3);
        });

        let p1 = allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();
        let p2 = allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();
        let p3 = allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();

        // Leave a live page between two cached granules so the cache
        // is fragmented.
        allocator.free_page(p1, false);
        allocator.free_page(p3, false);
        assert_eq!(allocator.cache_ranges(0).len(), 2);

        let commits_before = backend.counters().commits.load(Ordering::Relaxed);

        // No contiguous fit and no capacity headroom: both cached
        // granules are harvested and remapped into one fresh range.
        let page = allocator
            .alloc_page(PageType::Small, granules(2), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();

        assert_eq!(page.size(), granules(2));
        assert_eq!(page.virtual_range().start().raw(), granules(2) as u64);
        assert_eq!(allocator.cache_size(0), 0);
        assert_eq!(allocator.used(), granules(3));
        assert_eq!(allocator.capacity(), granules(3));
        assert_eq!(
            backend.counters().commits.load(Ordering::Relaxed),
            commits_before,
            "harvesting must not commit"
        );
        assert_eq!(backend.mapped_granules(), 3);
        assert_accounting(&allocator, 0);

        allocator.free_page(p2, false);
        allocator.free_page(page, false);
    }

    #[test]
    fn stalled_allocation_is_satisfied_by_free() {
        let (allocator, _backend) = single_node(|settings| {
            settings.max_capacity = granules(2);
            settings.soft_max_capacity = granules(2);
        });

        let p1 = allocator
            .alloc_page(PageType::Small, granules(2), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();

        let waiter = {
            let allocator = Arc::clone(&allocator);
            std::thread::spawn(move || {
                allocator.alloc_page(
                    PageType::Small,
                    granules(2),
                    AllocationFlags::empty(),
                    PageAge::EDEN,
                )
            })
        };

        wait_until("the allocation to stall", || allocator.is_alloc_stalling());

        allocator.free_page(p1, false);

        let page = waiter.join().unwrap().expect("stalled allocation must succeed");
        assert_eq!(page.size(), granules(2));
        assert!(!allocator.is_alloc_stalling());
        assert_eq!(allocator.used(), granules(2));
        assert_accounting(&allocator, 0);

        allocator.free_page(page, false);
    }

    #[test]
    fn stall_queue_is_fifo_with_head_of_line_blocking() {
        let (allocator, _backend) = single_node(|settings| {
            settings.max_capacity = granules(3);
            settings.soft_max_capacity = granules(3);
        });

        let pages: Vec<Page> = (0..3)
            .map(|_| {
                allocator
                    .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
                    .unwrap()
            })
            .collect();
        let mut pages = pages.into_iter();

        // First waiter wants two granules, second wants one.
        let first = {
            let allocator = Arc::clone(&allocator);
            std::thread::spawn(move || {
                allocator.alloc_page(
                    PageType::Small,
                    granules(2),
                    AllocationFlags::empty(),
                    PageAge::EDEN,
                )
            })
        };
        wait_until("the first waiter to stall", || {
            allocator.stats(GenerationId::Young).allocation_stalls == 1
        });

        let second = {
            let allocator = Arc::clone(&allocator);
            std::thread::spawn(move || {
                allocator.alloc_page(
                    PageType::Small,
                    granules(1),
                    AllocationFlags::empty(),
                    PageAge::EDEN,
                )
            })
        };
        wait_until("the second waiter to stall", || {
            allocator.stats(GenerationId::Young).allocation_stalls == 2
        });

        // One granule frees up: enough for the second waiter, but the
        // head of the queue needs two, so nobody advances.
        allocator.free_page(pages.next().unwrap(), false);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(allocator.stats(GenerationId::Young).allocation_stalls, 2);

        // The adjacent granule frees up: the head claims both, the
        // second waiter remains stalled.
        allocator.free_page(pages.next().unwrap(), false);
        let first_page = first.join().unwrap().expect("head must be satisfied");
        assert_eq!(first_page.size(), granules(2));
        wait_until("queue to drain to one", || {
            allocator.stats(GenerationId::Young).allocation_stalls == 1
        });

        allocator.free_page(pages.next().unwrap(), false);
        let second_page = second.join().unwrap().expect("second must be satisfied");
        assert_eq!(second_page.size(), granules(1));

        allocator.free_page(first_page, false);
        allocator.free_page(second_page, false);
        assert_accounting(&allocator, 0);
    }

    #[test]
    fn commit_failure_lowers_current_max_for_good() {
        let (allocator, backend) = single_node(|settings| {
            settings.max_capacity = granules(4);
            settings.soft_max_capacity = granules(4);
        });

        // Warm two granules so the failed allocation has a harvested
        // prefix to keep.
        let warm = allocator
            .alloc_page(PageType::Small, granules(2), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();
        allocator.free_page(warm, false);
        assert_eq!(allocator.cache_size(0), granules(2));

        backend.set_commit_budget(0);

        let page = allocator.alloc_page(
            PageType::Small,
            granules(4),
            AllocationFlags::NON_BLOCKING,
            PageAge::EDEN,
        );
        assert!(page.is_none(), "commit failure must fail the allocation");

        let (capacity, used, _claimed, current_max) = allocator.node_counters(0);
        assert_eq!(capacity, granules(2));
        assert_eq!(current_max, granules(2), "current max is clamped");
        assert_eq!(used, 0);
        assert_eq!(allocator.cache_size(0), granules(2), "harvested part survives");
        assert_eq!(backend.committed_bytes(), granules(2));
        assert_accounting(&allocator, 0);

        backend.clear_commit_budget();

        // The clamp is permanent: even with commit working again, only
        // the reduced capacity is reachable.
        let retry = allocator.alloc_page(
            PageType::Small,
            granules(4),
            AllocationFlags::NON_BLOCKING,
            PageAge::EDEN,
        );
        assert!(retry.is_none());

        let fits = allocator
            .alloc_page(PageType::Small, granules(2), AllocationFlags::NON_BLOCKING, PageAge::EDEN)
            .expect("within the clamped capacity");
        allocator.free_page(fits, false);
    }

    #[test]
    fn multi_numa_allocation_spans_nodes_and_frees_home() {
        let (allocator, backend) = new_allocator(SimBackend::new(), Box::new(NullDriver), |settings| {
            settings.numa = NumaTopology::new(2);
            settings.max_capacity = granules(4);
            settings.soft_max_capacity = granules(4);
        });

        // Each node can carry two granules; only their union fits the
        // request.
        let page = allocator
            .alloc_page(PageType::Small, granules(4), AllocationFlags::empty(), PageAge::EDEN)
            .expect("multi-node allocation must succeed");

        assert!(page.is_multi_numa());
        let tracker = page.multi_numa_tracker().unwrap();
        let mut nodes: Vec<u32> = tracker.sub_ranges().iter().map(|(_, id)| *id).collect();
        nodes.sort_unstable();
        assert_eq!(nodes, vec![0, 1]);
        for (sub_range, numa_id) in tracker.sub_ranges() {
            assert_eq!(sub_range.size(), granules(2));
            assert_eq!(backend.memory_numa_id(sub_range.start()), Some(*numa_id));
        }

        assert_eq!(allocator.used(), granules(4));
        assert_eq!(allocator.capacity(), granules(4));

        allocator.free_page(page, false);

        // Every sub-range went home: two granules cached per node.
        assert_eq!(allocator.cache_size(0), granules(2));
        assert_eq!(allocator.cache_size(1), granules(2));
        assert_eq!(allocator.used(), 0);
        assert_eq!(allocator.capacity(), granules(4));
        assert_accounting(&allocator, 0);
        assert_accounting(&allocator, 1);
    }

    #[test]
    fn alloc_free_round_trip_restores_counters() {
        let (allocator, _backend) = single_node(|settings| {
            settings.initial_capacity = granules(4);
        });
        allocator.prime_cache(granules(4)).unwrap();

        let cache_before = allocator.cache_size(0);
        let capacity_before = allocator.capacity();
        let used_before = allocator.used();

        let page = allocator
            .alloc_page(PageType::Small, granules(2), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();
        allocator.free_page(page, false);

        assert_eq!(allocator.cache_size(0), cache_before);
        assert_eq!(allocator.capacity(), capacity_before);
        assert_eq!(allocator.used(), used_before);
        assert_eq!(allocator.cache_ranges(0).len(), 1, "freed range coalesces back");
    }

    #[test]
    fn exact_cache_fit_avoids_all_churn() {
        let (allocator, backend) = single_node(|settings| {
            settings.initial_capacity = granules(2);
        });
        allocator.prime_cache(granules(2)).unwrap();

        let commits_before = backend.counters().commits.load(Ordering::Relaxed);
        let maps_before = backend.counters().maps.load(Ordering::Relaxed);
        let unmaps_before = backend.counters().unmaps.load(Ordering::Relaxed);

        let page = allocator
            .alloc_page(PageType::Small, granules(2), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();

        assert_eq!(allocator.cache_size(0), 0);
        assert_eq!(backend.counters().commits.load(Ordering::Relaxed), commits_before);
        assert_eq!(backend.counters().maps.load(Ordering::Relaxed), maps_before);
        assert_eq!(backend.counters().unmaps.load(Ordering::Relaxed), unmaps_before);

        allocator.free_page(page, false);
    }

    #[test]
    fn exhausted_capacity_fails_non_blocking_allocations() {
        let (allocator, _backend) = single_node(|settings| {
            settings.max_capacity = granules(2);
            settings.soft_max_capacity = granules(2);
        });

        let page = allocator
            .alloc_page(PageType::Small, granules(2), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();

        assert!(allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::NON_BLOCKING, PageAge::EDEN)
            .is_none());

        allocator.free_page(page, false);
    }

    #[test]
    fn batch_free_under_one_lock() {
        let (allocator, _backend) = single_node(|_| {});

        let pages: Vec<Page> = (0..3)
            .map(|_| {
                allocator
                    .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
                    .unwrap()
            })
            .collect();

        allocator.free_pages(pages);

        assert_eq!(allocator.used(), 0);
        assert_eq!(allocator.cache_ranges(0), vec![VirtualRange::new(
            crate::address::Offset::zero(),
            granules(3),
        )]);
        assert_accounting(&allocator, 0);
    }

    #[test]
    fn safe_destroy_defers_page_teardown() {
        let (allocator, _backend) = single_node(|_| {});

        let page = allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();

        allocator.enable_safe_destroy();
        allocator.free_page(page, false);

        // The accounting is updated immediately, the page object
        // lingers until the bracket closes.
        assert_eq!(allocator.used(), 0);
        assert_eq!(allocator.deferred_destroy_count(), 1);

        allocator.disable_safe_destroy();
        assert_eq!(allocator.deferred_destroy_count(), 0);
    }

    #[test]
    fn promote_used_moves_generation_accounting() {
        let (allocator, _backend) = single_node(|_| {});

        let page = allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();
        assert_eq!(allocator.used_generation(GenerationId::Young), granules(1));
        assert_eq!(allocator.used_generation(GenerationId::Old), 0);

        allocator.promote_used(&page, &page);

        assert_eq!(allocator.used_generation(GenerationId::Young), 0);
        assert_eq!(allocator.used_generation(GenerationId::Old), granules(1));
    }

    #[test]
    fn old_pages_account_to_the_old_generation() {
        let (allocator, _backend) = single_node(|_| {});

        let page = allocator
            .alloc_page(
                PageType::Small,
                granules(1),
                AllocationFlags::GC_RELOCATION,
                PageAge::OLD,
            )
            .unwrap();

        assert_eq!(page.generation_id(), GenerationId::Old);
        assert_eq!(allocator.used_generation(GenerationId::Old), granules(1));

        allocator.free_page(page, false);
        assert_eq!(allocator.used_generation(GenerationId::Old), 0);
    }

    struct CountingDriver {
        minor: Arc<AtomicUsize>,
        major: Arc<AtomicUsize>,
    }

    impl CollectorDriver for CountingDriver {
        fn collect_minor(&self) {
            self.minor.fetch_add(1, Ordering::Relaxed);
        }

        fn collect_major(&self) {
            self.major.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn stall_escalates_from_minor_to_major_collection() {
        let minor = Arc::new(AtomicUsize::new(0));
        let major = Arc::new(AtomicUsize::new(0));
        let driver = Box::new(CountingDriver {
            minor: Arc::clone(&minor),
            major: Arc::clone(&major),
        });

        let (allocator, _backend) = new_allocator(SimBackend::new(), driver, |settings| {
            settings.max_capacity = granules(1);
            settings.soft_max_capacity = granules(1);
        });

        // The request can never fit; it parks on the stall queue.
        let waiter = {
            let allocator = Arc::clone(&allocator);
            std::thread::spawn(move || {
                allocator.alloc_page(
                    PageType::Small,
                    granules(2),
                    AllocationFlags::empty(),
                    PageAge::EDEN,
                )
            })
        };
        wait_until("the waiter to stall", || allocator.is_alloc_stalling());
        assert_eq!(minor.load(Ordering::Relaxed), 1, "stalling starts a minor collection");
        assert!(!allocator.is_alloc_stalling_for_old());

        // A minor collection came and went without helping: restart as
        // minor once more only if the request never saw one.
        allocator.generations().advance(GenerationId::Young);
        allocator.handle_alloc_stalling_for_young();
        assert_eq!(major.load(Ordering::Relaxed), 1, "a seen minor escalates to major");
        assert!(allocator.is_alloc_stalling_for_old());

        // A full major cycle with cleared soft references that still
        // cannot satisfy the head means out of memory.
        allocator.generations().advance(GenerationId::Old);
        allocator.handle_alloc_stalling_for_old(true);

        assert!(waiter.join().unwrap().is_none(), "the stalled request fails with OOM");
        assert!(!allocator.is_alloc_stalling());
    }

    #[test]
    fn uncommit_waits_out_the_delay_window() {
        let (allocator, _backend) = single_node(|settings| {
            settings.uncommit = true;
            settings.uncommit_delay = Duration::from_secs(1000);
            settings.min_capacity = 0;
            settings.initial_capacity = granules(4);
        });
        allocator.prime_cache(granules(4)).unwrap();

        let mut timeout = 1000;
        assert_eq!(allocator.uncommit_tick(0, &mut timeout), 0);
        assert!(timeout > 0 && timeout <= 1000, "tick backs off into the delay");
        assert_eq!(allocator.capacity(), granules(4));
    }

    #[test]
    fn uncommit_drains_idle_cache_in_chunks() {
        let (allocator, backend) = single_node(|settings| {
            settings.uncommit = true;
            settings.uncommit_delay = Duration::from_secs(1000);
            settings.min_capacity = 0;
            settings.initial_capacity = granules(4);
        });
        allocator.prime_cache(granules(4)).unwrap();
        let committed_after_prime = backend.committed_bytes();

        // The first eligible tick only arms the watermark: nothing has
        // sat idle for a full window yet.
        let mut timeout = 1000;
        allocator.backdate_last_commit(0, 2000.0);
        assert_eq!(allocator.uncommit_tick(0, &mut timeout), 0);

        // From then on each tick drains one chunk.
        let mut total_uncommitted = 0;
        for _ in 0..8 {
            allocator.backdate_last_commit(0, 2000.0);
            total_uncommitted += allocator.uncommit_tick(0, &mut timeout);
            assert_accounting(&allocator, 0);
        }

        assert_eq!(total_uncommitted, granules(4));
        assert_eq!(allocator.capacity(), 0);
        assert_eq!(allocator.cache_size(0), 0);
        assert_eq!(
            backend.committed_bytes(),
            committed_after_prime - granules(4)
        );
    }

    #[test]
    fn uncommit_retains_the_minimum_capacity() {
        let (allocator, _backend) = single_node(|settings| {
            settings.uncommit = true;
            settings.uncommit_delay = Duration::from_secs(1000);
            settings.min_capacity = granules(2);
            settings.initial_capacity = granules(4);
        });
        allocator.prime_cache(granules(4)).unwrap();

        let mut timeout = 1000;
        allocator.backdate_last_commit(0, 2000.0);
        allocator.uncommit_tick(0, &mut timeout);

        for _ in 0..8 {
            allocator.backdate_last_commit(0, 2000.0);
            allocator.uncommit_tick(0, &mut timeout);
        }

        assert_eq!(allocator.capacity(), granules(2), "min capacity is retained");
        assert_eq!(allocator.cache_size(0), granules(2));
    }

    #[test]
    fn uncommitted_memory_can_be_reallocated() {
        let (allocator, _backend) = single_node(|settings| {
            settings.uncommit = true;
            settings.uncommit_delay = Duration::from_secs(1000);
            settings.min_capacity = 0;
            settings.initial_capacity = granules(2);
        });
        allocator.prime_cache(granules(2)).unwrap();

        let mut timeout = 1000;
        allocator.backdate_last_commit(0, 2000.0);
        allocator.uncommit_tick(0, &mut timeout);
        for _ in 0..4 {
            allocator.backdate_last_commit(0, 2000.0);
            allocator.uncommit_tick(0, &mut timeout);
        }
        assert_eq!(allocator.capacity(), 0);

        // The capacity comes back on demand.
        let page = allocator
            .alloc_page(PageType::Small, granules(2), AllocationFlags::empty(), PageAge::EDEN)
            .expect("capacity must be reusable after uncommit");
        assert_eq!(allocator.capacity(), granules(2));
        assert_accounting(&allocator, 0);

        allocator.free_page(page, false);
    }

    #[test]
    fn large_page_free_defragments_to_lower_addresses() {
        let (allocator, backend) = single_node(|settings| {
            settings.uncommit = true;
            settings.uncommit_delay = Duration::from_secs(1000);
            settings.min_capacity = 0;
        });

        let small = allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();
        let large = allocator
            .alloc_page(PageType::Large, granules(2), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();
        assert_eq!(large.virtual_range().start().raw(), granules(1) as u64);

        // Return the low granule all the way to the address-range
        // inventory, leaving a hole below the large page.
        allocator.free_page(small, false);
        let mut timeout = 1000;
        allocator.backdate_last_commit(0, 2000.0);
        allocator.uncommit_tick(0, &mut timeout);
        allocator.backdate_last_commit(0, 2000.0);
        allocator.uncommit_tick(0, &mut timeout);
        assert_eq!(allocator.cache_size(0), 0);

        let large_range = large.virtual_range();
        allocator.free_page(large, true);

        assert_eq!(allocator.defragment_count(), 1);
        let cached = allocator.cache_ranges(0);
        assert_eq!(cached.len(), 1);
        assert!(
            cached[0].start() < large_range.start(),
            "the freed range moved to a lower address"
        );
        assert_eq!(backend.mapping_at(cached[0].start()).is_some(), true);
        assert_accounting(&allocator, 0);
    }

    #[test]
    fn placeholders_track_every_transition() {
        let (allocator, backend) = new_allocator(
            SimBackend::with_placeholders(),
            Box::new(NullDriver),
            |_| {},
        );
        let space = backend.placeholder_space().unwrap();

        let page = allocator
            .alloc_page(PageType::Small, granules(2), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();

        // A live page is covered by one placeholder per granule.
        let range = page.virtual_range();
        assert!(space.is_granule_covered(range.start(), range.size()));

        allocator.free_page(page, false);

        // Cached ranges coalesce back into a single placeholder.
        let cached = allocator.cache_ranges(0);
        assert_eq!(cached.len(), 1);
        assert!(space.is_single(cached[0].start(), cached[0].size()));

        // And a warm allocation splits it apart again.
        let again = allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();
        let range = again.virtual_range();
        assert!(space.is_granule_covered(range.start(), range.size()));

        allocator.free_page(again, false);
    }

    #[test]
    fn gc_relocation_allocations_may_stall_too() {
        let (allocator, _backend) = single_node(|settings| {
            settings.max_capacity = granules(1);
            settings.soft_max_capacity = granules(1);
        });

        let held = allocator
            .alloc_page(PageType::Small, granules(1), AllocationFlags::empty(), PageAge::EDEN)
            .unwrap();

        let waiter = {
            let allocator = Arc::clone(&allocator);
            std::thread::spawn(move || {
                allocator.alloc_page(
                    PageType::Small,
                    granules(1),
                    AllocationFlags::GC_RELOCATION,
                    PageAge::OLD,
                )
            })
        };
        wait_until("the relocation to stall", || allocator.is_alloc_stalling());

        allocator.free_page(held, false);
        let page = waiter.join().unwrap().expect("relocation must be satisfied");

        assert_eq!(page.generation_id(), GenerationId::Old);
        allocator.free_page(page, false);
    }
}
