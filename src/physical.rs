//! The physical backing manager owns the pool of backing segment
//! indices per NUMA node and drives the backend's commit, uncommit,
//! map and unmap primitives over consecutive-index runs.
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

use log::info;

use crate::address::is_granule_aligned;
use crate::address::Backing;
use crate::address::BackingIndex;
use crate::address::TypedOffset;
use crate::address::GRANULE_SIZE;
use crate::address::GRANULE_SIZE_SHIFT;
use crate::backend::MemoryBackend;
use crate::granule_map::GranuleMap;
use crate::numa::NumaTopology;
use crate::numa::PerNuma;
use crate::range::BackingRange;
use crate::range::VirtualRange;
use crate::range_list::RangeList;

/// Applies `f` to every run of consecutive segment indices in
/// `indices`, passing the run's first index and its byte size.  Stops
/// early when `f` returns false; returns whether the walk completed.
fn for_each_segment_run(
    indices: &[BackingIndex],
    mut f: impl FnMut(BackingIndex, usize) -> bool,
) -> bool {
    let mut i = 0;
    while i < indices.len() {
        let start_i = i;

        // Find the last index of the consecutive run starting here.
        while i + 1 < indices.len() && indices[i].offset_by(1) == indices[i + 1] {
            i += 1;
        }

        let num_indices = i - start_i + 1;
        if !f(indices[start_i], num_indices << GRANULE_SIZE_SHIFT) {
            return false;
        }

        i += 1;
    }

    true
}

pub struct PhysicalMemoryManager {
    managers: PerNuma<RangeList<Backing>>,
    backend: &'static dyn MemoryBackend,
    numa_enabled: bool,
}

impl PhysicalMemoryManager {
    pub fn new(
        backend: &'static dyn MemoryBackend,
        topology: &NumaTopology,
        max_capacity: usize,
    ) -> Self {
        assert!(is_granule_aligned(max_capacity), "must be granule aligned");

        let managers = PerNuma::from_fn(topology, |_| RangeList::new());
        let manager = PhysicalMemoryManager {
            managers,
            backend,
            numa_enabled: topology.is_enabled(),
        };

        // Install capacity into the per-node pools: consecutive slabs
        // of segment indices, one slab per node.
        let mut next_index = 0u32;
        topology.divide_resource(max_capacity, |numa_id, capacity| {
            assert!(is_granule_aligned(capacity), "must be granule aligned");
            let num_segments = capacity >> GRANULE_SIZE_SHIFT;
            if num_segments == 0 {
                return;
            }

            manager
                .managers
                .get(numa_id)
                .register(BackingRange::new(BackingIndex::new(next_index), num_segments));
            next_index += num_segments as u32;
        });

        assert_eq!(
            (next_index as usize) << GRANULE_SIZE_SHIFT,
            max_capacity,
            "must insert all capacity"
        );

        manager
    }

    /// Probes whether the backend supports uncommit by committing and
    /// uncommitting a single granule of the probe segment.
    pub fn probe_uncommit_support(&self) -> bool {
        let probe = BackingIndex::new(0);

        if self.backend.commit(probe, GRANULE_SIZE, 0) != GRANULE_SIZE {
            return false;
        }

        if self.backend.uncommit(probe, GRANULE_SIZE) != GRANULE_SIZE {
            info!("uncommit: implicitly disabled (not supported by the memory backend)");
            return false;
        }

        true
    }

    /// Fills the granule map slots covering `vmem` with backing
    /// segment indices drawn low-first from `numa_id`'s pool.  The
    /// caller guarantees the pool holds enough free segments.
    #[requires(is_granule_aligned(vmem.size()))]
    pub fn alloc(&self, map: &GranuleMap, vmem: &VirtualRange, numa_id: u32) {
        let pool = self.managers.get(numa_id);

        let mut current_segment = 0;
        let mut remaining_segments = vmem.size_in_granules();

        while remaining_segments != 0 {
            // Allocate a run of backing segment indices.
            let run = pool.remove_from_low_at_most(remaining_segments);
            assert!(!run.is_null(), "backing allocation should never fail");

            // Insert the run's indices into the granule map.
            let indices: Vec<BackingIndex> =
                (0..run.size()).map(|i| run.start().offset_by(i)).collect();
            map.write(
                vmem.start().offset_by(current_segment << GRANULE_SIZE_SHIFT),
                &indices,
            );

            remaining_segments -= run.size();
            current_segment += run.size();
        }
    }

    /// Returns the segments mapped under `vmem` to `numa_id`'s pool.
    pub fn free(&self, map: &GranuleMap, vmem: &VirtualRange, numa_id: u32) {
        let pool = self.managers.get(numa_id);

        for_each_segment_run(&map.read(vmem), |index, size| {
            pool.insert(BackingRange::new(index, size >> GRANULE_SIZE_SHIFT));
            true
        });
    }

    /// Commits the backing under `vmem`, run by run; returns the bytes
    /// actually committed.  A short return is a commit failure and the
    /// caller owns the uncommitted tail.
    pub fn commit(&self, map: &GranuleMap, vmem: &VirtualRange, numa_id: u32) -> usize {
        let mut total_committed = 0;

        for_each_segment_run(&map.read(vmem), |index, size| {
            let committed = self.backend.commit(index, size, numa_id);
            total_committed += committed;
            committed == size
        });

        total_committed
    }

    /// Uncommits the backing under `vmem`; returns the bytes
    /// uncommitted.
    pub fn uncommit(&self, map: &GranuleMap, vmem: &VirtualRange) -> usize {
        let mut total_uncommitted = 0;

        for_each_segment_run(&map.read(vmem), |index, size| {
            let uncommitted = self.backend.uncommit(index, size);
            total_uncommitted += uncommitted;
            uncommitted == size
        });

        total_uncommitted
    }

    /// Installs mappings from each granule of `vmem` to the segment
    /// the granule map names for it.
    pub fn map(&self, map: &GranuleMap, vmem: &VirtualRange, numa_id: u32) {
        let mut mapped = 0;

        for_each_segment_run(&map.read(vmem), |index, size| {
            self.backend
                .map(vmem.start().offset_by(mapped), index, size);
            mapped += size;
            true
        });
        debug_assert_eq!(mapped, vmem.size());

        // Pin the NUMA preference while the mapping is fresh.
        if self.numa_enabled {
            self.backend.numa_make_local(vmem.start(), vmem.size(), numa_id);
        }
    }

    /// Tears down the mappings covering `vmem`.
    pub fn unmap(&self, vmem: &VirtualRange) {
        self.backend.unmap(vmem.start(), vmem.size());
    }

    /// Number of consecutive-index runs currently under `vmem`.
    pub fn count_segments(&self, map: &GranuleMap, vmem: &VirtualRange) -> usize {
        let mut count = 0;
        for_each_segment_run(&map.read(vmem), |_, _| {
            count += 1;
            true
        });
        count
    }

    /// Free segments remaining in `numa_id`'s pool, in bytes.  Test
    /// and verification aid.
    pub fn free_segments(&self, numa_id: u32) -> usize {
        self.managers
            .get(numa_id)
            .ranges()
            .iter()
            .map(|range| range.size() << GRANULE_SIZE_SHIFT)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Offset;
    use crate::address::ADDRESS_OFFSET_MAX;
    use crate::backend::SimBackend;

    fn leak(backend: SimBackend) -> &'static SimBackend {
        Box::leak(Box::new(backend))
    }

    fn vrange(start_granules: usize, granules: usize) -> VirtualRange {
        VirtualRange::new(
            Offset::new((start_granules * GRANULE_SIZE) as u64),
            granules * GRANULE_SIZE,
        )
    }

    fn index(raw: u32) -> BackingIndex {
        BackingIndex::new(raw)
    }

    #[test]
    fn segment_runs_group_consecutive_indices() {
        let indices = [index(0), index(1), index(5), index(7), index(8)];
        let mut runs = Vec::new();

        for_each_segment_run(&indices, |start, size| {
            runs.push((start, size >> GRANULE_SIZE_SHIFT));
            true
        });

        assert_eq!(runs, vec![(index(0), 2), (index(5), 1), (index(7), 2)]);
    }

    #[test]
    fn alloc_draws_low_indices_first() {
        let backend = leak(SimBackend::new());
        let topology = NumaTopology::disabled();
        let physical = PhysicalMemoryManager::new(backend, &topology, 8 * GRANULE_SIZE);
        let map = GranuleMap::new(ADDRESS_OFFSET_MAX);

        let vmem = vrange(0, 3);
        physical.alloc(&map, &vmem, 0);

        assert_eq!(map.read(&vmem), vec![index(0), index(1), index(2)]);
        assert_eq!(physical.free_segments(0), 5 * GRANULE_SIZE);
    }

    #[test]
    fn free_coalesces_back_into_the_pool() {
        let backend = leak(SimBackend::new());
        let topology = NumaTopology::disabled();
        let physical = PhysicalMemoryManager::new(backend, &topology, 8 * GRANULE_SIZE);
        let map = GranuleMap::new(ADDRESS_OFFSET_MAX);

        let vmem = vrange(0, 4);
        physical.alloc(&map, &vmem, 0);
        physical.free(&map, &vmem, 0);

        assert_eq!(physical.free_segments(0), 8 * GRANULE_SIZE);
    }

    #[test]
    fn commit_reports_partial_success() {
        let backend = leak(SimBackend::new());
        let topology = NumaTopology::disabled();
        let physical = PhysicalMemoryManager::new(backend, &topology, 8 * GRANULE_SIZE);
        let map = GranuleMap::new(ADDRESS_OFFSET_MAX);

        let vmem = vrange(0, 4);
        physical.alloc(&map, &vmem, 0);

        backend.set_commit_budget(2 * GRANULE_SIZE);
        assert_eq!(physical.commit(&map, &vmem, 0), 2 * GRANULE_SIZE);
        backend.clear_commit_budget();
    }

    #[test]
    fn map_then_unmap_round_trips() {
        let backend = leak(SimBackend::new());
        let topology = NumaTopology::disabled();
        let physical = PhysicalMemoryManager::new(backend, &topology, 8 * GRANULE_SIZE);
        let map = GranuleMap::new(ADDRESS_OFFSET_MAX);

        let vmem = vrange(2, 3);
        physical.alloc(&map, &vmem, 0);
        assert_eq!(physical.commit(&map, &vmem, 0), vmem.size());

        physical.map(&map, &vmem, 0);
        assert_eq!(backend.mapped_granules(), 3);
        assert_eq!(physical.count_segments(&map, &vmem), 1);

        physical.unmap(&vmem);
        assert_eq!(backend.mapped_granules(), 0);
        assert_eq!(physical.uncommit(&map, &vmem), vmem.size());
    }

    #[test]
    fn per_node_pools_are_disjoint() {
        let backend = leak(SimBackend::new());
        let topology = NumaTopology::new(2);
        let physical = PhysicalMemoryManager::new(backend, &topology, 8 * GRANULE_SIZE);
        let map = GranuleMap::new(ADDRESS_OFFSET_MAX);

        let on_node_0 = vrange(0, 2);
        let on_node_1 = vrange(8, 2);
        physical.alloc(&map, &on_node_0, 0);
        physical.alloc(&map, &on_node_1, 1);

        // Node 1's segments start beyond node 0's slab.
        assert_eq!(map.read(&on_node_0), vec![index(0), index(1)]);
        assert_eq!(map.read(&on_node_1), vec![index(4), index(5)]);
    }
}
