//! The virtual memory manager owns the heap's address-range inventory:
//! a reserved span carved into per-NUMA-node free lists, plus a
//! multi-node pool used when an allocation has to straddle nodes.
use log::error;
use log::info;

use crate::address::align_down;
use crate::address::align_up;
use crate::address::Offset;
use crate::address::Virtual;
use crate::address::ADDRESS_OFFSET_MAX;
use crate::address::GRANULE_SIZE;
use crate::address::M;
use crate::backend::MemoryBackend;
use crate::numa::NumaTopology;
use crate::numa::PerNuma;
use crate::range::VirtualRange;
use crate::range_list::RangeList;
use crate::settings::HeapSettings;

/// Spread contiguous reservation attempts over at most this many
/// placements.
const MAX_CONTIGUOUS_ATTEMPTS: u64 = 8192;

/// Acquires address space from the backend and hands it out to the
/// per-node lists.  Lives only during manager construction.
pub struct VirtualMemoryReserver {
    reservation: RangeList<Virtual>,
    backend: &'static dyn MemoryBackend,
    max_virtual_reservations: usize,
    reserved: usize,
}

impl VirtualMemoryReserver {
    pub fn new(
        backend: &'static dyn MemoryBackend,
        size: usize,
        max_virtual_reservations: usize,
    ) -> Self {
        let mut reservation = RangeList::new();
        reservation.register_callbacks(backend.reservation().callbacks());

        let mut reserver = VirtualMemoryReserver {
            reservation,
            backend,
            max_virtual_reservations,
            reserved: 0,
        };
        reserver.reserved = reserver.reserve(size);
        reserver
    }

    pub fn reserved(&self) -> usize {
        self.reserved
    }

    pub fn is_empty(&self) -> bool {
        self.reservation.is_empty()
    }

    pub fn is_contiguous(&self) -> bool {
        self.reservation.is_contiguous()
    }

    /// Unreserves everything still held by the reserver.
    pub fn unreserve_all(&mut self) {
        while let Some(vmem) = self.reservation.unregister_first() {
            self.backend.unreserve(vmem.start(), vmem.size());
        }
    }

    /// Moves `size` bytes from the low end of the reservation into
    /// `node`, then freezes the node's limits.
    pub fn initialize_node(&mut self, node: &mut RangeList<Virtual>, size: usize) {
        assert!(node.is_empty(), "should be empty when initializing");

        node.register_callbacks(self.backend.reservation().callbacks());

        self.reservation.transfer_from_low(node, size);

        // The limits are the virtual memory given to this node.
        node.anchor_limits();
    }

    fn reserve_contiguous_at(&mut self, start: Offset, size: usize) -> bool {
        debug_assert!(size % GRANULE_SIZE == 0, "misaligned");

        if !self.backend.reserve(start, size) {
            return false;
        }

        self.reservation.register(VirtualRange::new(start, size));
        true
    }

    fn reserve_contiguous(&mut self, size: usize) -> bool {
        // Allow at most MAX_CONTIGUOUS_ATTEMPTS attempts spread evenly
        // across [0, ADDRESS_OFFSET_MAX).
        let unused = ADDRESS_OFFSET_MAX - size as u64;
        let increment = (align_up(
            (unused / MAX_CONTIGUOUS_ATTEMPTS) as usize,
            GRANULE_SIZE,
        ))
        .max(GRANULE_SIZE) as u64;

        let mut start = 0u64;
        while start + size as u64 <= ADDRESS_OFFSET_MAX {
            if self.reserve_contiguous_at(Offset::new(start), size) {
                return true;
            }

            start += increment;
        }

        false
    }

    fn calculate_min_range(&self, size: usize) -> usize {
        // Don't try to reserve address ranges smaller than a fraction
        // of the requested size.  This avoids an explosion of
        // reservation attempts when large parts of the address space
        // are already occupied.
        align_up(size / self.max_virtual_reservations, GRANULE_SIZE)
    }

    fn reserve_discontiguous_range(&mut self, start: u64, size: usize, min_range: usize) -> usize {
        if size < min_range {
            // Too small.
            return 0;
        }

        debug_assert!(size % GRANULE_SIZE == 0, "misaligned");

        if self.reserve_contiguous_at(Offset::new(start), size) {
            return size;
        }

        let half = size / 2;
        if half < min_range {
            // Too small.
            return 0;
        }

        // Divide and conquer.
        let first_part = align_down(half, GRANULE_SIZE);
        let second_part = size - first_part;
        let first_size = self.reserve_discontiguous_range(start, first_part, min_range);
        let second_size =
            self.reserve_discontiguous_range(start + first_part as u64, second_part, min_range);
        first_size + second_size
    }

    fn reserve_discontiguous(&mut self, size: usize) -> usize {
        let min_range = self.calculate_min_range(size);
        let mut start = 0u64;
        let mut reserved = 0;

        // Reserve size somewhere between [0, ADDRESS_OFFSET_MAX).
        while reserved < size && start < ADDRESS_OFFSET_MAX {
            let remaining = (size - reserved).min((ADDRESS_OFFSET_MAX - start) as usize);
            reserved += self.reserve_discontiguous_range(start, remaining, min_range);
            start += remaining as u64;
        }

        reserved
    }

    fn reserve(&mut self, size: usize) -> usize {
        // Prefer a contiguous address space.
        if self.reserve_contiguous(size) {
            return size;
        }

        // Fall back to a discontiguous address space.
        self.reserve_discontiguous(size)
    }
}

pub struct VirtualMemoryManager {
    nodes: PerNuma<RangeList<Virtual>>,
    multi_node: RangeList<Virtual>,
    topology: NumaTopology,
}

impl VirtualMemoryManager {
    pub fn new(
        backend: &'static dyn MemoryBackend,
        settings: &HeapSettings,
    ) -> Result<Self, &'static str> {
        let topology = settings.numa;
        let max_capacity = settings.max_capacity;

        assert!(
            max_capacity as u64 <= ADDRESS_OFFSET_MAX,
            "too large max_capacity"
        );

        let limit = ADDRESS_OFFSET_MAX as usize;
        let desired_for_nodes = max_capacity.saturating_mul(settings.virtual_to_physical_ratio);
        let desired_for_multi_node = if topology.count() > 1 { max_capacity } else { 0 };

        let desired = desired_for_nodes + desired_for_multi_node;
        let requested = if desired <= limit {
            desired
        } else {
            desired_for_nodes.min(limit)
        };

        // Reserve virtual memory for the heap.
        let mut reserver =
            VirtualMemoryReserver::new(backend, requested, settings.max_virtual_reservations);

        let reserved = reserver.reserved();
        let is_contiguous = reserver.is_contiguous();

        if reserved < max_capacity {
            error!(
                "failed to reserve {}M of address space for the heap",
                max_capacity / M
            );
            reserver.unreserve_all();
            return Err("failed to reserve address space for the heap");
        }

        let size_for_nodes = reserved.min(desired_for_nodes);

        // Divide the reservation over the NUMA nodes.  If the capacity
        // consists of fewer granules than there are nodes, the surplus
        // nodes stay empty.
        let first_empty_numa_id =
            (topology.count()).min((size_for_nodes / GRANULE_SIZE) as u32);

        let mut nodes = PerNuma::from_fn(&topology, |_| RangeList::new());
        for numa_id in 0..topology.count() {
            if numa_id == first_empty_numa_id {
                break;
            }

            let reserved_for_node = topology.calculate_share(numa_id, size_for_nodes);
            reserver.initialize_node(nodes.get_mut(numa_id), reserved_for_node);
        }

        let mut multi_node = RangeList::new();
        if desired_for_multi_node > 0 && reserved == desired {
            // Enough left to set up the multi-node pool.
            reserver.initialize_node(&mut multi_node, max_capacity);
        } else {
            // Not enough for the multi-node pool; unreserve the surplus.
            reserver.unreserve_all();
        }

        assert!(reserver.is_empty(), "must have handled all reserved memory");

        info!(
            "address space type: {}/{}/{}",
            if is_contiguous { "contiguous" } else { "discontiguous" },
            if (limit as u64) == ADDRESS_OFFSET_MAX { "unrestricted" } else { "restricted" },
            if reserved >= desired_for_nodes { "complete" } else { "degraded" }
        );
        info!("address space size: {}M", reserved / M);

        Ok(VirtualMemoryManager {
            nodes,
            multi_node,
            topology,
        })
    }

    pub fn is_multi_node_enabled(&self) -> bool {
        !self.multi_node.is_empty()
    }

    pub fn is_in_multi_node(&self, vmem: &VirtualRange) -> bool {
        self.multi_node.limits_contain(vmem)
    }

    /// The node whose limits contain `vmem`.  A range that belongs to
    /// no node is a bug.
    pub fn get_numa_id(&self, vmem: &VirtualRange) -> u32 {
        for (numa_id, node) in self.nodes.iter() {
            if node.limits_contain(vmem) {
                return numa_id;
            }
        }

        unreachable!("virtual range outside every node: {:?}", vmem);
    }

    pub fn lowest_available_address(&self, numa_id: u32) -> Offset {
        self.nodes.get(numa_id).peek_low_address()
    }

    /// A single range of exactly `size`, from `numa_id`'s inventory.
    /// `force_low_address` takes the low end; otherwise the high end
    /// is used, which keeps large one-off allocations out of the way
    /// of the small-allocation churn.
    pub fn alloc(&self, size: usize, numa_id: u32, force_low_address: bool) -> VirtualRange {
        let node = self.nodes.get(numa_id);

        if force_low_address {
            node.remove_from_low(size)
        } else {
            node.remove_from_high(size)
        }
    }

    /// Drains up to `size` bytes of low-address ranges into `out`.
    pub fn alloc_low_address_many_at_most(
        &self,
        size: usize,
        numa_id: u32,
        out: &mut Vec<VirtualRange>,
    ) -> usize {
        self.nodes.get(numa_id).remove_from_low_many_at_most(size, out)
    }

    /// Returns `vmem` to its owning inventory.
    pub fn free(&self, vmem: &VirtualRange) {
        if self.is_in_multi_node(vmem) {
            self.multi_node.insert(*vmem);
        } else {
            self.free_on(vmem, self.get_numa_id(vmem));
        }
    }

    pub fn free_on(&self, vmem: &VirtualRange, numa_id: u32) {
        debug_assert_eq!(numa_id, self.get_numa_id(vmem), "wrong node for vmem");
        self.nodes.get(numa_id).insert(*vmem);
    }

    pub fn insert_multi_node(&self, vmem: &VirtualRange) {
        self.multi_node.insert(*vmem);
    }

    pub fn remove_from_low_multi_node(&self, size: usize) -> VirtualRange {
        self.multi_node.remove_from_low(size)
    }

    /// Reinserts `vmem` and re-extracts the same total from the low
    /// end of its node, for defragmentation.  Returns the number of
    /// ranges appended to `out`.
    pub fn shuffle_to_low_addresses(&self, vmem: &VirtualRange, out: &mut Vec<VirtualRange>) -> usize {
        let node = self.nodes.get(self.get_numa_id(vmem));

        let before = out.len();
        node.insert_and_remove_from_low_many(*vmem, out);
        out.len() - before
    }

    /// Reinserts the ranges in `in_out` and extracts either one
    /// contiguous range of `size` (returned) or an equivalent
    /// multi-range cover of the inserted total (left in `in_out`).
    pub fn shuffle_to_low_addresses_contiguous(
        &self,
        size: usize,
        numa_id: u32,
        in_out: &mut Vec<VirtualRange>,
    ) -> VirtualRange {
        self.nodes
            .get(numa_id)
            .insert_and_remove_from_low_exact_or_many(size, in_out)
    }

    pub fn topology(&self) -> &NumaTopology {
        &self.topology
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimBackend;
    use crate::range_list::RangeList;

    fn leak(backend: SimBackend) -> &'static SimBackend {
        Box::leak(Box::new(backend))
    }

    fn offset(granules: usize) -> Offset {
        Offset::new((granules * GRANULE_SIZE) as u64)
    }

    #[test]
    fn contiguous_reservation_prefers_low_addresses() {
        let backend = leak(SimBackend::new());
        let reserver = VirtualMemoryReserver::new(backend, 8 * GRANULE_SIZE, 100);

        assert_eq!(reserver.reserved(), 8 * GRANULE_SIZE);
        assert!(reserver.is_contiguous());
        assert_eq!(reserver.reservation.ranges()[0].start(), Offset::zero());
    }

    /// Denying the middle granule defeats every contiguous placement
    /// of a request larger than half the offset space.
    fn deny_middle_granule(backend: &SimBackend) -> usize {
        let middle = (ADDRESS_OFFSET_MAX / 2) as usize;
        backend.deny_range(Offset::new(middle as u64), GRANULE_SIZE);

        // A request this large overlaps the middle wherever it lands.
        middle + 2 * GRANULE_SIZE
    }

    #[test]
    fn discontiguous_reservation_covers_around_obstacles() {
        let backend = leak(SimBackend::new());
        let size = deny_middle_granule(backend);

        let mut reserver = VirtualMemoryReserver::new(backend, size, 100);

        // Divide and conquer finds the full size on both sides of the
        // obstacle.
        assert_eq!(reserver.reserved(), size);
        assert!(!reserver.is_contiguous());
        reserver.unreserve_all();
    }

    #[test]
    fn discontiguous_reservation_rejects_tiny_fragments() {
        let backend = leak(SimBackend::new());
        let size = deny_middle_granule(backend);

        // With max_virtual_reservations == 2 no fragment below half
        // the request is accepted, so nothing small accumulates near
        // the obstacle.
        let mut reserver = VirtualMemoryReserver::new(backend, size, 2);
        let min_range = align_up(size / 2, GRANULE_SIZE);

        assert_eq!(reserver.reserved(), size);
        for range in reserver.reservation.ranges() {
            assert!(range.size() >= min_range, "fragment below the minimum");
        }
        reserver.unreserve_all();
    }

    #[test]
    fn unreserve_all_returns_address_space() {
        let backend = leak(SimBackend::new());
        let mut reserver = VirtualMemoryReserver::new(backend, 4 * GRANULE_SIZE, 100);

        reserver.unreserve_all();
        assert!(reserver.is_empty());
        assert!(backend.reserve(Offset::zero(), 4 * GRANULE_SIZE));
    }

    #[test]
    fn transfer_initializes_node_limits() {
        let backend = leak(SimBackend::new());
        let mut reserver = VirtualMemoryReserver::new(backend, 8 * GRANULE_SIZE, 100);

        let mut node = RangeList::new();
        reserver.initialize_node(&mut node, 3 * GRANULE_SIZE);

        assert_eq!(node.limits().size(), 3 * GRANULE_SIZE);
        reserver.unreserve_all();
    }

    #[test]
    fn manager_splits_reservation_across_nodes() {
        let backend = leak(SimBackend::new());
        let settings = HeapSettings {
            max_capacity: 8 * GRANULE_SIZE,
            initial_capacity: 2 * GRANULE_SIZE,
            min_capacity: 0,
            soft_max_capacity: 8 * GRANULE_SIZE,
            numa: NumaTopology::new(2),
            virtual_to_physical_ratio: 2,
            ..Default::default()
        };

        let manager = VirtualMemoryManager::new(backend, &settings).expect("should reserve");

        // Each node holds half of max_capacity * ratio.
        let low = manager.alloc(8 * GRANULE_SIZE, 0, true);
        assert!(!low.is_null());
        assert_eq!(manager.get_numa_id(&low), 0);

        let high = manager.alloc(8 * GRANULE_SIZE, 1, true);
        assert!(!high.is_null());
        assert_eq!(manager.get_numa_id(&high), 1);

        // The multi-node pool received max_capacity on top.
        let multi = manager.remove_from_low_multi_node(4 * GRANULE_SIZE);
        assert!(!multi.is_null());
        assert!(manager.is_in_multi_node(&multi));
        manager.insert_multi_node(&multi);

        manager.free(&low);
        manager.free(&high);
    }

    #[test]
    fn shuffle_moves_ranges_to_lower_addresses() {
        let backend = leak(SimBackend::new());
        let settings = HeapSettings {
            max_capacity: 8 * GRANULE_SIZE,
            initial_capacity: 0,
            min_capacity: 0,
            soft_max_capacity: 8 * GRANULE_SIZE,
            virtual_to_physical_ratio: 2,
            ..Default::default()
        };

        let manager = VirtualMemoryManager::new(backend, &settings).expect("should reserve");

        // Take two low ranges, free the first back: the freed hole
        // sits below the second allocation.
        let first = manager.alloc(2 * GRANULE_SIZE, 0, true);
        let second = manager.alloc(2 * GRANULE_SIZE, 0, true);
        manager.free(&first);

        let mut out = Vec::new();
        let count = manager.shuffle_to_low_addresses(&second, &mut out);

        assert_eq!(count, 1);
        assert_eq!(out[0], first, "shuffle should land in the lower hole");
    }
}
