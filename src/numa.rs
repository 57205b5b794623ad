//! NUMA topology inputs and per-node value containers.  The topology
//! is configuration, not discovery: the embedder states how many nodes
//! the allocator should shard across.
use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;

use crate::address::GRANULE_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NumaTopology {
    enabled: bool,
    count: u32,
}

impl NumaTopology {
    pub fn disabled() -> Self {
        NumaTopology {
            enabled: false,
            count: 1,
        }
    }

    pub fn new(count: u32) -> Self {
        assert!(count >= 1, "at least one node");

        NumaTopology {
            enabled: count > 1,
            count,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// The node this thread's allocations should start on.  Without a
    /// real affinity source, threads are spread deterministically.
    pub fn current_id(&self) -> u32 {
        if !self.enabled {
            return 0;
        }

        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() % self.count as u64) as u32
    }

    /// `numa_id`'s granule-aligned share of `total`: every node gets
    /// the floor share, and the first nodes each get one extra granule
    /// until the remainder is exhausted.
    pub fn calculate_share(&self, numa_id: u32, total: usize) -> usize {
        debug_assert!(numa_id < self.count);

        let base_share = (total / self.count as usize) & !(GRANULE_SIZE - 1);
        let extra_share_nodes = (total - base_share * self.count as usize) / GRANULE_SIZE;

        if (numa_id as usize) < extra_share_nodes {
            base_share + GRANULE_SIZE
        } else {
            base_share
        }
    }

    pub fn divide_resource(&self, total: usize, mut f: impl FnMut(u32, usize)) {
        for numa_id in 0..self.count {
            f(numa_id, self.calculate_share(numa_id, total));
        }
    }
}

/// A fixed-size container with one value per NUMA node.
#[derive(Debug)]
pub struct PerNuma<T> {
    items: Vec<T>,
}

impl<T> PerNuma<T> {
    pub fn from_fn(topology: &NumaTopology, mut f: impl FnMut(u32) -> T) -> Self {
        PerNuma {
            items: (0..topology.count()).map(|id| f(id)).collect(),
        }
    }

    pub fn get(&self, numa_id: u32) -> &T {
        &self.items[numa_id as usize]
    }

    pub fn get_mut(&mut self, numa_id: u32) -> &mut T {
        &mut self.items[numa_id as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.items.iter().enumerate().map(|(id, item)| (id as u32, item))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.items
            .iter_mut()
            .enumerate()
            .map(|(id, item)| (id as u32, item))
    }
}

#[test]
fn share_splits_are_granule_aligned_and_complete() {
    let topology = NumaTopology::new(3);
    let total = 10 * GRANULE_SIZE;

    let mut sum = 0;
    topology.divide_resource(total, |id, share| {
        assert_eq!(share % GRANULE_SIZE, 0);
        // Extra granules go to the first nodes.
        if id == 0 {
            assert_eq!(share, 4 * GRANULE_SIZE);
        } else {
            assert_eq!(share, 3 * GRANULE_SIZE);
        }
        sum += share;
    });

    assert_eq!(sum, total);
}

#[test]
fn single_node_takes_everything() {
    let topology = NumaTopology::disabled();

    assert_eq!(topology.calculate_share(0, 8 * GRANULE_SIZE), 8 * GRANULE_SIZE);
    assert_eq!(topology.current_id(), 0);
}
