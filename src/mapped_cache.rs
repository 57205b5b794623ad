//! The mapped cache retains ready-to-use virtual-to-physical mappings
//! across page frees so later allocations skip the OS mapping churn.
//! Entries are indexed twice: by address, for coalescing with
//! neighbors, and by size class, for fast first-fit removal.
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

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Bound;

use static_assertions::const_assert;

use crate::address::is_granule_aligned;
use crate::address::Offset;
use crate::address::TypedOffset;
use crate::address::Virtual;
use crate::address::GRANULE_SIZE;
use crate::range::VirtualRange;
use crate::range_list::Callbacks;

pub const NUM_SIZE_CLASSES: usize = 4;

/// Size class thresholds in granules; class `k` lists every entry with
/// `size >= class_size(k)`.  The first class is replaced by the medium
/// page size when one is configured.
const SIZE_CLASSES_GRANULES: [usize; NUM_SIZE_CLASSES] = [1, 32, 128, 512];

const_assert!(SIZE_CLASSES_GRANULES[0] < SIZE_CLASSES_GRANULES[1]);
const_assert!(SIZE_CLASSES_GRANULES[1] < SIZE_CLASSES_GRANULES[2]);
const_assert!(SIZE_CLASSES_GRANULES[2] < SIZE_CLASSES_GRANULES[3]);

pub struct MappedCache {
    /// start -> size, address ordered, coalesced.
    tree: BTreeMap<Offset, usize>,
    /// Per size class, the starts of the member entries.
    size_class_lists: [BTreeSet<Offset>; NUM_SIZE_CLASSES],
    /// Total bytes cached.
    size: usize,
    /// Low watermark driving the uncommitter; see `reset_min`.
    min: usize,
    /// Nonzero overrides the first size class.
    medium_page_size: usize,
    callbacks: Callbacks<Virtual>,
}

impl MappedCache {
    pub fn new(medium_page_size: usize) -> Self {
        MappedCache {
            tree: BTreeMap::new(),
            size_class_lists: Default::default(),
            size: 0,
            min: 0,
            medium_page_size,
            callbacks: Callbacks::none(),
        }
    }

    /// Installs placeholder-adjustment callbacks; see `RangeList`.
    pub fn register_callbacks(&mut self, callbacks: Callbacks<Virtual>) {
        self.callbacks = callbacks;
    }

    fn class_size(&self, index: usize) -> usize {
        if index == 0 && self.medium_page_size > GRANULE_SIZE {
            return self.medium_page_size;
        }

        SIZE_CLASSES_GRANULES[index] * GRANULE_SIZE
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn min(&self) -> usize {
        self.min
    }

    /// Returns the previous low watermark and restarts tracking from
    /// the current size.
    pub fn reset_min(&mut self) -> usize {
        let old_min = self.min;
        self.min = self.size;

        old_min
    }

    /// Inserts a mapped range, coalescing with cached neighbors.
    #[requires(is_granule_aligned(vmem.size()))]
    pub fn insert(&mut self, vmem: VirtualRange) {
        self.size += vmem.size();

        let left = self
            .tree
            .range(..vmem.start())
            .next_back()
            .map(|(s, z)| (*s, *z))
            .filter(|(s, z)| s.offset_by(*z) == vmem.start());
        let right_key = Offset::from_raw(vmem.end().raw());
        let right = self.tree.get(&right_key).map(|z| (right_key, *z));

        match (left, right) {
            (Some((left_start, left_size)), Some((right_start, right_size))) => {
                let upper = VirtualRange::new(right_start, right_size);
                self.fire_insert_from_front(&upper, left_size + vmem.size());

                self.entry_remove(left_start, left_size);
                self.entry_remove(right_start, right_size);
                self.entry_insert(left_start, left_size + vmem.size() + right_size);
            }
            (Some((left_start, left_size)), None) => {
                let lower = VirtualRange::new(left_start, left_size);
                self.fire_insert_from_back(&lower, vmem.size());

                self.entry_remove(left_start, left_size);
                self.entry_insert(left_start, left_size + vmem.size());
            }
            (None, Some((right_start, right_size))) => {
                let upper = VirtualRange::new(right_start, right_size);
                self.fire_insert_from_front(&upper, vmem.size());

                self.entry_remove(right_start, right_size);
                self.entry_insert(vmem.start(), vmem.size() + right_size);
            }
            (None, None) => {
                self.fire_insert_stand_alone(&vmem);
                self.entry_insert(vmem.start(), vmem.size());
            }
        }
    }

    /// Removes one range of exactly `size`, or null.  Scans size
    /// classes from the largest class admitting `size` downwards, then
    /// falls back to a walk of the whole tree.
    #[requires(size > 0)]
    #[requires(is_granule_aligned(size))]
    #[ensures(ret.is_null() || ret.size() == size)]
    pub fn remove_contiguous(&mut self, size: usize) -> VirtualRange {
        let mut result = VirtualRange::null();

        self.scan_remove(
            size,
            |_| size,
            |vmem| {
                debug_assert!(result.is_null(), "only consume once");
                debug_assert_eq!(vmem.size(), size, "wrong size consumed");
                result = vmem;
                true
            },
        );

        result
    }

    /// Drains up to `size` bytes into `out`, visiting entries largest
    /// size class first.  Returns the bytes delivered.
    #[requires(size > 0)]
    #[requires(is_granule_aligned(size))]
    pub fn remove_discontiguous(&mut self, out: &mut Vec<VirtualRange>, size: usize) -> usize {
        let remaining = std::cell::Cell::new(size);

        self.scan_remove(
            0,
            |vmem_size| remaining.get().min(vmem_size),
            |vmem| {
                debug_assert!(vmem.size() <= remaining.get(), "consumed too much");
                remaining.set(remaining.get() - vmem.size());
                out.push(vmem);
                remaining.get() == 0
            },
        );

        size - remaining.get()
    }

    /// Drains up to `min(min watermark, max_size)` bytes into `out`
    /// for the uncommitter.  The drained amount leaves the watermark.
    pub fn remove_from_min(&mut self, out: &mut Vec<VirtualRange>, max_size: usize) -> usize {
        let size = self.min.min(max_size);
        if size == 0 {
            return 0;
        }

        self.remove_discontiguous(out, size)
    }

    /// Every cached range, ascending.  Verification aid.
    pub fn ranges(&self) -> Vec<VirtualRange> {
        self.tree
            .iter()
            .map(|(start, size)| VirtualRange::new(*start, *size))
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.tree.len()
    }

    /// `true` iff the entry starting at `start` is listed on class
    /// `class_index`.  Verification aid.
    pub fn on_size_class_list(&self, class_index: usize, start: Offset) -> bool {
        self.size_class_lists[class_index].contains(&start)
    }

    /// Inserts an entry into the tree and every size class it
    /// qualifies for.
    fn entry_insert(&mut self, start: Offset, size: usize) {
        let previous = self.tree.insert(start, size);
        debug_assert!(previous.is_none(), "entry already cached");

        for index in 0..NUM_SIZE_CLASSES {
            if size >= self.class_size(index) {
                self.size_class_lists[index].insert(start);
            }
        }
    }

    /// Removes an entry from the tree and its size class lists.
    fn entry_remove(&mut self, start: Offset, size: usize) {
        let removed = self.tree.remove(&start);
        debug_assert_eq!(removed, Some(size), "entry not cached");

        for index in 0..NUM_SIZE_CLASSES {
            if size >= self.class_size(index) {
                let was_listed = self.size_class_lists[index].remove(&start);
                debug_assert!(was_listed, "size class list out of sync");
            }
        }
    }

    /// Takes `select(entry size)` bytes from the front of the entry at
    /// `start`, updating the indexes; returns the removed range (null
    /// when the entry is below `min_size` or `select` declines).
    fn remove_from_entry(
        &mut self,
        start: Offset,
        min_size: usize,
        select: &mut impl FnMut(usize) -> usize,
    ) -> VirtualRange {
        let size = self.tree[&start];
        if size < min_size {
            // Smaller than min_size, do not select this entry.
            return VirtualRange::null();
        }

        let to_remove = select(size);
        debug_assert!(to_remove <= size, "must not remove more than the entry");

        if to_remove == 0 {
            return VirtualRange::null();
        }

        let mut vmem = VirtualRange::new(start, size);
        if to_remove != size {
            // Partial removal: take the front, keep the tail cached.
            let removed = vmem.split_from_front(to_remove);
            self.fire_remove_from_front(&VirtualRange::new(start, size), to_remove);

            self.entry_remove(start, size);
            self.entry_insert(vmem.start(), vmem.size());
            vmem = removed;
        } else {
            // Whole removal.
            self.fire_remove_stand_alone(&vmem);
            self.entry_remove(start, size);
        }

        self.size -= to_remove;
        self.min = self.min.min(self.size);

        vmem
    }

    /// The scan driving every removal flavor: walk size classes from
    /// largest to smallest, then the whole tree; `select` decides how
    /// much of a candidate to take, `consume` receives removed ranges
    /// and says when to stop.
    fn scan_remove(
        &mut self,
        min_size: usize,
        mut select: impl FnMut(usize) -> usize,
        mut consume: impl FnMut(VirtualRange) -> bool,
    ) {
        for index in (0..NUM_SIZE_CLASSES).rev() {
            let class_size = self.class_size(index);

            let mut cursor: Option<Offset> = None;
            loop {
                let next = match cursor {
                    None => self.size_class_lists[index].iter().next().copied(),
                    Some(at) => self.size_class_lists[index]
                        .range((Bound::Excluded(at), Bound::Unbounded))
                        .next()
                        .copied(),
                };
                let start = match next {
                    Some(start) => start,
                    None => break,
                };
                cursor = Some(start);

                let vmem = self.remove_from_entry(start, min_size, &mut select);
                if !vmem.is_null() && consume(vmem) {
                    return;
                }
            }

            if min_size > class_size {
                // Smaller classes and the tree only hold smaller
                // entries; no use walking further.
                return;
            }
        }

        // Scan the whole tree.
        let mut cursor: Option<Offset> = None;
        loop {
            let next = match cursor {
                None => self.tree.keys().next().copied(),
                Some(at) => self
                    .tree
                    .range((Bound::Excluded(at), Bound::Unbounded))
                    .next()
                    .map(|(s, _)| *s),
            };
            let start = match next {
                Some(start) => start,
                None => break,
            };
            cursor = Some(start);

            let vmem = self.remove_from_entry(start, min_size, &mut select);
            if !vmem.is_null() && consume(vmem) {
                return;
            }
        }
    }

    fn fire_insert_stand_alone(&self, range: &VirtualRange) {
        if let Some(callback) = &self.callbacks.insert_stand_alone {
            callback(range);
        }
    }

    fn fire_insert_from_front(&self, existing: &VirtualRange, size: usize) {
        if let Some(callback) = &self.callbacks.insert_from_front {
            callback(existing, size);
        }
    }

    fn fire_insert_from_back(&self, existing: &VirtualRange, size: usize) {
        if let Some(callback) = &self.callbacks.insert_from_back {
            callback(existing, size);
        }
    }

    fn fire_remove_stand_alone(&self, range: &VirtualRange) {
        if let Some(callback) = &self.callbacks.remove_stand_alone {
            callback(range);
        }
    }

    fn fire_remove_from_front(&self, existing: &VirtualRange, size: usize) {
        if let Some(callback) = &self.callbacks.remove_from_front {
            callback(existing, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    fn offset(granules: usize) -> Offset {
        Offset::new((granules * GRANULE_SIZE) as u64)
    }

    fn vrange(start_granules: usize, granules: usize) -> VirtualRange {
        VirtualRange::new(offset(start_granules), granules * GRANULE_SIZE)
    }

    fn cache() -> MappedCache {
        // Medium pages of 16 granules, like a 32M medium page with 2M
        // granules.
        MappedCache::new(16 * GRANULE_SIZE)
    }

    #[test]
    fn insert_coalesces_on_both_sides() {
        let mut cache = cache();

        cache.insert(vrange(0, 1));
        cache.insert(vrange(3, 1));
        assert_eq!(cache.entry_count(), 2);

        cache.insert(vrange(1, 2));
        assert_eq!(cache.ranges(), vec![vrange(0, 4)]);
        assert_eq!(cache.size(), 4 * GRANULE_SIZE);
    }

    #[test]
    fn remove_contiguous_takes_exact_fit() {
        let mut cache = cache();

        cache.insert(vrange(0, 1));
        cache.insert(vrange(4, 16));

        let removed = cache.remove_contiguous(16 * GRANULE_SIZE);
        assert_eq!(removed, vrange(4, 16));
        assert_eq!(cache.ranges(), vec![vrange(0, 1)]);
    }

    #[test]
    fn remove_contiguous_splits_larger_entries() {
        let mut cache = cache();

        cache.insert(vrange(0, 4));

        let removed = cache.remove_contiguous(GRANULE_SIZE);
        assert_eq!(removed, vrange(0, 1));
        assert_eq!(cache.ranges(), vec![vrange(1, 3)]);
        assert_eq!(cache.size(), 3 * GRANULE_SIZE);
    }

    #[test]
    fn remove_contiguous_misses_when_fragmented() {
        let mut cache = cache();

        cache.insert(vrange(0, 1));
        cache.insert(vrange(2, 1));

        assert!(cache.remove_contiguous(2 * GRANULE_SIZE).is_null());
        assert_eq!(cache.size(), 2 * GRANULE_SIZE);
    }

    #[test]
    fn remove_discontiguous_gathers_pieces() {
        let mut cache = cache();

        cache.insert(vrange(0, 1));
        cache.insert(vrange(2, 1));
        cache.insert(vrange(4, 1));

        let mut out = Vec::new();
        let removed = cache.remove_discontiguous(&mut out, 3 * GRANULE_SIZE);

        assert_eq!(removed, 3 * GRANULE_SIZE);
        assert_eq!(out.len(), 3);
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn remove_discontiguous_prefers_large_entries() {
        let mut cache = cache();

        cache.insert(vrange(0, 1));
        cache.insert(vrange(8, 16));

        let mut out = Vec::new();
        let removed = cache.remove_discontiguous(&mut out, 2 * GRANULE_SIZE);

        assert_eq!(removed, 2 * GRANULE_SIZE);
        // The large (medium-class) entry is visited first.
        assert_eq!(out, vec![vrange(8, 2)]);
    }

    #[test]
    fn min_watermark_tracks_low_point() {
        let mut cache = cache();

        cache.insert(vrange(0, 4));
        cache.reset_min();
        assert_eq!(cache.min(), 4 * GRANULE_SIZE);

        let _ = cache.remove_contiguous(2 * GRANULE_SIZE);
        assert_eq!(cache.min(), 2 * GRANULE_SIZE);

        cache.insert(vrange(8, 4));
        assert_eq!(cache.min(), 2 * GRANULE_SIZE, "inserts do not raise min");

        assert_eq!(cache.reset_min(), 2 * GRANULE_SIZE);
        assert_eq!(cache.min(), cache.size());
    }

    #[test]
    fn reset_min_twice_returns_current_size() {
        let mut cache = cache();

        // An empty cache keeps a zero watermark.
        cache.reset_min();
        assert_eq!(cache.reset_min(), 0);

        cache.insert(vrange(0, 2));
        cache.reset_min();

        // With no activity in between, the watermark equals the size.
        assert_eq!(cache.reset_min(), 2 * GRANULE_SIZE);
    }

    #[test]
    fn remove_from_min_is_bounded_by_watermark() {
        let mut cache = cache();

        cache.insert(vrange(0, 4));
        cache.reset_min();

        // Take and put back two granules: size returns to 4, min stays
        // at 2.
        let taken = cache.remove_contiguous(2 * GRANULE_SIZE);
        cache.insert(taken);
        assert_eq!(cache.min(), 2 * GRANULE_SIZE);

        let mut out = Vec::new();
        let removed = cache.remove_from_min(&mut out, 64 * GRANULE_SIZE);
        assert_eq!(removed, 2 * GRANULE_SIZE);
    }

    #[test]
    fn size_class_membership_follows_thresholds() {
        let mut cache = cache();

        // One granule: only class 0 would admit it if it reached the
        // medium size; with medium configured the entry sits on no
        // class list below the threshold.
        cache.insert(vrange(0, 1));
        assert!(!cache.on_size_class_list(0, offset(0)));

        // A medium-sized entry lands on class 0.
        cache.insert(vrange(8, 16));
        assert!(cache.on_size_class_list(0, offset(8)));
        assert!(!cache.on_size_class_list(1, offset(8)));

        // A huge entry lands on every class.
        cache.insert(vrange(100, 512));
        for index in 0..NUM_SIZE_CLASSES {
            assert!(cache.on_size_class_list(index, offset(100)));
        }
    }

    proptest! {
        // P5: an entry with size s is on list k iff s >= class k's
        // threshold.
        #[test]
        fn size_class_membership_invariant(sizes in vec(1..64usize, 1..16)) {
            let mut cache = cache();

            let mut start = 0;
            for granules in sizes {
                cache.insert(vrange(start, granules));
                // Leave a gap so nothing coalesces.
                start += granules + 1;
            }

            for range in cache.ranges() {
                for index in 0..NUM_SIZE_CLASSES {
                    let threshold = cache.class_size(index);
                    prop_assert_eq!(
                        cache.on_size_class_list(index, range.start()),
                        range.size() >= threshold
                    );
                }
            }
        }

        // P6: min <= size at all times, across arbitrary interleavings
        // of inserts and removals.
        #[test]
        fn min_watermark_invariant(ops in vec((0..2usize, 1..8usize), 1..32)) {
            let mut cache = cache();
            let mut next_start = 0;

            for (op, granules) in ops {
                match op {
                    0 => {
                        cache.insert(vrange(next_start, granules));
                        next_start += granules + 1;
                    }
                    _ => {
                        let mut out = Vec::new();
                        cache.remove_discontiguous(&mut out, granules * GRANULE_SIZE);
                    }
                }

                prop_assert!(cache.min() <= cache.size());
            }

            let old_min = cache.min();
            prop_assert_eq!(cache.reset_min(), old_min);
            prop_assert_eq!(cache.min(), cache.size());
        }
    }
}
