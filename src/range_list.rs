//! An ordered, coalescing inventory of non-overlapping ranges with
//! structural mutation callbacks.  The virtual memory manager keeps one
//! list per NUMA node; the physical backing manager keeps one list of
//! free segment indices per node.  Callbacks exist so that reservation
//! backends that must mirror every range mutation (placeholder-based
//! reservations) can do so in lockstep.
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
use std::sync::Mutex;

use crate::address::AddressFamily;
use crate::address::TypedOffset;
use crate::range::Range;

pub type RangeCallback<F> = Box<dyn Fn(&Range<F>) + Send + Sync>;
pub type ResizeCallback<F> = Box<dyn Fn(&Range<F>, usize) + Send + Sync>;

/// One callback per structural mutation shape.  Exactly one fires for
/// every insert or removal; callbacks receive the pre-mutation range
/// plus the moved size where relevant.
pub struct Callbacks<F: AddressFamily> {
    /// A new range entered the list without coalescing.
    pub insert_stand_alone: Option<RangeCallback<F>>,
    /// `size` units merged below the front of an existing range.
    pub insert_from_front: Option<ResizeCallback<F>>,
    /// `size` units merged above the back of an existing range.
    pub insert_from_back: Option<ResizeCallback<F>>,

    /// A listed range left the list whole.
    pub remove_stand_alone: Option<RangeCallback<F>>,
    /// `size` units left from the front of an existing range.
    pub remove_from_front: Option<ResizeCallback<F>>,
    /// `size` units left from the back of an existing range.
    pub remove_from_back: Option<ResizeCallback<F>>,

    /// `size` units split off the front of an existing range on their
    /// way to another list.
    pub transfer_from_front: Option<ResizeCallback<F>>,
}

impl<F: AddressFamily> Default for Callbacks<F> {
    fn default() -> Self {
        Callbacks {
            insert_stand_alone: None,
            insert_from_front: None,
            insert_from_back: None,
            remove_stand_alone: None,
            remove_from_front: None,
            remove_from_back: None,
            transfer_from_front: None,
        }
    }
}

impl<F: AddressFamily> Callbacks<F> {
    pub fn none() -> Self {
        Default::default()
    }
}

struct Inner<F: AddressFamily> {
    /// start -> size, ascending, never containing adjacent entries.
    map: BTreeMap<F::Start, usize>,
    limits: Range<F>,
}

pub struct RangeList<F: AddressFamily> {
    inner: Mutex<Inner<F>>,
    callbacks: Callbacks<F>,
}

impl<F: AddressFamily> Default for RangeList<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: AddressFamily> RangeList<F> {
    pub fn new() -> Self {
        RangeList {
            inner: Mutex::new(Inner {
                map: BTreeMap::new(),
                limits: Range::null(),
            }),
            callbacks: Callbacks::none(),
        }
    }

    /// Installs the callback set.  Must happen before the list is
    /// shared; mutations made earlier fire nothing.
    pub fn register_callbacks(&mut self, callbacks: Callbacks<F>) {
        self.callbacks = callbacks;
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().map.is_empty()
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.lock().unwrap().map.len() == 1
    }

    /// Freezes the current span of the list as its limits.  Only
    /// ranges within the limits may be inserted afterwards.
    pub fn anchor_limits(&self) {
        let mut inner = self.inner.lock().unwrap();
        assert!(inner.limits.is_null(), "should only anchor limits once");

        let (first, last) = match (
            inner.map.iter().next().map(|(s, _)| *s),
            inner.map.iter().next_back().map(|(s, z)| (*s, *z)),
        ) {
            (Some(first), Some(last)) => (first, last),
            _ => return,
        };

        let size = last.0.since(first) + last.1;
        inner.limits = Range::new(first, size);
    }

    pub fn limits(&self) -> Range<F> {
        let inner = self.inner.lock().unwrap();
        assert!(!inner.limits.is_null(), "limits not anchored");
        inner.limits
    }

    pub fn limits_contain(&self, range: &Range<F>) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.limits.is_null() || range.is_null() {
            return false;
        }

        inner.limits.contains(range)
    }

    /// `true` iff `range` is within the anchored limits, or no limits
    /// were anchored.
    pub fn check_limits(&self, range: &Range<F>) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.limits.is_null() || inner.limits.contains(range)
    }

    /// The lowest listed start, or the invalid sentinel when empty.
    pub fn peek_low_address(&self) -> F::Start {
        let inner = self.inner.lock().unwrap();
        match inner.map.iter().next() {
            Some((start, _)) => *start,
            None => F::Start::INVALID,
        }
    }

    /// Inserts `range`, coalescing with neighbors, and fires the
    /// matching structural callback.
    pub fn insert(&self, range: Range<F>) {
        let mut inner = self.inner.lock().unwrap();
        self.insert_inner(&mut inner, range, true);
    }

    /// Inserts while bootstrapping a reservation.  Merge-shape
    /// callbacks still fire (coalescing adjacent reservations must be
    /// observable), but no stand-alone insert is announced.
    pub fn register(&self, range: Range<F>) {
        let mut inner = self.inner.lock().unwrap();
        self.insert_inner(&mut inner, range, false);
    }

    /// Removes and returns the first listed range without firing
    /// callbacks.  Used to unreserve surplus address space.
    pub fn unregister_first(&self) -> Option<Range<F>> {
        let mut inner = self.inner.lock().unwrap();
        let (start, size) = inner.map.iter().next().map(|(s, z)| (*s, *z))?;

        inner.map.remove(&start);
        Some(Range::new(start, size))
    }

    /// Takes the first listed range with `size()` >= `size`; exact
    /// matches leave whole, larger ones shrink from the front.
    /// Returns the null range when nothing fits.
    #[requires(size > 0)]
    #[ensures(ret.is_null() || ret.size() == size)]
    pub fn remove_from_low(&self, size: usize) -> Range<F> {
        let mut inner = self.inner.lock().unwrap();
        self.remove_from_low_inner(&mut inner, size)
    }

    /// Takes up to `size` from the first listed range.
    pub fn remove_from_low_at_most(&self, size: usize) -> Range<F> {
        let mut inner = self.inner.lock().unwrap();
        self.remove_from_low_at_most_inner(&mut inner, size)
    }

    /// Drains up to `size` units into `out`, lowest addresses first.
    /// Returns the amount actually drained.
    pub fn remove_from_low_many_at_most(&self, size: usize, out: &mut Vec<Range<F>>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        self.remove_from_low_many_at_most_inner(&mut inner, size, out)
    }

    /// Takes the last listed range with `size()` >= `size`,
    /// shrinking from the back when larger.
    #[requires(size > 0)]
    #[ensures(ret.is_null() || ret.size() == size)]
    pub fn remove_from_high(&self, size: usize) -> Range<F> {
        let mut inner = self.inner.lock().unwrap();

        let found = inner
            .map
            .iter()
            .rev()
            .find(|(_, area_size)| **area_size >= size)
            .map(|(s, z)| (*s, *z));

        let (start, area_size) = match found {
            Some(found) => found,
            None => return Range::null(),
        };

        let area = Range::new(start, area_size);
        if area_size == size {
            self.fire_remove_stand_alone(&area);
            inner.map.remove(&start);
            return area;
        }

        self.fire_remove_from_back(&area, size);
        inner.map.insert(start, area_size - size);
        Range::new(start.offset_by(area_size - size), size)
    }

    /// Reinserts `range` and immediately drains the same amount from
    /// the low end, preferring lower addresses.  The compound is
    /// atomic with respect to other list users.
    pub fn insert_and_remove_from_low_many(&self, range: Range<F>, out: &mut Vec<Range<F>>) {
        let mut inner = self.inner.lock().unwrap();
        let size = range.size();

        self.insert_inner(&mut inner, range, true);

        let removed = self.remove_from_low_many_at_most_inner(&mut inner, size, out);
        assert_eq!(removed, size, "must get back what was just inserted");
    }

    /// Reinserts every range in `in_out`, then either extracts one
    /// contiguous range of `size` (returned) or re-extracts the
    /// inserted total as smaller ranges into `in_out` (returns null).
    pub fn insert_and_remove_from_low_exact_or_many(
        &self,
        size: usize,
        in_out: &mut Vec<Range<F>>,
    ) -> Range<F> {
        let mut inner = self.inner.lock().unwrap();

        let mut inserted = 0;
        for range in in_out.drain(..).collect::<Vec<_>>() {
            inserted += range.size();
            self.insert_inner(&mut inner, range, true);
        }

        let range = self.remove_from_low_inner(&mut inner, size);
        if !range.is_null() {
            return range;
        }

        let removed = self.remove_from_low_many_at_most_inner(&mut inner, inserted, in_out);
        assert_eq!(removed, inserted, "must get back what was just inserted");
        Range::null()
    }

    /// Moves up to `size` units from the low end of `self` into the
    /// empty list `other`.  Used to hand a freshly-reserved span to
    /// per-node lists; split points fire `transfer_from_front`.
    pub fn transfer_from_low(&self, other: &RangeList<F>, size: usize) {
        let mut inner = self.inner.lock().unwrap();
        let mut other_inner = other.inner.lock().unwrap();
        assert!(
            other_inner.map.is_empty(),
            "should only transfer into an empty list"
        );

        let mut to_move = size;
        while to_move > 0 {
            let (start, area_size) = match inner.map.iter().next().map(|(s, z)| (*s, *z)) {
                Some(first) => first,
                None => break,
            };

            if area_size <= to_move {
                inner.map.remove(&start);
                other_inner.map.insert(start, area_size);
                to_move -= area_size;
            } else {
                let area = Range::new(start, area_size);
                self.fire_transfer_from_front(&area, to_move);

                inner.map.remove(&start);
                inner.map.insert(start.offset_by(to_move), area_size - to_move);
                other_inner.map.insert(start, to_move);
                to_move = 0;
            }
        }

        assert_eq!(to_move, 0, "should have transferred the requested size");
    }

    /// Snapshot of the listed ranges, ascending.  Test and verification
    /// aid; not part of the allocation paths.
    pub fn ranges(&self) -> Vec<Range<F>> {
        let inner = self.inner.lock().unwrap();
        inner
            .map
            .iter()
            .map(|(start, size)| Range::new(*start, *size))
            .collect()
    }

    fn insert_inner(&self, inner: &mut Inner<F>, range: Range<F>, announce_stand_alone: bool) {
        assert!(!range.is_null(), "invalid range");
        debug_assert!(
            inner.limits.is_null() || inner.limits.contains(&range),
            "range outside limits"
        );

        let start = range.start();
        let size = range.size();
        let end = start.offset_by(size);

        let below = inner
            .map
            .range(..start)
            .next_back()
            .map(|(s, z)| (*s, *z))
            .filter(|(s, z)| s.offset_by(*z) == start);
        let above = inner.map.get(&end).map(|z| (end, *z));

        if let Some((below_start, below_size)) = below {
            debug_assert!(below_start.offset_by(below_size) == start, "must adjoin");

            if let Some((above_start, above_size)) = above {
                // Three-way merge: drop the lower neighbor (no remove
                // callback; callbacks describe structural shape, not
                // identity) and grow the upper neighbor downwards over
                // both the inserted range and the lower neighbor.
                let upper = Range::new(above_start, above_size);
                self.fire_insert_from_front(&upper, below_size + size);

                inner.map.remove(&below_start);
                inner.map.remove(&above_start);
                inner.map.insert(below_start, below_size + size + above_size);
                return;
            }

            let lower = Range::new(below_start, below_size);
            self.fire_insert_from_back(&lower, size);

            inner.map.insert(below_start, below_size + size);
            return;
        }

        if let Some((above_start, above_size)) = above {
            let upper = Range::new(above_start, above_size);
            self.fire_insert_from_front(&upper, size);

            inner.map.remove(&above_start);
            inner.map.insert(start, size + above_size);
            return;
        }

        debug_assert!(
            inner
                .map
                .range(start..end)
                .next()
                .is_none(),
            "ranges must not overlap"
        );

        if announce_stand_alone {
            self.fire_insert_stand_alone(&range);
        }
        inner.map.insert(start, size);
    }

    fn remove_from_low_inner(&self, inner: &mut Inner<F>, size: usize) -> Range<F> {
        let found = inner
            .map
            .iter()
            .find(|(_, area_size)| **area_size >= size)
            .map(|(s, z)| (*s, *z));

        let (start, area_size) = match found {
            Some(found) => found,
            None => return Range::null(),
        };

        let area = Range::new(start, area_size);
        if area_size == size {
            self.fire_remove_stand_alone(&area);
            inner.map.remove(&start);
            return area;
        }

        self.fire_remove_from_front(&area, size);
        inner.map.remove(&start);
        inner.map.insert(start.offset_by(size), area_size - size);
        Range::new(start, size)
    }

    fn remove_from_low_at_most_inner(&self, inner: &mut Inner<F>, size: usize) -> Range<F> {
        let (start, area_size) = match inner.map.iter().next().map(|(s, z)| (*s, *z)) {
            Some(first) => first,
            None => return Range::null(),
        };

        let area = Range::new(start, area_size);
        if area_size <= size {
            self.fire_remove_stand_alone(&area);
            inner.map.remove(&start);
            return area;
        }

        self.fire_remove_from_front(&area, size);
        inner.map.remove(&start);
        inner.map.insert(start.offset_by(size), area_size - size);
        Range::new(start, size)
    }

    fn remove_from_low_many_at_most_inner(
        &self,
        inner: &mut Inner<F>,
        size: usize,
        out: &mut Vec<Range<F>>,
    ) -> usize {
        let mut to_remove = size;

        while to_remove > 0 {
            let range = self.remove_from_low_at_most_inner(inner, to_remove);
            if range.is_null() {
                // The requested amount is not available.
                return size - to_remove;
            }

            to_remove -= range.size();
            out.push(range);
        }

        size
    }

    fn fire_insert_stand_alone(&self, range: &Range<F>) {
        if let Some(callback) = &self.callbacks.insert_stand_alone {
            callback(range);
        }
    }

    fn fire_insert_from_front(&self, existing: &Range<F>, size: usize) {
        if let Some(callback) = &self.callbacks.insert_from_front {
            callback(existing, size);
        }
    }

    fn fire_insert_from_back(&self, existing: &Range<F>, size: usize) {
        if let Some(callback) = &self.callbacks.insert_from_back {
            callback(existing, size);
        }
    }

    fn fire_remove_stand_alone(&self, range: &Range<F>) {
        if let Some(callback) = &self.callbacks.remove_stand_alone {
            callback(range);
        }
    }

    fn fire_remove_from_front(&self, existing: &Range<F>, size: usize) {
        if let Some(callback) = &self.callbacks.remove_from_front {
            callback(existing, size);
        }
    }

    fn fire_remove_from_back(&self, existing: &Range<F>, size: usize) {
        if let Some(callback) = &self.callbacks.remove_from_back {
            callback(existing, size);
        }
    }

    fn fire_transfer_from_front(&self, existing: &Range<F>, size: usize) {
        if let Some(callback) = &self.callbacks.transfer_from_front {
            callback(existing, size);
        }
    }
}
