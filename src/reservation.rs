//! Reservation backends.  Most targets reserve address space flat and
//! never hear about range mutations again.  Placeholder targets must
//! split and coalesce an OS reservation token in lockstep with every
//! range the allocator lists, so the backend installs callbacks into
//! each range inventory.
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
use std::sync::Arc;
use std::sync::Mutex;

use crate::address::is_granule_aligned;
use crate::address::Offset;
use crate::address::TypedOffset;
use crate::address::Virtual;
use crate::address::GRANULE_SIZE;
use crate::range::VirtualRange;
use crate::range_list::Callbacks;

/// How reserved address space is modeled by the memory backend.
#[derive(Clone)]
pub enum ReservationBackend {
    /// Reservations carry no per-range state; no callbacks needed.
    Flat,
    /// Every listed range must be covered by exactly one placeholder;
    /// ranges handed out are covered by one placeholder per granule.
    Placeholder(Arc<PlaceholderSpace>),
}

impl ReservationBackend {
    /// Builds the callback set to install into a range inventory (a
    /// `RangeList` or the mapped cache).
    pub fn callbacks(&self) -> Callbacks<Virtual> {
        match self {
            ReservationBackend::Flat => Callbacks::none(),
            ReservationBackend::Placeholder(space) => PlaceholderSpace::callbacks(space),
        }
    }
}

/// Tracks one placeholder per contiguous reservation token.  All
/// operations verify the discipline; drift is a bug and panics.
#[derive(Debug, Default)]
pub struct PlaceholderSpace {
    /// start -> size, non-overlapping.
    placeholders: Mutex<BTreeMap<u64, usize>>,
}

impl PlaceholderSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Default::default())
    }

    /// Registers the single placeholder created by a reservation.
    pub fn on_reserve(&self, start: Offset, size: usize) {
        let mut placeholders = self.placeholders.lock().unwrap();
        let previous = placeholders.insert(start.raw(), size);
        assert!(previous.is_none(), "reservation over a live placeholder");
    }

    /// Drops the placeholder covering an unreserved range.
    pub fn on_unreserve(&self, start: Offset, size: usize) {
        let mut placeholders = self.placeholders.lock().unwrap();
        let removed = placeholders.remove(&start.raw());
        assert_eq!(removed, Some(size), "unreserve must match one placeholder");
    }

    /// Carves `[start, start + size)` out of the placeholder covering
    /// it, leaving up to three placeholders.
    #[requires(size > 0)]
    #[requires(is_granule_aligned(size))]
    fn split(&self, start: u64, size: usize) {
        let mut placeholders = self.placeholders.lock().unwrap();

        let (ph_start, ph_size) = placeholders
            .range(..=start)
            .next_back()
            .map(|(s, z)| (*s, *z))
            .expect("no placeholder covers the split range");
        assert!(
            start + size as u64 <= ph_start + ph_size as u64,
            "split range escapes its placeholder"
        );
        assert!(
            ph_start != start || ph_size != size,
            "splitting a placeholder into itself"
        );

        placeholders.remove(&ph_start);
        if ph_start < start {
            placeholders.insert(ph_start, (start - ph_start) as usize);
        }
        placeholders.insert(start, size);

        let end = start + size as u64;
        let ph_end = ph_start + ph_size as u64;
        if end < ph_end {
            placeholders.insert(end, (ph_end - end) as usize);
        }
    }

    /// Merges the placeholders exactly tiling `[start, start + size)`
    /// into one.
    #[requires(size > 0)]
    #[requires(is_granule_aligned(size))]
    fn coalesce(&self, start: u64, size: usize) {
        let mut placeholders = self.placeholders.lock().unwrap();
        let end = start + size as u64;

        let mut cursor = start;
        let mut absorbed = Vec::new();
        while cursor < end {
            let piece_size = *placeholders
                .get(&cursor)
                .expect("coalesced range must be exactly tiled by placeholders");
            assert!(cursor + piece_size as u64 <= end, "placeholder escapes the range");

            absorbed.push(cursor);
            cursor += piece_size as u64;
        }
        assert_eq!(cursor, end, "placeholders must tile the coalesced range");

        for piece in absorbed {
            placeholders.remove(&piece);
        }
        placeholders.insert(start, size);
    }

    /// One placeholder covering the whole range; granule-sized ranges
    /// already are one.
    fn coalesce_into_one(&self, start: u64, size: usize) {
        if size > GRANULE_SIZE {
            self.coalesce(start, size);
        } else {
            let placeholders = self.placeholders.lock().unwrap();
            assert_eq!(
                placeholders.get(&start),
                Some(&size),
                "granule placeholder must already stand alone"
            );
        }
    }

    /// Turns a single covering placeholder into granule-sized ones.
    /// The last granule is left alone; it already is a placeholder
    /// after the preceding splits.
    fn split_into_granules(&self, start: u64, size: usize) {
        assert!(size >= GRANULE_SIZE, "must be at least one granule");
        assert!(is_granule_aligned(size), "must be granule aligned");

        let limit = size - GRANULE_SIZE;
        let mut offset = 0;
        while offset < limit {
            self.split(start + offset as u64, GRANULE_SIZE);
            offset += GRANULE_SIZE;
        }
    }

    fn callbacks(space: &Arc<Self>) -> Callbacks<Virtual> {
        // Inserting coalesces: the listed range ends up covered by one
        // placeholder.  Removing splits: the extracted range leaves as
        // one placeholder per granule, ready for per-granule mapping.
        let on_insert_stand_alone = Arc::clone(space);
        let on_insert_from_front = Arc::clone(space);
        let on_insert_from_back = Arc::clone(space);
        let on_remove_stand_alone = Arc::clone(space);
        let on_remove_from_front = Arc::clone(space);
        let on_remove_from_back = Arc::clone(space);
        let on_transfer_from_front = Arc::clone(space);

        Callbacks {
            insert_stand_alone: Some(Box::new(move |range: &VirtualRange| {
                on_insert_stand_alone.coalesce_into_one(range.start().raw(), range.size());
            })),
            insert_from_front: Some(Box::new(move |existing: &VirtualRange, size: usize| {
                let start = existing.start().raw() - size as u64;
                on_insert_from_front.coalesce_into_one(start, existing.size() + size);
            })),
            insert_from_back: Some(Box::new(move |existing: &VirtualRange, size: usize| {
                on_insert_from_back.coalesce_into_one(existing.start().raw(), existing.size() + size);
            })),
            remove_stand_alone: Some(Box::new(move |range: &VirtualRange| {
                on_remove_stand_alone.split_into_granules(range.start().raw(), range.size());
            })),
            remove_from_front: Some(Box::new(move |existing: &VirtualRange, size: usize| {
                let start = existing.start().raw();
                on_remove_from_front.split(start, size);
                on_remove_from_front.split_into_granules(start, size);
            })),
            remove_from_back: Some(Box::new(move |existing: &VirtualRange, size: usize| {
                let start = existing.end().raw() - size as u64;
                on_remove_from_back.split(start, size);
                on_remove_from_back.split_into_granules(start, size);
            })),
            transfer_from_front: Some(Box::new(move |existing: &VirtualRange, size: usize| {
                // The split-off part moves to another list whole; it
                // keeps a single placeholder and is not granulated.
                on_transfer_from_front.split(existing.start().raw(), size);
            })),
        }
    }

    /// `true` iff exactly one placeholder covers `[start, start+size)`.
    pub fn is_single(&self, start: Offset, size: usize) -> bool {
        let placeholders = self.placeholders.lock().unwrap();
        placeholders.get(&start.raw()) == Some(&size)
    }

    /// `true` iff the range is covered by one placeholder per granule.
    pub fn is_granule_covered(&self, start: Offset, size: usize) -> bool {
        let placeholders = self.placeholders.lock().unwrap();
        (0..size / GRANULE_SIZE).all(|i| {
            placeholders.get(&(start.raw() + (i * GRANULE_SIZE) as u64)) == Some(&GRANULE_SIZE)
        })
    }

    pub fn count(&self) -> usize {
        self.placeholders.lock().unwrap().len()
    }
}
