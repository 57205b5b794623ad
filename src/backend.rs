//! A `MemoryBackend` is responsible for address space and backing
//! memory: reserving offset ranges, committing and uncommitting backing
//! segments, and installing granule mappings.  The page allocator is
//! parameterised on such a backend.
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;

use crate::address::BackingIndex;
use crate::address::Offset;
use crate::address::TypedOffset;
use crate::address::GRANULE_SIZE;
use crate::address::GRANULE_SIZE_SHIFT;
use crate::reservation::PlaceholderSpace;
use crate::reservation::ReservationBackend;

pub trait MemoryBackend: fmt::Debug + Send + Sync {
    /// How this backend models reserved address space.  Placeholder
    /// backends return the space whose callbacks must shadow every
    /// range mutation.
    fn reservation(&self) -> ReservationBackend {
        ReservationBackend::Flat
    }

    /// Attempts to reserve `[start, start + size)` of heap offset
    /// space.  Returns false when any part is unavailable.
    fn reserve(&self, start: Offset, size: usize) -> bool;

    /// Releases a range previously obtained from `reserve`.
    fn unreserve(&self, start: Offset, size: usize);

    /// Commits `size` bytes of backing starting at segment `index`
    /// (the segments are consecutive).  Returns the number of bytes
    /// actually committed; short returns are commit failures.
    fn commit(&self, index: BackingIndex, size: usize, numa_id: u32) -> usize;

    /// Uncommits `size` bytes of backing starting at segment `index`.
    /// Returns the number of bytes uncommitted.
    fn uncommit(&self, index: BackingIndex, size: usize) -> usize;

    /// Maps `size` bytes at virtual `offset` to the consecutive
    /// segments starting at `index`.
    fn map(&self, offset: Offset, index: BackingIndex, size: usize);

    /// Tears down the mappings covering `[offset, offset + size)`.
    fn unmap(&self, offset: Offset, size: usize);

    /// Pins `[offset, offset + size)` to `numa_id`.
    fn numa_make_local(&self, _offset: Offset, _size: usize, _numa_id: u32) {}

    /// The node the memory at `offset` actually landed on, if the
    /// backend can tell.
    fn memory_numa_id(&self, _offset: Offset) -> Option<u32> {
        None
    }

    /// Touches every committed page in the range.
    fn pretouch(&self, _offset: Offset, _size: usize) {}
}

lazy_static::lazy_static! {
    static ref NAMED_BACKENDS: Mutex<HashMap<String, &'static dyn MemoryBackend>> = {
        let mut map: HashMap<String, &'static dyn MemoryBackend> = HashMap::new();

        map.insert(
            "file".to_string(),
            Box::leak(Box::new(crate::file_backed::FileBackedBackend::new())),
        );
        Mutex::new(map)
    };
}

/// Upserts the backend associated with `name`.
pub fn register_backend(name: String, backend: &'static dyn MemoryBackend) {
    let mut backends = NAMED_BACKENDS.lock().unwrap();

    backends.insert(name, backend);
}

/// Returns the backend for the given `name`, if one exists, or the
/// default simulated backend if `name` is `None`.
///
/// # Errors
///
/// Returns `Err` if no such backend is defined.
pub fn get_backend(name: Option<&str>) -> Result<&'static dyn MemoryBackend, &'static str> {
    lazy_static::lazy_static! {
        static ref DEFAULT_BACKEND: SimBackend = SimBackend::new();
    }

    match name {
        Some(key) => {
            let backends = NAMED_BACKENDS.lock().unwrap();

            Ok(*backends.get(key).ok_or("memory backend not found")?)
        }
        None => Ok(&*DEFAULT_BACKEND),
    }
}

/// Operation counters a test can snapshot.
#[derive(Default, Debug)]
pub struct SimCounters {
    pub reserves: AtomicUsize,
    pub unreserves: AtomicUsize,
    pub commits: AtomicUsize,
    pub committed_bytes: AtomicUsize,
    pub uncommits: AtomicUsize,
    pub uncommitted_bytes: AtomicUsize,
    pub maps: AtomicUsize,
    pub unmaps: AtomicUsize,
}

#[derive(Default)]
struct SimState {
    /// Reserved offset ranges: start -> size.
    reserved: BTreeMap<u64, usize>,
    /// Ranges `reserve` refuses, for carving up the address space in
    /// reservation tests.
    denied: Vec<(u64, usize)>,
    /// Committed backing segments.
    committed: BTreeSet<u32>,
    /// granule offset -> backing segment index.
    mappings: BTreeMap<u64, u32>,
    /// When set, total bytes `commit` will still accept.
    commit_budget: Option<usize>,
    /// NUMA pinning recorded by `numa_make_local`; granule -> node.
    numa_locality: BTreeMap<u64, u32>,
}

/// A fully-tracking simulated backend.  It never talks to the OS; it
/// verifies the caller's reserve/commit/map protocol instead, and
/// supports the failure injection the allocator's retry paths need.
pub struct SimBackend {
    state: Mutex<SimState>,
    counters: SimCounters,
    placeholders: Option<Arc<PlaceholderSpace>>,
}

impl fmt::Debug for SimBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimBackend")
            .field("placeholders", &self.placeholders.is_some())
            .finish()
    }
}

impl Default for SimBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBackend {
    pub fn new() -> Self {
        SimBackend {
            state: Mutex::new(Default::default()),
            counters: Default::default(),
            placeholders: None,
        }
    }

    /// A backend that models placeholder-style reservations; every
    /// range mutation in the allocator must keep placeholders in sync.
    pub fn with_placeholders() -> Self {
        SimBackend {
            state: Mutex::new(Default::default()),
            counters: Default::default(),
            placeholders: Some(PlaceholderSpace::new()),
        }
    }

    pub fn counters(&self) -> &SimCounters {
        &self.counters
    }

    pub fn placeholder_space(&self) -> Option<&Arc<PlaceholderSpace>> {
        self.placeholders.as_ref()
    }

    /// Makes `reserve` fail for any range overlapping
    /// `[start, start + size)`.
    pub fn deny_range(&self, start: Offset, size: usize) {
        let mut state = self.state.lock().unwrap();
        state.denied.push((start.raw(), size));
    }

    /// Caps the total bytes future commits may succeed for.  `0`
    /// makes the next commit fail outright.
    pub fn set_commit_budget(&self, bytes: usize) {
        let mut state = self.state.lock().unwrap();
        state.commit_budget = Some(bytes);
    }

    pub fn clear_commit_budget(&self) {
        let mut state = self.state.lock().unwrap();
        state.commit_budget = None;
    }

    pub fn committed_bytes(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.committed.len() * GRANULE_SIZE
    }

    pub fn mapped_granules(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.mappings.len()
    }

    /// The backing segment mapped at `offset`, if any.
    pub fn mapping_at(&self, offset: Offset) -> Option<BackingIndex> {
        let state = self.state.lock().unwrap();
        state
            .mappings
            .get(&offset.raw())
            .map(|raw| BackingIndex::new(*raw))
    }

    fn overlaps(ranges: impl Iterator<Item = (u64, usize)>, start: u64, size: usize) -> bool {
        let end = start + size as u64;
        for (other_start, other_size) in ranges {
            let other_end = other_start + other_size as u64;
            if start < other_end && other_start < end {
                return true;
            }
        }
        false
    }
}

impl MemoryBackend for SimBackend {
    fn reservation(&self) -> ReservationBackend {
        match &self.placeholders {
            Some(space) => ReservationBackend::Placeholder(Arc::clone(space)),
            None => ReservationBackend::Flat,
        }
    }

    fn reserve(&self, start: Offset, size: usize) -> bool {
        assert!(size > 0 && size % GRANULE_SIZE == 0, "bad reservation size");

        let mut state = self.state.lock().unwrap();
        self.counters.reserves.fetch_add(1, Ordering::Relaxed);

        if Self::overlaps(state.denied.iter().copied(), start.raw(), size)
            || Self::overlaps(
                state.reserved.iter().map(|(s, z)| (*s, *z)),
                start.raw(),
                size,
            )
        {
            return false;
        }

        state.reserved.insert(start.raw(), size);
        if let Some(space) = &self.placeholders {
            space.on_reserve(start, size);
        }
        true
    }

    fn unreserve(&self, start: Offset, size: usize) {
        let mut state = self.state.lock().unwrap();
        self.counters.unreserves.fetch_add(1, Ordering::Relaxed);

        // The range may cover several reservations that were coalesced
        // into one listed range; they must tile it exactly.
        let end = start.raw() + size as u64;
        let mut cursor = start.raw();
        while cursor < end {
            let piece = state
                .reserved
                .remove(&cursor)
                .expect("unreserve must match whole reservations");
            cursor += piece as u64;
        }
        assert_eq!(cursor, end, "unreserve must match whole reservations");

        if let Some(space) = &self.placeholders {
            space.on_unreserve(start, size);
        }
    }

    fn commit(&self, index: BackingIndex, size: usize, _numa_id: u32) -> usize {
        assert!(size % GRANULE_SIZE == 0, "bad commit size");

        let mut state = self.state.lock().unwrap();
        self.counters.commits.fetch_add(1, Ordering::Relaxed);

        let num_granules = size >> GRANULE_SIZE_SHIFT;
        let mut committed = 0;
        for i in 0..num_granules {
            if let Some(budget) = state.commit_budget {
                if budget < GRANULE_SIZE {
                    break;
                }
                state.commit_budget = Some(budget - GRANULE_SIZE);
            }

            let segment = index.raw() as u32 + i as u32;
            let inserted = state.committed.insert(segment);
            assert!(inserted, "segment committed twice");
            committed += GRANULE_SIZE;
        }

        self.counters
            .committed_bytes
            .fetch_add(committed, Ordering::Relaxed);
        committed
    }

    fn uncommit(&self, index: BackingIndex, size: usize) -> usize {
        let mut state = self.state.lock().unwrap();
        self.counters.uncommits.fetch_add(1, Ordering::Relaxed);

        let num_granules = size >> GRANULE_SIZE_SHIFT;
        for i in 0..num_granules {
            let segment = index.raw() as u32 + i as u32;
            let removed = state.committed.remove(&segment);
            assert!(removed, "uncommit of an uncommitted segment");
        }

        self.counters
            .uncommitted_bytes
            .fetch_add(size, Ordering::Relaxed);
        size
    }

    fn map(&self, offset: Offset, index: BackingIndex, size: usize) {
        let mut state = self.state.lock().unwrap();
        self.counters.maps.fetch_add(1, Ordering::Relaxed);

        let num_granules = size >> GRANULE_SIZE_SHIFT;
        for i in 0..num_granules {
            let granule = offset.raw() + (i * GRANULE_SIZE) as u64;
            let segment = index.raw() as u32 + i as u32;

            assert!(
                state.committed.contains(&segment),
                "mapping an uncommitted segment"
            );
            let previous = state.mappings.insert(granule, segment);
            assert!(previous.is_none(), "double mapping at {:#x}", granule);
        }
    }

    fn unmap(&self, offset: Offset, size: usize) {
        let mut state = self.state.lock().unwrap();
        self.counters.unmaps.fetch_add(1, Ordering::Relaxed);

        let num_granules = size >> GRANULE_SIZE_SHIFT;
        for i in 0..num_granules {
            let granule = offset.raw() + (i * GRANULE_SIZE) as u64;
            let removed = state.mappings.remove(&granule);
            assert!(removed.is_some(), "unmap of an unmapped granule");
        }
    }

    fn numa_make_local(&self, offset: Offset, size: usize, numa_id: u32) {
        let mut state = self.state.lock().unwrap();

        let num_granules = size >> GRANULE_SIZE_SHIFT;
        for i in 0..num_granules {
            let granule = offset.raw() + (i * GRANULE_SIZE) as u64;
            state.numa_locality.insert(granule, numa_id);
        }
    }

    fn memory_numa_id(&self, offset: Offset) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state.numa_locality.get(&offset.raw()).copied()
    }
}
