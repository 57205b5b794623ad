//! The seam to the garbage collector: asynchronous collection requests
//! and the per-generation sequence numbers stalled allocations use to
//! tell which collections they have already observed.
use std::fmt;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use crate::page::GenerationId;
use crate::page::NUM_GENERATIONS;

/// Asynchronous collection requests.  Implementations schedule work
/// and return immediately; completion is reported back through
/// `handle_alloc_stalling_for_young` / `handle_alloc_stalling_for_old`.
pub trait CollectorDriver: Send + Sync {
    fn collect_minor(&self);
    fn collect_major(&self);
}

/// A driver that drops requests on the floor.  Suits embedders that
/// poll allocator state instead, and non-blocking-only workloads.
#[derive(Debug, Default)]
pub struct NullDriver;

impl CollectorDriver for NullDriver {
    fn collect_minor(&self) {}

    fn collect_major(&self) {}
}

/// Monotonic per-generation collection counters.  The embedder bumps a
/// generation's seqnum when a collection of that generation starts;
/// snapshots taken at request creation then reveal whether a request
/// has seen a complete cycle.
pub struct Generations {
    seqnums: [AtomicU32; NUM_GENERATIONS],
}

impl fmt::Debug for Generations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generations")
            .field("young", &self.seqnum(GenerationId::Young))
            .field("old", &self.seqnum(GenerationId::Old))
            .finish()
    }
}

impl Default for Generations {
    fn default() -> Self {
        Self::new()
    }
}

impl Generations {
    pub fn new() -> Self {
        // Start at one so zero never looks like a live seqnum.
        Generations {
            seqnums: [AtomicU32::new(1), AtomicU32::new(1)],
        }
    }

    pub fn seqnum(&self, id: GenerationId) -> u32 {
        self.seqnums[id as usize].load(Ordering::Acquire)
    }

    /// Marks the start of a collection of `id`; returns the new
    /// seqnum.
    pub fn advance(&self, id: GenerationId) -> u32 {
        self.seqnums[id as usize].fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[test]
fn seqnums_advance_independently() {
    let generations = Generations::new();

    let young_before = generations.seqnum(GenerationId::Young);
    generations.advance(GenerationId::Young);

    assert_eq!(generations.seqnum(GenerationId::Young), young_before + 1);
    assert_eq!(generations.seqnum(GenerationId::Old), 1);
}
