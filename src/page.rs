//! The page handle handed to callers, and the small vocabulary types
//! describing it: page type, age, generation, allocation flags.
use bitflags::bitflags;

use crate::range::VirtualRange;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageType {
    Small,
    Medium,
    Large,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum GenerationId {
    Young = 0,
    Old = 1,
}

pub const NUM_GENERATIONS: usize = 2;

/// A page's age: how many collections the contents have survived.
/// `OLD` marks pages allocated directly in (or promoted to) the old
/// generation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct PageAge(u8);

impl PageAge {
    pub const EDEN: PageAge = PageAge(0);
    pub const OLD: PageAge = PageAge(u8::MAX);

    pub fn survivor(age: u8) -> PageAge {
        debug_assert!(age > 0);
        PageAge(age)
    }

    pub fn generation_id(self) -> GenerationId {
        if self == PageAge::OLD {
            GenerationId::Old
        } else {
            GenerationId::Young
        }
    }
}

bitflags! {
    pub struct AllocationFlags: u8 {
        /// Fail instead of stalling when memory is exhausted.
        const NON_BLOCKING = 0b0000_0001;
        /// The allocation relocates live objects during GC; excluded
        /// from mutator allocation-rate accounting.
        const GC_RELOCATION = 0b0000_0010;
    }
}

/// Maps each sub-range of a multi-node page back to the node whose
/// capacity backs it; the free path uses it to return memory home.
#[derive(Debug)]
pub struct MultiNumaTracker {
    map: Vec<(VirtualRange, u32)>,
}

impl MultiNumaTracker {
    pub(crate) fn new(map: Vec<(VirtualRange, u32)>) -> Self {
        debug_assert!(!map.is_empty());
        MultiNumaTracker { map }
    }

    pub fn sub_ranges(&self) -> &[(VirtualRange, u32)] {
        &self.map
    }
}

/// A granule-aligned, typed, contiguous virtual range mapped to
/// committed backing, owned by the caller until freed.
#[derive(Debug)]
pub struct Page {
    page_type: PageType,
    virtual_range: VirtualRange,
    generation_id: GenerationId,
    age: PageAge,
    seqnum: u32,
    multi_numa_tracker: Option<MultiNumaTracker>,
}

impl Page {
    pub(crate) fn new(page_type: PageType, virtual_range: VirtualRange) -> Self {
        debug_assert!(!virtual_range.is_null());

        Page {
            page_type,
            virtual_range,
            generation_id: GenerationId::Young,
            age: PageAge::EDEN,
            seqnum: 0,
            multi_numa_tracker: None,
        }
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn virtual_range(&self) -> VirtualRange {
        self.virtual_range
    }

    pub fn size(&self) -> usize {
        self.virtual_range.size()
    }

    pub fn generation_id(&self) -> GenerationId {
        self.generation_id
    }

    pub fn age(&self) -> PageAge {
        self.age
    }

    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    pub fn is_multi_numa(&self) -> bool {
        self.multi_numa_tracker.is_some()
    }

    pub fn multi_numa_tracker(&self) -> Option<&MultiNumaTracker> {
        self.multi_numa_tracker.as_ref()
    }

    pub(crate) fn set_multi_numa_tracker(&mut self, tracker: MultiNumaTracker) {
        debug_assert!(self.multi_numa_tracker.is_none());
        self.multi_numa_tracker = Some(tracker);
    }

    pub(crate) fn take_multi_numa_tracker(&mut self) -> Option<MultiNumaTracker> {
        self.multi_numa_tracker.take()
    }

    /// Stamps age, generation and the generation's sequence number.
    /// Happens after any stall, so the seqnum reflects the world the
    /// caller actually wakes up in.
    pub(crate) fn reset(&mut self, age: PageAge, seqnum: u32) {
        self.age = age;
        self.generation_id = age.generation_id();
        self.seqnum = seqnum;
    }
}
