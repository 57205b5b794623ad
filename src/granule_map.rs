//! A flat table with one slot per granule of the heap's virtual offset
//! space, holding the backing segment index currently mapped at that
//! granule.  Slots are relaxed atomics: a slot is written either under
//! the allocator lock (for in-flight claims) or by the thread that owns
//! the corresponding range, and read freely by owners.
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;

use crate::address::BackingIndex;
use crate::address::Offset;
use crate::address::TypedOffset;
use crate::address::GRANULE_SIZE_SHIFT;
use crate::range::VirtualRange;

const UNMAPPED: u32 = u32::MAX;

pub struct GranuleMap {
    slots: Box<[AtomicU32]>,
}

impl GranuleMap {
    /// Builds a map covering `max_offset` bytes of virtual offset space.
    pub fn new(max_offset: u64) -> Self {
        let num_slots = (max_offset >> GRANULE_SIZE_SHIFT) as usize;
        let mut slots = Vec::with_capacity(num_slots);
        slots.resize_with(num_slots, || AtomicU32::new(UNMAPPED));

        GranuleMap {
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline(always)]
    pub fn get(&self, offset: Offset) -> BackingIndex {
        let raw = self.slots[offset.granule_index()].load(Ordering::Relaxed);
        BackingIndex::from_raw(raw as u64)
    }

    #[inline(always)]
    pub fn set(&self, offset: Offset, index: BackingIndex) {
        self.slots[offset.granule_index()].store(index.raw() as u32, Ordering::Relaxed);
    }

    /// Reads the slots covering `vmem`, in address order.
    pub fn read(&self, vmem: &VirtualRange) -> Vec<BackingIndex> {
        let base = vmem.start().granule_index();
        (0..vmem.size_in_granules())
            .map(|i| BackingIndex::from_raw(self.slots[base + i].load(Ordering::Relaxed) as u64))
            .collect()
    }

    /// Writes `indices` into the slots covering `vmem`'s prefix.
    pub fn write(&self, start: Offset, indices: &[BackingIndex]) {
        let base = start.granule_index();
        for (i, index) in indices.iter().enumerate() {
            self.slots[base + i].store(index.raw() as u32, Ordering::Relaxed);
        }
    }

    /// Copies the slots covering `from` to the slots starting at `to`.
    pub fn copy(&self, to: Offset, from: &VirtualRange) {
        let src = from.start().granule_index();
        let dst = to.granule_index();
        for i in 0..from.size_in_granules() {
            let value = self.slots[src + i].load(Ordering::Relaxed);
            self.slots[dst + i].store(value, Ordering::Relaxed);
        }
    }

    /// Sorts the slots covering `vmem` ascending, so mapping can walk
    /// long consecutive runs.
    pub fn sort_range(&self, vmem: &VirtualRange) {
        let mut indices = self.read(vmem);
        indices.sort();
        self.write(vmem.start(), &indices);
    }
}
