//! Heap sizing and behavior knobs.  Settings are plain data: build one,
//! optionally layer `GRANARY_*` environment overrides on top, validate,
//! and hand it to the allocator.
use std::time::Duration;

use crate::address::is_granule_aligned;
use crate::address::ADDRESS_OFFSET_MAX;
use crate::address::GRANULE_SIZE;
use crate::address::GRANULE_SIZE_SHIFT;
use crate::numa::NumaTopology;

#[derive(Clone, Debug)]
pub struct HeapSettings {
    /// Capacity floor the uncommitter must retain, in bytes.
    pub min_capacity: usize,
    /// Capacity committed and cached up front by `prime_cache`.
    pub initial_capacity: usize,
    /// Soft ceiling reported to the collector's heuristics.
    pub soft_max_capacity: usize,
    /// Hard capacity ceiling, in bytes.
    pub max_capacity: usize,

    /// Master switch for returning idle memory to the system.
    pub uncommit: bool,
    /// Minimum idle period before memory becomes eligible for uncommit.
    pub uncommit_delay: Duration,

    /// Virtual reservation size as a multiple of `max_capacity`.
    pub virtual_to_physical_ratio: usize,
    /// Bounds the divide-and-conquer discontiguous reservation: no
    /// fragment smaller than `max_capacity / max_virtual_reservations`
    /// is accepted.
    pub max_virtual_reservations: usize,

    /// Touch every committed granule at commit time.
    pub always_pretouch: bool,

    pub numa: NumaTopology,

    /// When nonzero, the medium page size; it becomes the first mapped
    /// cache size class.  Zero disables medium pages.
    pub medium_page_size: usize,

    /// Named memory backend to allocate through; `None` selects the
    /// default backend.
    pub backend: Option<String>,
}

impl Default for HeapSettings {
    fn default() -> Self {
        HeapSettings {
            min_capacity: 8 * GRANULE_SIZE,
            initial_capacity: 16 * GRANULE_SIZE,
            soft_max_capacity: 128 * GRANULE_SIZE,
            max_capacity: 128 * GRANULE_SIZE,
            uncommit: true,
            uncommit_delay: Duration::from_secs(300),
            virtual_to_physical_ratio: 16,
            max_virtual_reservations: 100,
            always_pretouch: false,
            numa: NumaTopology::disabled(),
            medium_page_size: 16 * GRANULE_SIZE,
            backend: None,
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.parse().ok()
}

fn env_bool(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

impl HeapSettings {
    /// The compile-time granule shift, surfaced here because sizing
    /// options are granule-denominated.
    pub fn granule_size_shift(&self) -> u32 {
        GRANULE_SIZE_SHIFT
    }

    /// Layers `GRANARY_*` environment variables over `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(value) = env_usize("GRANARY_MIN_CAPACITY") {
            self.min_capacity = value;
        }
        if let Some(value) = env_usize("GRANARY_INITIAL_CAPACITY") {
            self.initial_capacity = value;
        }
        if let Some(value) = env_usize("GRANARY_SOFT_MAX_CAPACITY") {
            self.soft_max_capacity = value;
        }
        if let Some(value) = env_usize("GRANARY_MAX_CAPACITY") {
            self.max_capacity = value;
        }
        if let Some(value) = env_bool("GRANARY_UNCOMMIT") {
            self.uncommit = value;
        }
        if let Some(value) = env_usize("GRANARY_UNCOMMIT_DELAY_SECONDS") {
            self.uncommit_delay = Duration::from_secs(value as u64);
        }
        if let Some(value) = env_usize("GRANARY_VIRTUAL_TO_PHYSICAL_RATIO") {
            self.virtual_to_physical_ratio = value;
        }
        if let Some(value) = env_usize("GRANARY_MAX_VIRTUAL_RESERVATIONS") {
            self.max_virtual_reservations = value;
        }
        if let Some(value) = env_bool("GRANARY_ALWAYS_PRETOUCH") {
            self.always_pretouch = value;
        }
        if let Some(value) = env_usize("GRANARY_NUMA_NODE_COUNT") {
            self.numa = NumaTopology::new(value as u32);
        }
        if let Some(value) = env_usize("GRANARY_MEDIUM_PAGE_SIZE") {
            self.medium_page_size = value;
        }
        if let Ok(value) = std::env::var("GRANARY_BACKEND") {
            self.backend = if value.is_empty() { None } else { Some(value) };
        }

        self
    }

    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_capacity == 0 {
            return Err("max_capacity must be non-zero");
        }
        if !is_granule_aligned(self.min_capacity)
            || !is_granule_aligned(self.initial_capacity)
            || !is_granule_aligned(self.soft_max_capacity)
            || !is_granule_aligned(self.max_capacity)
        {
            return Err("capacities must be granule aligned");
        }
        if self.min_capacity > self.initial_capacity || self.initial_capacity > self.max_capacity {
            return Err("capacities must satisfy min <= initial <= max");
        }
        if self.soft_max_capacity > self.max_capacity {
            return Err("soft_max_capacity must not exceed max_capacity");
        }
        if self.virtual_to_physical_ratio == 0 {
            return Err("virtual_to_physical_ratio must be at least 1");
        }
        if self.max_virtual_reservations == 0 {
            return Err("max_virtual_reservations must be at least 1");
        }
        if self.medium_page_size != 0
            && (!is_granule_aligned(self.medium_page_size) || self.medium_page_size <= GRANULE_SIZE)
        {
            return Err("medium_page_size must be a multiple of at least two granules");
        }
        if (self.max_capacity as u64) > ADDRESS_OFFSET_MAX {
            return Err("max_capacity exceeds the addressable offset space");
        }

        Ok(())
    }
}
