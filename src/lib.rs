//! granary is the core of a NUMA-aware heap page allocator: it turns a
//! large virtual address reservation plus a pool of physical backing
//! segments into typed, per-generation pages.  Freed pages park in a
//! per-node mapped cache so their OS mappings are reused; allocations
//! that cannot be satisfied stall until a free or a collection makes
//! room; a background worker per node uncommits idle cached memory
//! back to the system.
mod address;
mod allocator;
mod backend;
mod collector;
mod file_backed;
mod granule_map;
mod latch;
mod mapped_cache;
mod numa;
mod page;
mod physical;
mod range;
mod range_list;
mod reservation;
mod safe_delete;
mod settings;
mod uncommitter;
mod virtual_memory;

pub use address::BackingIndex;
pub use address::Offset;
pub use address::TypedOffset;
pub use address::GRANULE_SIZE;
pub use address::GRANULE_SIZE_SHIFT;
pub use allocator::PageAllocator;
pub use allocator::PageAllocatorStats;
pub use backend::register_backend;
pub use backend::MemoryBackend;
pub use backend::SimBackend;
pub use collector::CollectorDriver;
pub use collector::Generations;
pub use collector::NullDriver;
pub use file_backed::set_file_backed_segment_directory;
pub use file_backed::FileBackedBackend;
pub use numa::NumaTopology;
pub use page::AllocationFlags;
pub use page::GenerationId;
pub use page::Page;
pub use page::PageAge;
pub use page::PageType;
pub use range::BackingRange;
pub use range::VirtualRange;
pub use reservation::PlaceholderSpace;
pub use reservation::ReservationBackend;
pub use settings::HeapSettings;
