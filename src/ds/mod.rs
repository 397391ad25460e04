pub mod indexed_heap;
pub mod multimap;
pub mod slot_arena;
pub mod tracked_array;

pub use indexed_heap::IndexedMinHeap;
pub use multimap::PredicateMultimap;
pub use slot_arena::{SlotArena, SlotId};
pub use tracked_array::TrackedArray;
