pub use crate::cache::{
    ResourceCache, ResourceId, ScratchConstraint, DEFAULT_MAX_BYTES, DEFAULT_MAX_COUNT,
};
pub use crate::ds::{IndexedMinHeap, PredicateMultimap, SlotArena, SlotId, TrackedArray};
pub use crate::error::InvariantError;
pub use crate::invalidation::{InvalidationBus, UniqueKeyInvalidatedMessage};
pub use crate::key::{ResourceType, ScratchKey, UniqueKey, UniqueKeyDomain};
pub use crate::resource::{GpuResource, ResourceDesc};
pub use crate::stats::CacheStatsSnapshot;
