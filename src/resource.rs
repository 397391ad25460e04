//! Resource contract consumed by the cache.
//!
//! The cache never talks to a GPU driver. It owns caller-provided objects
//! implementing [`GpuResource`] and invokes the contract when it needs the
//! object's byte cost, its pending-I/O status for scratch lookups, or its
//! teardown (`release` on normal eviction, `abandon` when the underlying
//! context is already gone).

use crate::key::ScratchKey;

/// Contract every cached object must satisfy.
///
/// Implementations are plain wrappers around externally allocated GPU
/// objects. The cache calls `release` when it evicts or shuts down normally
/// and `abandon` when the GPU context has been lost and the allocation must
/// be forgotten without touching the device.
pub trait GpuResource {
    /// Current byte cost of the GPU allocation.
    ///
    /// May change over the resource's lifetime, but every change must be
    /// announced through
    /// [`ResourceCache::did_change_gpu_memory_size`](crate::cache::ResourceCache::did_change_gpu_memory_size)
    /// so the cache's byte totals stay accurate.
    fn gpu_memory_size(&self) -> usize;

    /// True while device work against the resource is still in flight.
    ///
    /// Only consulted by scratch lookups that prefer or require idle
    /// resources.
    fn has_pending_io(&self) -> bool {
        false
    }

    /// Destroys the GPU allocation.
    fn release(&mut self);

    /// Forgets the GPU allocation without touching the GPU.
    fn abandon(&mut self);
}

/// Insert-time description of a resource's cache-relevant properties.
///
/// `Default` is a budgeted, non-wrapped resource with no scratch key.
///
/// # Example
///
/// ```
/// use rescache::key::{ResourceType, ScratchKey};
/// use rescache::resource::ResourceDesc;
///
/// let ty = ResourceType::generate();
/// let desc = ResourceDesc::default().with_scratch_key(ScratchKey::new(ty, &[64, 64]));
/// assert!(desc.budgeted);
/// assert!(!desc.wrapped);
/// ```
#[derive(Debug, Clone)]
pub struct ResourceDesc {
    /// Coarse reuse identity. Immutable once the resource is inserted.
    /// Wrapped resources must not carry one.
    pub scratch_key: Option<ScratchKey>,
    /// Whether the resource counts against the cache's budget.
    pub budgeted: bool,
    /// Wrapped resources borrow external storage; they are never budgeted
    /// and never scratch-eligible.
    pub wrapped: bool,
}

impl Default for ResourceDesc {
    fn default() -> Self {
        Self {
            scratch_key: None,
            budgeted: true,
            wrapped: false,
        }
    }
}

impl ResourceDesc {
    /// Description of a wrapped resource (un-budgeted, no scratch key).
    pub fn wrapped() -> Self {
        Self {
            scratch_key: None,
            budgeted: false,
            wrapped: true,
        }
    }

    /// Attaches a scratch key.
    pub fn with_scratch_key(mut self, key: ScratchKey) -> Self {
        self.scratch_key = Some(key);
        self
    }

    /// Marks the resource un-budgeted.
    pub fn unbudgeted(mut self) -> Self {
        self.budgeted = false;
        self
    }
}
