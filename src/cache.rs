//! Budgeted GPU resource cache with scratch and unique key reuse.
//!
//! `ResourceCache` owns externally allocated graphics objects and lets
//! callers reuse compatible ones across frames under fixed byte and count
//! budgets. Eviction is approximate LRU: every stamp-worthy event (insert,
//! lookup hit) assigns a monotonic timestamp, and budget pressure releases
//! the purgeable resource with the smallest one.
//!
//! ## Architecture
//!
//! ```text
//!   ┌───────────────────────────────────────────────────────────────────┐
//!   │                        ResourceCache<R>                           │
//!   │                                                                   │
//!   │   entries: SlotArena<Entry<R>>        (owns every resource)       │
//!   │   ┌──────────┬──────────────────────────────────────────────┐     │
//!   │   │ResourceId│ Entry { resource, size, refs, budgeted,      │     │
//!   │   │          │         wrapped, scratch/unique key,         │     │
//!   │   │          │         timestamp, index }                   │     │
//!   │   └──────────┴──────────────────────────────────────────────┘     │
//!   │                                                                   │
//!   │   nonpurgeable: TrackedArray<ResourceId>   (refs > 0)             │
//!   │   purgeable:    IndexedMinHeap<u32, ResourceId>  (refs == 0,      │
//!   │                 min timestamp on top = next eviction victim)      │
//!   │                                                                   │
//!   │   scratch_map:  ScratchKey  →  {ResourceId, ...}  (multimap)      │
//!   │   unique_hash:  UniqueKey   →  ResourceId         (one-to-one)    │
//!   │                                                                   │
//!   │   budgets: max_count / max_bytes, budgeted totals, over-budget    │
//!   │   callback invoked once when purging alone cannot reach budget    │
//!   └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Resource lifecycle
//!
//! ```text
//!   insert ──► non-purgeable (creator holds the first reference)
//!                  │  unref to zero
//!                  ▼
//!              purgeable ──► rescued into budget (un-budgeted scratch
//!                  │          with headroom)
//!                  │     ──► kept for reuse (budgeted, keyed, within
//!                  │          budget)
//!                  │     ──► released immediately (over budget or keyless)
//!                  │  find_and_ref_* hit
//!                  ▼
//!              non-purgeable again, restamped MRU
//! ```
//!
//! Every entry stores its current position in whichever container holds it
//! (the back-index slot), so moving between containers and evicting from
//! the middle of the heap never scans.
//!
//! ## Core Operations
//!
//! | Method                          | Complexity | Description                         |
//! |---------------------------------|------------|-------------------------------------|
//! | `insert(resource, desc)`        | O(log n)   | Adopt a resource, charge budget     |
//! | `find_and_ref_scratch_resource` | O(bucket)  | Reuse a compatible scratch resource |
//! | `find_and_ref_unique_resource`  | O(1) avg   | Look up by unique key               |
//! | `ref_resource` / `unref_resource` | O(log n) | External reference bookkeeping      |
//! | `change_unique_key`             | O(1) avg   | Install/steal a unique key          |
//! | `set_budgeted`                  | O(log n)   | Toggle budget participation         |
//! | `did_change_gpu_memory_size`    | O(log n)   | Re-charge after a size change       |
//! | `purge_all_unlocked`            | O(n log n) | Drop every purgeable resource       |
//! | `release_all` / `abandon_all`   | O(n log n) | Tear down the whole cache           |
//! | `process_invalid_unique_keys`   | O(batch)   | Drop externally invalidated keys    |
//!
//! ## Timestamps
//!
//! Timestamps are 32-bit and wrap. When the counter reads zero with a
//! non-empty cache, all live timestamps are compacted to `0, 1, 2, …` in
//! their existing relative order, so unsigned comparison stays correct
//! across the wrap.
//!
//! ## Thread Safety
//!
//! A cache instance is single-owner: every operation, including the
//! over-budget callback, runs synchronously on the owning thread. Only the
//! [`InvalidationBus`] may be fed from other threads.

use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::ds::{IndexedMinHeap, PredicateMultimap, SlotArena, SlotId, TrackedArray};
#[cfg(any(test, debug_assertions))]
use crate::error::InvariantError;
use crate::invalidation::{InvalidationBus, UniqueKeyInvalidatedMessage};
use crate::key::{ScratchKey, UniqueKey};
use crate::resource::{GpuResource, ResourceDesc};
use crate::stats::{CacheStatsSnapshot, StatCounters};

/// Default resource count budget.
pub const DEFAULT_MAX_COUNT: usize = 2 * (1 << 10);
/// Default resource byte budget (96 MiB).
pub const DEFAULT_MAX_BYTES: usize = 96 * (1 << 20);

/// Handle to a cached resource.
///
/// Handles go stale once the resource leaves the cache; using a stale
/// handle in any cache operation is a contract violation and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(SlotId);

/// Pending-I/O constraint for scratch lookups.
///
/// Callers that would have to synchronize with in-flight device work
/// before reusing a resource can prefer or require an idle candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScratchConstraint {
    /// Any available scratch resource qualifies.
    #[default]
    None,
    /// Prefer a resource without pending I/O; fall back to any.
    PreferNoPendingIo,
    /// Only accept a resource without pending I/O.
    RequireNoPendingIo,
}

type OverBudgetCallback<R> = Box<dyn FnMut(&mut ResourceCache<R>)>;

struct Entry<R> {
    resource: R,
    size: usize,
    refs: u32,
    budgeted: bool,
    wrapped: bool,
    scratch_key: Option<ScratchKey>,
    unique_key: Option<UniqueKey>,
    timestamp: u32,
    // Position in whichever container holds the entry; -1 while detached.
    index: i32,
}

impl<R> Entry<R> {
    fn is_scratch(&self) -> bool {
        self.budgeted && self.scratch_key.is_some() && self.unique_key.is_none()
    }
}

#[derive(Debug, Default)]
struct UniqueHash {
    map: FxHashMap<UniqueKey, ResourceId>,
}

impl UniqueHash {
    fn find(&self, key: &UniqueKey) -> Option<ResourceId> {
        self.map.get(key).copied()
    }

    fn insert(&mut self, key: UniqueKey, id: ResourceId) {
        let previous = self.map.insert(key, id);
        debug_assert!(previous.is_none(), "unique key already mapped");
    }

    fn remove(&mut self, key: &UniqueKey) -> Option<ResourceId> {
        self.map.remove(key)
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Budgeted cache of externally allocated GPU resources.
///
/// See the [module documentation](self) for the architecture and lifecycle.
pub struct ResourceCache<R: GpuResource> {
    entries: SlotArena<Entry<R>>,
    nonpurgeable: TrackedArray<ResourceId>,
    purgeable: IndexedMinHeap<u32, ResourceId>,
    scratch_map: PredicateMultimap<ScratchKey, ResourceId>,
    unique_hash: UniqueHash,

    timestamp: u32,
    max_count: usize,
    max_bytes: usize,
    bytes: usize,
    budgeted_count: usize,
    budgeted_bytes: usize,

    stats: StatCounters,
    over_budget_cb: Option<OverBudgetCallback<R>>,

    #[cfg(debug_assertions)]
    validate_seed: u32,
}

impl<R: GpuResource> ResourceCache<R> {
    /// Creates a cache with the default limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_COUNT, DEFAULT_MAX_BYTES)
    }

    /// Creates a cache with the given count and byte budgets.
    pub fn with_limits(max_count: usize, max_bytes: usize) -> Self {
        Self {
            entries: SlotArena::new(),
            nonpurgeable: TrackedArray::new(),
            purgeable: IndexedMinHeap::new(),
            scratch_map: PredicateMultimap::new(),
            unique_hash: UniqueHash::default(),
            timestamp: 0,
            max_count,
            max_bytes,
            bytes: 0,
            budgeted_count: 0,
            budgeted_bytes: 0,
            stats: StatCounters::default(),
            over_budget_cb: None,
            #[cfg(debug_assertions)]
            validate_seed: 0x9e37_79b9,
        }
    }

    // -----------------------------------------------------------------
    // Insertion and reference bookkeeping
    // -----------------------------------------------------------------

    /// Adopts `resource` into the cache and returns its handle.
    ///
    /// The creator's external reference is manifest as the entry's initial
    /// refcount, so a freshly inserted resource is never purgeable. Panics
    /// if the description pairs `wrapped` with a scratch key or with
    /// budget participation.
    pub fn insert(&mut self, resource: R, desc: ResourceDesc) -> ResourceId {
        let ResourceDesc {
            scratch_key,
            budgeted,
            wrapped,
        } = desc;
        assert!(
            !(wrapped && scratch_key.is_some()),
            "wrapped resources cannot carry a scratch key"
        );
        assert!(!(wrapped && budgeted), "wrapped resources are never budgeted");

        let size = resource.gpu_memory_size();
        // Stamp before the entry joins the containers so a wrap compaction
        // only walks resources that already have timestamps.
        let timestamp = self.next_timestamp();
        let id = ResourceId(self.entries.insert(Entry {
            resource,
            size,
            refs: 1,
            budgeted,
            wrapped,
            scratch_key: scratch_key.clone(),
            unique_key: None,
            timestamp,
            index: -1,
        }));
        self.add_to_nonpurgeable(id);

        self.bytes += size;
        self.stats
            .update_resource_high_water(self.entries.len(), self.bytes);
        if budgeted {
            self.budgeted_count += 1;
            self.budgeted_bytes += size;
            self.stats
                .update_budgeted_high_water(self.budgeted_count, self.budgeted_bytes);
        }
        if let Some(key) = scratch_key {
            self.scratch_map.insert(key, id);
        }
        trace!(?id, size, budgeted, wrapped, "inserted resource");

        self.purge_as_needed();
        self.validate();
        id
    }

    /// Takes an additional external reference on an already-referenced
    /// resource.
    ///
    /// Fresh references to purgeable resources must come from the lookup
    /// paths, which also restamp; panics otherwise.
    pub fn ref_resource(&mut self, id: ResourceId) {
        let entry = self.entry_mut(id);
        assert!(
            entry.refs > 0,
            "cannot take a fresh reference to a purgeable resource"
        );
        entry.refs += 1;
    }

    /// Drops one external reference.
    ///
    /// Dropping the last reference runs the purgeable transition: the
    /// resource moves to the purgeable heap and is then rescued into the
    /// budget, kept for reuse, or released immediately.
    pub fn unref_resource(&mut self, id: ResourceId) {
        let entry = self.entry_mut(id);
        assert!(entry.refs > 0, "unbalanced unref");
        entry.refs -= 1;
        if entry.refs == 0 {
            self.notify_purgeable(id);
        }
        self.validate();
    }

    fn notify_purgeable(&mut self, id: ResourceId) {
        debug_assert_eq!(self.entry(id).refs, 0);
        self.remove_from_nonpurgeable(id);
        self.push_purgeable(id);

        let (budgeted, wrapped, has_scratch_key, has_unique_key, size) = {
            let entry = self.entry(id);
            (
                entry.budgeted,
                entry.wrapped,
                entry.scratch_key.is_some(),
                entry.unique_key.is_some(),
                entry.size,
            )
        };

        if !budgeted {
            // An un-budgeted resource that can still serve scratch work is
            // adopted into the budget when there is headroom; we never
            // purge an existing resource to make room for it.
            if !wrapped
                && has_scratch_key
                && self.budgeted_count < self.max_count
                && self.budgeted_bytes + size <= self.max_bytes
            {
                self.set_budgeted(id, true);
                return;
            }
        } else {
            let keyless = !has_scratch_key && !has_unique_key;
            if !self.over_budget() && !keyless {
                return;
            }
        }

        debug!(?id, size, "releasing newly purgeable resource");
        self.release_resource(id);
    }

    // -----------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------

    /// Finds a reusable scratch resource for `key`, promotes it to
    /// non-purgeable MRU, and returns its handle.
    ///
    /// With [`ScratchConstraint::PreferNoPendingIo`] an idle candidate is
    /// tried first before falling back to any candidate; with
    /// [`ScratchConstraint::RequireNoPendingIo`] only idle candidates
    /// qualify.
    pub fn find_and_ref_scratch_resource(
        &mut self,
        key: &ScratchKey,
        constraint: ScratchConstraint,
    ) -> Option<ResourceId> {
        self.stats.scratch_searches += 1;
        let found = match constraint {
            ScratchConstraint::None => self.find_scratch(key, false),
            ScratchConstraint::PreferNoPendingIo => self
                .find_scratch(key, true)
                .or_else(|| self.find_scratch(key, false)),
            ScratchConstraint::RequireNoPendingIo => self.find_scratch(key, true),
        };
        if let Some(id) = found {
            self.stats.scratch_hits += 1;
            self.ref_and_make_mru(id);
            self.validate();
        }
        found
    }

    fn find_scratch(&self, key: &ScratchKey, reject_pending_io: bool) -> Option<ResourceId> {
        let Self {
            scratch_map,
            entries,
            ..
        } = self;
        scratch_map.find(key, |id| {
            let entry = entries.get(id.0).expect("scratch map holds unknown resource");
            if entry.refs > 0 || !entry.is_scratch() {
                return false;
            }
            !reject_pending_io || !entry.resource.has_pending_io()
        })
    }

    /// Finds the resource cached under `key`, promotes it to non-purgeable
    /// MRU, and returns its handle.
    pub fn find_and_ref_unique_resource(&mut self, key: &UniqueKey) -> Option<ResourceId> {
        self.stats.unique_searches += 1;
        let id = self.unique_hash.find(key)?;
        self.stats.unique_hits += 1;
        self.ref_and_make_mru(id);
        self.validate();
        Some(id)
    }

    fn ref_and_make_mru(&mut self, id: ResourceId) {
        if self.entry(id).refs == 0 {
            self.remove_from_purgeable(id);
            self.add_to_nonpurgeable(id);
        }
        self.entry_mut(id).refs += 1;
        let timestamp = self.next_timestamp();
        self.entry_mut(id).timestamp = timestamp;
    }

    // -----------------------------------------------------------------
    // Unique keys
    // -----------------------------------------------------------------

    /// Installs `new_key` on the resource, stealing it from any current
    /// holder.
    ///
    /// A current holder that has no scratch key and is purgeable becomes
    /// unreachable once it loses the key and is released on the spot;
    /// otherwise it is merely detached. Panics unless the resource is
    /// budgeted and not wrapped.
    pub fn change_unique_key(&mut self, id: ResourceId, new_key: UniqueKey) {
        {
            let entry = self.entry(id);
            assert!(
                entry.budgeted && !entry.wrapped,
                "unique keys require budgeted, non-wrapped resources"
            );
        }

        if let Some(old_key) = self.entry_mut(id).unique_key.take() {
            self.unique_hash.remove(&old_key);
        }

        if let Some(old_id) = self.unique_hash.find(&new_key) {
            debug_assert_ne!(old_id, id);
            let (old_has_scratch_key, old_refs) = {
                let old = self.entry(old_id);
                (old.scratch_key.is_some(), old.refs)
            };
            if !old_has_scratch_key && old_refs == 0 {
                self.release_resource(old_id);
            } else {
                self.unique_hash.remove(&new_key);
                self.entry_mut(old_id).unique_key = None;
            }
        }

        self.entry_mut(id).unique_key = Some(new_key.clone());
        self.unique_hash.insert(new_key, id);
        self.validate();
    }

    /// Clears the resource's unique key, if any.
    ///
    /// Never evicts: if the resource is or later becomes purgeable, the
    /// purgeable transition decides its fate.
    pub fn remove_unique_key(&mut self, id: ResourceId) {
        if let Some(key) = self.entry_mut(id).unique_key.take() {
            self.unique_hash.remove(&key);
        }
        self.validate();
    }

    /// Processes a batch of external invalidation messages.
    ///
    /// Each named resource loses its unique key; messages for unknown keys
    /// are ignored. Dropping the key may leave the resource keyless, in
    /// which case its next purgeable transition releases it.
    pub fn process_invalid_unique_keys(&mut self, msgs: &[UniqueKeyInvalidatedMessage]) {
        for msg in msgs {
            if let Some(id) = self.find_and_ref_unique_resource(msg.key()) {
                self.remove_unique_key(id);
                self.unref_resource(id);
            }
        }
    }

    /// Drains `bus` and processes every pending invalidation.
    pub fn process_invalidation_bus(&mut self, bus: &InvalidationBus) {
        let msgs = bus.drain();
        self.process_invalid_unique_keys(&msgs);
    }

    // -----------------------------------------------------------------
    // Budget
    // -----------------------------------------------------------------

    /// Toggles whether the resource counts against the budget.
    ///
    /// No-op when unchanged. Panics for wrapped resources and for clearing
    /// budget participation while a unique key is held.
    pub fn set_budgeted(&mut self, id: ResourceId, budgeted: bool) {
        let entry = self.entry_mut(id);
        if entry.budgeted == budgeted {
            return;
        }
        assert!(!entry.wrapped, "wrapped resources are never budgeted");
        if !budgeted {
            assert!(
                entry.unique_key.is_none(),
                "resources holding a unique key stay budgeted"
            );
        }
        entry.budgeted = budgeted;
        let size = entry.size;
        if budgeted {
            self.budgeted_count += 1;
            self.budgeted_bytes += size;
            self.stats
                .update_budgeted_high_water(self.budgeted_count, self.budgeted_bytes);
            self.purge_as_needed();
        } else {
            self.budgeted_count -= 1;
            self.budgeted_bytes -= size;
        }
        self.validate();
    }

    /// Re-reads the resource's size and applies the delta to the byte
    /// totals.
    ///
    /// Accepted at any time on the owning thread; growth may trigger
    /// eviction.
    pub fn did_change_gpu_memory_size(&mut self, id: ResourceId) {
        let entry = self.entry_mut(id);
        let new_size = entry.resource.gpu_memory_size();
        let old_size = entry.size;
        entry.size = new_size;
        let budgeted = entry.budgeted;

        if new_size >= old_size {
            self.bytes += new_size - old_size;
        } else {
            self.bytes -= old_size - new_size;
        }
        self.stats
            .update_resource_high_water(self.entries.len(), self.bytes);
        if budgeted {
            if new_size >= old_size {
                self.budgeted_bytes += new_size - old_size;
            } else {
                self.budgeted_bytes -= old_size - new_size;
            }
            self.stats
                .update_budgeted_high_water(self.budgeted_count, self.budgeted_bytes);
        }

        self.purge_as_needed();
        self.validate();
    }

    /// Replaces the count and byte budgets, evicting as needed.
    pub fn set_limits(&mut self, max_count: usize, max_bytes: usize) {
        self.max_count = max_count;
        self.max_bytes = max_bytes;
        self.purge_as_needed();
        self.validate();
    }

    /// Installs the hook invoked when purging alone cannot reach budget.
    ///
    /// The callback runs at most once per purge pass. It receives the
    /// cache and is expected to drop external references, whose purgeable
    /// transitions then evict further.
    pub fn set_over_budget_callback(
        &mut self,
        callback: impl FnMut(&mut ResourceCache<R>) + 'static,
    ) {
        self.over_budget_cb = Some(Box::new(callback));
    }

    /// Removes the over-budget hook.
    pub fn clear_over_budget_callback(&mut self) {
        self.over_budget_cb = None;
    }

    fn over_budget(&self) -> bool {
        self.budgeted_count > self.max_count || self.budgeted_bytes > self.max_bytes
    }

    fn purge_as_needed(&mut self) {
        if self.over_budget() {
            self.internal_purge_as_needed();
        }
    }

    fn internal_purge_as_needed(&mut self) {
        debug_assert!(self.over_budget());

        let mut still_over_budget = true;
        // Re-peek every iteration: each release reshapes the heap.
        while let Some(id) = self.purgeable.peek() {
            debug_assert_eq!(self.entry(id).refs, 0);
            debug!(?id, "evicting for budget");
            self.release_resource(id);
            if !self.over_budget() {
                still_over_budget = false;
                break;
            }
        }
        self.validate();

        if still_over_budget {
            if let Some(mut callback) = self.over_budget_cb.take() {
                debug!(
                    budgeted_count = self.budgeted_count,
                    budgeted_bytes = self.budgeted_bytes,
                    "over budget after purge, invoking callback"
                );
                callback(self);
                // Leaving the slot vacant during the call keeps re-entrant
                // purges from re-invoking the callback.
                if self.over_budget_cb.is_none() {
                    self.over_budget_cb = Some(callback);
                }
                self.validate();
            }
        }
    }

    /// Releases every purgeable resource, regardless of budget.
    ///
    /// Non-purgeable resources are untouched.
    pub fn purge_all_unlocked(&mut self) {
        while let Some(id) = self.purgeable.peek() {
            self.release_resource(id);
        }
        self.validate();
    }

    /// Releases every resource and empties the cache.
    pub fn release_all(&mut self) {
        while let Some(id) = self.nonpurgeable.last() {
            self.release_resource(id);
        }
        while let Some(id) = self.purgeable.peek() {
            self.release_resource(id);
        }
        self.assert_drained();
        self.validate();
    }

    /// Abandons every resource (forgetting GPU allocations) and empties
    /// the cache.
    pub fn abandon_all(&mut self) {
        while let Some(id) = self.nonpurgeable.last() {
            self.abandon_resource(id);
        }
        while let Some(id) = self.purgeable.peek() {
            self.abandon_resource(id);
        }
        self.assert_drained();
        self.validate();
    }

    fn assert_drained(&self) {
        debug_assert!(self.entries.is_empty());
        debug_assert!(self.nonpurgeable.is_empty());
        debug_assert!(self.purgeable.is_empty());
        debug_assert!(self.scratch_map.is_empty());
        debug_assert!(self.unique_hash.is_empty());
        debug_assert_eq!(self.bytes, 0);
        debug_assert_eq!(self.budgeted_count, 0);
        debug_assert_eq!(self.budgeted_bytes, 0);
    }

    // -----------------------------------------------------------------
    // Teardown of individual entries
    // -----------------------------------------------------------------

    fn detach_entry(&mut self, id: ResourceId) -> Entry<R> {
        if self.entry(id).refs == 0 {
            self.remove_from_purgeable(id);
        } else {
            self.remove_from_nonpurgeable(id);
        }
        let entry = self
            .entries
            .remove(id.0)
            .expect("resource id is stale or not in this cache");

        self.bytes -= entry.size;
        if entry.budgeted {
            self.budgeted_count -= 1;
            self.budgeted_bytes -= entry.size;
        }
        if let Some(key) = &entry.scratch_key {
            self.scratch_map.remove(key, id);
        }
        if let Some(key) = &entry.unique_key {
            self.unique_hash.remove(key);
        }
        entry
    }

    fn release_resource(&mut self, id: ResourceId) {
        let mut entry = self.detach_entry(id);
        entry.resource.release();
        self.stats.released_resources += 1;
    }

    fn abandon_resource(&mut self, id: ResourceId) {
        let mut entry = self.detach_entry(id);
        entry.resource.abandon();
    }

    // -----------------------------------------------------------------
    // Container maintenance
    // -----------------------------------------------------------------

    fn add_to_nonpurgeable(&mut self, id: ResourceId) {
        let pos = self.nonpurgeable.push(id);
        self.entry_mut(id).index = pos as i32;
    }

    fn remove_from_nonpurgeable(&mut self, id: ResourceId) {
        let pos = self.entry(id).index;
        debug_assert!(pos >= 0);
        let (removed, displaced) = self.nonpurgeable.swap_remove(pos as usize);
        debug_assert_eq!(removed, id);
        if let Some(moved) = displaced {
            self.entry_mut(moved).index = pos;
        }
        self.entry_mut(id).index = -1;
    }

    fn push_purgeable(&mut self, id: ResourceId) {
        let timestamp = self.entry(id).timestamp;
        let Self {
            purgeable, entries, ..
        } = self;
        purgeable.push(timestamp, id, &mut |moved, pos| {
            entries
                .get_mut(moved.0)
                .expect("heap tracks unknown resource")
                .index = pos as i32;
        });
    }

    fn remove_from_purgeable(&mut self, id: ResourceId) {
        let pos = self.entry(id).index;
        debug_assert!(pos >= 0);
        let removed = {
            let Self {
                purgeable, entries, ..
            } = self;
            let (_, removed) = purgeable.remove_at(pos as usize, &mut |moved, new_pos| {
                entries
                    .get_mut(moved.0)
                    .expect("heap tracks unknown resource")
                    .index = new_pos as i32;
            });
            removed
        };
        debug_assert_eq!(removed, id);
        self.entry_mut(id).index = -1;
    }

    // -----------------------------------------------------------------
    // Timestamps
    // -----------------------------------------------------------------

    fn next_timestamp(&mut self) -> u32 {
        // A zero counter means we just wrapped (or this is the first stamp
        // ever); with live resources their timestamps must be renumbered
        // below any stamp issued from here on.
        if self.timestamp == 0 && self.entries.len() != 0 {
            self.compact_timestamps();
        }
        let timestamp = self.timestamp;
        self.timestamp = self.timestamp.wrapping_add(1);
        timestamp
    }

    fn compact_timestamps(&mut self) {
        // Heap pops come out in ascending timestamp order.
        let mut drained: Vec<ResourceId> = Vec::with_capacity(self.purgeable.len());
        {
            let Self {
                purgeable, entries, ..
            } = self;
            while let Some((_, id)) = purgeable.pop(&mut |moved, pos| {
                entries
                    .get_mut(moved.0)
                    .expect("heap tracks unknown resource")
                    .index = pos as i32;
            }) {
                drained.push(id);
            }
        }
        {
            let Self {
                nonpurgeable,
                entries,
                ..
            } = self;
            nonpurgeable.as_mut_slice().sort_unstable_by_key(|id| {
                entries
                    .get(id.0)
                    .expect("array holds unknown resource")
                    .timestamp
            });
        }

        // Merge the two sorted sequences, assigning 0, 1, 2, … in the
        // existing relative order; non-purgeable back-indices are repaired
        // to their post-sort positions as the merge passes them.
        let total_purgeable = drained.len();
        let total_nonpurgeable = self.nonpurgeable.len();
        let mut next: u32 = 0;
        let mut p = 0;
        let mut np = 0;
        while p < total_purgeable && np < total_nonpurgeable {
            let ts_p = self.entry(drained[p]).timestamp;
            let id_np = self.nonpurgeable.as_slice()[np];
            let ts_np = self.entry(id_np).timestamp;
            debug_assert_ne!(ts_p, ts_np);
            if ts_p < ts_np {
                self.entry_mut(drained[p]).timestamp = next;
                p += 1;
            } else {
                let entry = self.entry_mut(id_np);
                entry.timestamp = next;
                entry.index = np as i32;
                np += 1;
            }
            next += 1;
        }
        while p < total_purgeable {
            self.entry_mut(drained[p]).timestamp = next;
            next += 1;
            p += 1;
        }
        while np < total_nonpurgeable {
            let id = self.nonpurgeable.as_slice()[np];
            let entry = self.entry_mut(id);
            entry.timestamp = next;
            entry.index = np as i32;
            next += 1;
            np += 1;
        }

        // Ascending re-insertion keeps every heap push O(1).
        for id in drained {
            self.push_purgeable(id);
        }

        self.timestamp = next;
        debug_assert_eq!(self.timestamp as usize, self.entries.len());
        self.stats.timestamp_compactions += 1;
        debug!(resources = self.entries.len(), "compacted timestamps after wrap");
    }

    // -----------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------

    /// Returns the number of cached resources.
    pub fn resource_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the number of budgeted resources.
    pub fn budgeted_resource_count(&self) -> usize {
        self.budgeted_count
    }

    /// Returns the byte total over all cached resources.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Returns the byte total over budgeted resources.
    pub fn budgeted_bytes(&self) -> usize {
        self.budgeted_bytes
    }

    /// Returns the count budget.
    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Returns the byte budget.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Returns the historical maximum resource count.
    pub fn high_water_count(&self) -> usize {
        self.stats.high_water_count
    }

    /// Returns the historical maximum byte total.
    pub fn high_water_bytes(&self) -> usize {
        self.stats.high_water_bytes
    }

    /// Returns the historical maximum budgeted count.
    pub fn budgeted_high_water_count(&self) -> usize {
        self.stats.budgeted_high_water_count
    }

    /// Returns the historical maximum budgeted byte total.
    pub fn budgeted_high_water_bytes(&self) -> usize {
        self.stats.budgeted_high_water_bytes
    }

    /// Captures a statistics snapshot.
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            resource_count: self.entries.len(),
            resource_bytes: self.bytes,
            budgeted_count: self.budgeted_count,
            budgeted_bytes: self.budgeted_bytes,
            max_count: self.max_count,
            max_bytes: self.max_bytes,
            high_water_count: self.stats.high_water_count,
            high_water_bytes: self.stats.high_water_bytes,
            budgeted_high_water_count: self.stats.budgeted_high_water_count,
            budgeted_high_water_bytes: self.stats.budgeted_high_water_bytes,
            scratch_searches: self.stats.scratch_searches,
            scratch_hits: self.stats.scratch_hits,
            unique_searches: self.stats.unique_searches,
            unique_hits: self.stats.unique_hits,
            released_resources: self.stats.released_resources,
            timestamp_compactions: self.stats.timestamp_compactions,
        }
    }

    /// Returns `true` while `id` refers to a cached resource.
    pub fn contains(&self, id: ResourceId) -> bool {
        self.entries.contains(id.0)
    }

    /// Returns the resource object.
    pub fn resource(&self, id: ResourceId) -> &R {
        &self.entry(id).resource
    }

    /// Returns the resource object mutably.
    ///
    /// Callers that change the resource's size must announce it via
    /// [`did_change_gpu_memory_size`](Self::did_change_gpu_memory_size).
    pub fn resource_mut(&mut self, id: ResourceId) -> &mut R {
        &mut self.entry_mut(id).resource
    }

    /// Returns `true` if no external holder references the resource.
    pub fn is_purgeable(&self, id: ResourceId) -> bool {
        self.entry(id).refs == 0
    }

    /// Returns `true` if the resource counts against the budget.
    pub fn is_budgeted(&self, id: ResourceId) -> bool {
        self.entry(id).budgeted
    }

    /// Returns `true` if the resource borrows external storage.
    pub fn is_wrapped(&self, id: ResourceId) -> bool {
        self.entry(id).wrapped
    }

    /// Returns the resource's scratch key, if any.
    pub fn scratch_key(&self, id: ResourceId) -> Option<&ScratchKey> {
        self.entry(id).scratch_key.as_ref()
    }

    /// Returns the resource's unique key, if any.
    pub fn unique_key(&self, id: ResourceId) -> Option<&UniqueKey> {
        self.entry(id).unique_key.as_ref()
    }

    /// Returns the resource's current timestamp.
    pub fn timestamp(&self, id: ResourceId) -> u32 {
        self.entry(id).timestamp
    }

    fn entry(&self, id: ResourceId) -> &Entry<R> {
        self.entries
            .get(id.0)
            .expect("resource id is stale or not in this cache")
    }

    fn entry_mut(&mut self, id: ResourceId) -> &mut Entry<R> {
        self.entries
            .get_mut(id.0)
            .expect("resource id is stale or not in this cache")
    }

    // -----------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------

    /// Walks both containers and every index, recomputing all totals, and
    /// reports the first violated invariant.
    ///
    /// Debug builds run this automatically (sampled) after public
    /// mutations.
    #[cfg(any(test, debug_assertions))]
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        use rustc_hash::FxHashSet;

        if self.nonpurgeable.len() + self.purgeable.len() != self.entries.len() {
            return Err(InvariantError::new(format!(
                "container split {} + {} does not cover {} entries",
                self.nonpurgeable.len(),
                self.purgeable.len(),
                self.entries.len()
            )));
        }

        let mut tally = Tally::default();
        let mut timestamps = FxHashSet::default();

        for (pos, &id) in self.nonpurgeable.as_slice().iter().enumerate() {
            let entry = self
                .entries
                .get(id.0)
                .ok_or_else(|| InvariantError::new("non-purgeable array holds unknown resource"))?;
            if entry.refs == 0 {
                return Err(InvariantError::new("purgeable resource in non-purgeable array"));
            }
            if entry.index != pos as i32 {
                return Err(InvariantError::new(format!(
                    "non-purgeable back-index {} does not match position {pos}",
                    entry.index
                )));
            }
            if !timestamps.insert(entry.timestamp) {
                return Err(InvariantError::new(format!(
                    "duplicate timestamp {}",
                    entry.timestamp
                )));
            }
            self.tally_entry(id, entry, &mut tally)?;
        }

        let heap_scores: Vec<u32> = self.purgeable.iter().map(|(score, _)| score).collect();
        for (pos, (score, id)) in self.purgeable.iter().enumerate() {
            let entry = self
                .entries
                .get(id.0)
                .ok_or_else(|| InvariantError::new("purgeable heap holds unknown resource"))?;
            if entry.refs != 0 {
                return Err(InvariantError::new("referenced resource in purgeable heap"));
            }
            if entry.index != pos as i32 {
                return Err(InvariantError::new(format!(
                    "purgeable back-index {} does not match position {pos}",
                    entry.index
                )));
            }
            if score != entry.timestamp {
                return Err(InvariantError::new("heap score differs from entry timestamp"));
            }
            if !timestamps.insert(entry.timestamp) {
                return Err(InvariantError::new(format!(
                    "duplicate timestamp {}",
                    entry.timestamp
                )));
            }
            self.tally_entry(id, entry, &mut tally)?;
        }
        for pos in 1..heap_scores.len() {
            if heap_scores[(pos - 1) / 2] > heap_scores[pos] {
                return Err(InvariantError::new(format!(
                    "heap property violated at position {pos}"
                )));
            }
        }

        if tally.bytes != self.bytes {
            return Err(InvariantError::new(format!(
                "byte total {} does not match recomputation {}",
                self.bytes, tally.bytes
            )));
        }
        if tally.budgeted_count != self.budgeted_count || tally.budgeted_bytes != self.budgeted_bytes
        {
            return Err(InvariantError::new("budgeted totals do not match recomputation"));
        }
        if self.budgeted_count > self.entries.len() || self.budgeted_bytes > self.bytes {
            return Err(InvariantError::new("budgeted totals exceed overall totals"));
        }
        if tally.scratch + tally.could_be_scratch != self.scratch_map.len() {
            return Err(InvariantError::new(format!(
                "scratch map holds {} resources, expected {}",
                self.scratch_map.len(),
                tally.scratch + tally.could_be_scratch
            )));
        }
        if tally.unique != self.unique_hash.len() {
            return Err(InvariantError::new(format!(
                "unique hash holds {} resources, expected {}",
                self.unique_hash.len(),
                tally.unique
            )));
        }

        if self.stats.high_water_count < self.entries.len()
            || self.stats.high_water_bytes < self.bytes
            || self.stats.budgeted_high_water_count < self.budgeted_count
            || self.stats.budgeted_high_water_bytes < self.budgeted_bytes
        {
            return Err(InvariantError::new("high-water marks below current values"));
        }
        if self.stats.budgeted_high_water_count > self.stats.high_water_count
            || self.stats.budgeted_high_water_bytes > self.stats.high_water_bytes
        {
            return Err(InvariantError::new("budgeted high-water marks exceed overall marks"));
        }

        Ok(())
    }

    #[cfg(any(test, debug_assertions))]
    fn tally_entry(
        &self,
        id: ResourceId,
        entry: &Entry<R>,
        tally: &mut Tally,
    ) -> Result<(), InvariantError> {
        tally.bytes += entry.size;

        if let Some(key) = &entry.scratch_key {
            if entry.wrapped {
                return Err(InvariantError::new("wrapped resource carries a scratch key"));
            }
            if self.scratch_map.count_for_key(key) == 0 {
                return Err(InvariantError::new("scratch key missing from scratch map"));
            }
            if entry.is_scratch() {
                tally.scratch += 1;
            } else {
                tally.could_be_scratch += 1;
            }
        }

        if let Some(key) = &entry.unique_key {
            if !entry.budgeted || entry.wrapped {
                return Err(InvariantError::new(
                    "unique key on an un-budgeted or wrapped resource",
                ));
            }
            if self.unique_hash.find(key) != Some(id) {
                return Err(InvariantError::new("unique key not mapped to its holder"));
            }
            tally.unique += 1;
        }

        if entry.budgeted {
            tally.budgeted_count += 1;
            tally.budgeted_bytes += entry.size;
        }
        Ok(())
    }

    /// Sampled automatic validation; frequency halves as the cache grows.
    #[cfg(debug_assertions)]
    fn validate(&mut self) {
        let mask = ((self.entries.len() + 1).next_power_of_two() >> 5).wrapping_sub(1);
        if mask != usize::MAX {
            self.validate_seed ^= self.validate_seed << 13;
            self.validate_seed ^= self.validate_seed >> 17;
            self.validate_seed ^= self.validate_seed << 5;
            if (self.validate_seed as usize) & mask != 0 {
                return;
            }
        }
        if let Err(err) = self.check_invariants() {
            panic!("resource cache invariant violated: {err}");
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn validate(&mut self) {}
}

#[cfg(any(test, debug_assertions))]
#[derive(Default)]
struct Tally {
    bytes: usize,
    budgeted_count: usize,
    budgeted_bytes: usize,
    scratch: usize,
    could_be_scratch: usize,
    unique: usize,
}

impl<R: GpuResource> Default for ResourceCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: GpuResource> Drop for ResourceCache<R> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.release_all();
        }
    }
}

// ==============================================
// Tests
// ==============================================
