// ==============================================
// END-TO-END BUDGET AND LIFECYCLE SCENARIOS (integration)
// ==============================================
//
// Exercises the cache through its public surface only: insertion, scratch
// and unique lookup, budget pressure, rescue of un-budgeted scratch
// resources, and teardown. Data-structure-level behavior is covered by the
// in-file unit tests.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::OnceLock;

use rescache::prelude::*;

#[derive(Debug, Default, Clone)]
struct Teardown {
    released: Rc<Cell<bool>>,
    abandoned: Rc<Cell<bool>>,
}

#[derive(Debug)]
struct TestResource {
    size: usize,
    teardown: Teardown,
}

impl TestResource {
    fn new(size: usize) -> Self {
        Self {
            size,
            teardown: Teardown::default(),
        }
    }

    fn teardown(&self) -> Teardown {
        self.teardown.clone()
    }
}

impl GpuResource for TestResource {
    fn gpu_memory_size(&self) -> usize {
        self.size
    }

    fn release(&mut self) {
        self.teardown.released.set(true);
    }

    fn abandon(&mut self) {
        self.teardown.abandoned.set(true);
    }
}

fn scratch_key(word: u32) -> ScratchKey {
    static TYPE: OnceLock<ResourceType> = OnceLock::new();
    ScratchKey::new(*TYPE.get_or_init(ResourceType::generate), &[word])
}

fn unique_key(word: u32) -> UniqueKey {
    static DOMAIN: OnceLock<UniqueKeyDomain> = OnceLock::new();
    UniqueKey::new(*DOMAIN.get_or_init(UniqueKeyDomain::generate), &[word])
}

fn scratch_desc(word: u32) -> ResourceDesc {
    ResourceDesc::default().with_scratch_key(scratch_key(word))
}

// ==============================================
// Scratch reuse
// ==============================================

#[test]
fn scratch_resource_survives_and_is_reused() {
    let mut cache = ResourceCache::new();
    let a = cache.insert(TestResource::new(100), scratch_desc(1));
    let stamp_before = cache.timestamp(a);

    cache.unref_resource(a);
    assert!(cache.contains(a));
    assert!(cache.is_purgeable(a));

    let hit = cache.find_and_ref_scratch_resource(&scratch_key(1), ScratchConstraint::None);
    assert_eq!(hit, Some(a));
    assert!(!cache.is_purgeable(a));
    assert!(cache.timestamp(a) > stamp_before);

    cache.unref_resource(a);
}

#[test]
fn default_limits_match_documented_values() {
    let cache: ResourceCache<TestResource> = ResourceCache::new();
    assert_eq!(cache.max_count(), DEFAULT_MAX_COUNT);
    assert_eq!(cache.max_bytes(), DEFAULT_MAX_BYTES);
    assert_eq!(cache.max_count(), 2048);
    assert_eq!(cache.max_bytes(), 96 * (1 << 20));
}

// ==============================================
// Eviction by budget
// ==============================================

#[test]
fn budget_pressure_evicts_in_stamp_order() {
    let mut cache = ResourceCache::with_limits(2, 1000);

    let a = cache.insert(TestResource::new(400), scratch_desc(1));
    let a_teardown = cache.resource(a).teardown();
    cache.unref_resource(a);

    let b = cache.insert(TestResource::new(400), scratch_desc(2));
    cache.unref_resource(b);

    let c = cache.insert(TestResource::new(400), scratch_desc(3));
    cache.unref_resource(c);

    assert!(a_teardown.released.get());
    assert!(!cache.contains(a));
    assert!(cache.contains(b));
    assert!(cache.contains(c));
    assert_eq!(cache.budgeted_resource_count(), 2);
    assert_eq!(cache.budgeted_bytes(), 800);
}

#[test]
fn shrinking_limits_reaches_the_new_budget_or_fires_callback() {
    let mut cache = ResourceCache::new();
    for word in 0..3 {
        let id = cache.insert(TestResource::new(100), scratch_desc(word));
        cache.unref_resource(id);
    }
    let held = cache.insert(TestResource::new(100), ResourceDesc::default());

    let fired = Rc::new(Cell::new(false));
    let seen = fired.clone();
    cache.set_over_budget_callback(move |_| seen.set(true));

    // All purgeable resources fit the purge; the held one keeps us within
    // the count limit, so no callback.
    cache.set_limits(1, 10_000);
    assert_eq!(cache.budgeted_resource_count(), 1);
    assert!(!fired.get());

    // Now only the held resource remains and exceeds the byte limit;
    // purging finds nothing, so the callback fires.
    cache.set_limits(1, 50);
    assert!(fired.get());
    assert!(cache.contains(held));

    cache.unref_resource(held);
}

// ==============================================
// Unique keys
// ==============================================

#[test]
fn unique_key_collision_evicts_unreachable_holder() {
    let mut cache = ResourceCache::new();

    let a = cache.insert(TestResource::new(10), ResourceDesc::default());
    let a_teardown = cache.resource(a).teardown();
    cache.change_unique_key(a, unique_key(1));
    cache.unref_resource(a);

    let b = cache.insert(TestResource::new(10), ResourceDesc::default());
    cache.change_unique_key(b, unique_key(1));

    assert!(a_teardown.released.get());
    assert!(!cache.contains(a));
    assert_eq!(cache.find_and_ref_unique_resource(&unique_key(1)), Some(b));
    assert_eq!(cache.unique_key(b), Some(&unique_key(1)));

    cache.unref_resource(b);
    cache.unref_resource(b);
}

#[test]
fn unique_key_roundtrip_leaves_no_mapping() {
    let mut cache = ResourceCache::new();
    let a = cache.insert(TestResource::new(10), ResourceDesc::default());
    let count_before = cache.resource_count();
    let bytes_before = cache.bytes();

    cache.change_unique_key(a, unique_key(2));
    cache.remove_unique_key(a);

    assert_eq!(cache.unique_key(a), None);
    assert_eq!(cache.find_and_ref_unique_resource(&unique_key(2)), None);
    assert_eq!(cache.resource_count(), count_before);
    assert_eq!(cache.bytes(), bytes_before);

    cache.unref_resource(a);
}

// ==============================================
// Un-budgeted rescue
// ==============================================

#[test]
fn unbudgeted_scratch_resource_is_rebudgeted_with_headroom() {
    let mut cache = ResourceCache::with_limits(10, 1000);
    let a = cache.insert(TestResource::new(10), scratch_desc(5).unbudgeted());
    assert_eq!(cache.budgeted_resource_count(), 0);
    assert_eq!(cache.budgeted_bytes(), 0);

    cache.unref_resource(a);

    assert!(cache.contains(a));
    assert!(cache.is_budgeted(a));
    assert_eq!(cache.budgeted_resource_count(), 1);
    assert_eq!(cache.budgeted_bytes(), 10);

    // And it is now an ordinary scratch candidate.
    assert_eq!(
        cache.find_and_ref_scratch_resource(&scratch_key(5), ScratchConstraint::None),
        Some(a)
    );
    cache.unref_resource(a);
}

// ==============================================
// Invalidation
// ==============================================

#[test]
fn invalidation_strips_key_from_held_resource() {
    let mut cache = ResourceCache::new();
    let bus = InvalidationBus::new();

    let a = cache.insert(TestResource::new(10), ResourceDesc::default());
    cache.change_unique_key(a, unique_key(3));

    bus.invalidate(unique_key(3));
    cache.process_invalidation_bus(&bus);

    assert!(cache.contains(a));
    assert!(!cache.is_purgeable(a));
    assert_eq!(cache.unique_key(a), None);
    assert_eq!(cache.find_and_ref_unique_resource(&unique_key(3)), None);

    cache.unref_resource(a);
}

// ==============================================
// Teardown
// ==============================================

#[test]
fn release_all_zeroes_every_counter() {
    let mut cache = ResourceCache::new();
    let held = cache.insert(TestResource::new(10), scratch_desc(1));
    let held_teardown = cache.resource(held).teardown();
    let loose = cache.insert(TestResource::new(20), scratch_desc(2));
    cache.unref_resource(loose);
    let keyed = cache.insert(TestResource::new(30), ResourceDesc::default());
    cache.change_unique_key(keyed, unique_key(4));

    cache.release_all();

    assert!(held_teardown.released.get());
    assert_eq!(cache.resource_count(), 0);
    assert_eq!(cache.budgeted_resource_count(), 0);
    assert_eq!(cache.bytes(), 0);
    assert_eq!(cache.budgeted_bytes(), 0);
    assert_eq!(cache.find_and_ref_unique_resource(&unique_key(4)), None);
    assert_eq!(
        cache.find_and_ref_scratch_resource(&scratch_key(1), ScratchConstraint::None),
        None
    );
}

#[test]
fn abandon_all_never_calls_release() {
    let mut cache = ResourceCache::new();
    let a = cache.insert(TestResource::new(10), scratch_desc(1));
    let a_teardown = cache.resource(a).teardown();
    let b = cache.insert(TestResource::new(20), ResourceDesc::default());
    let b_teardown = cache.resource(b).teardown();
    cache.unref_resource(a);

    cache.abandon_all();

    assert!(a_teardown.abandoned.get());
    assert!(b_teardown.abandoned.get());
    assert!(!a_teardown.released.get());
    assert!(!b_teardown.released.get());
    assert_eq!(cache.resource_count(), 0);
    assert_eq!(cache.bytes(), 0);
}

// ==============================================
// Timestamp ordering
// ==============================================

#[test]
fn stamps_increase_across_inserts_and_hits() {
    let mut cache = ResourceCache::new();
    let a = cache.insert(TestResource::new(10), scratch_desc(1));
    let b = cache.insert(TestResource::new(10), scratch_desc(2));
    assert!(cache.timestamp(b) > cache.timestamp(a));

    cache.unref_resource(a);
    let a_again = cache
        .find_and_ref_scratch_resource(&scratch_key(1), ScratchConstraint::None)
        .unwrap();
    assert_eq!(a_again, a);
    assert!(cache.timestamp(a) > cache.timestamp(b));

    cache.unref_resource(a);
    cache.unref_resource(b);
}
