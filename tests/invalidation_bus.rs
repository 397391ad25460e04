// ==============================================
// INVALIDATION BUS SCENARIOS (integration)
// ==============================================
//
// Producers post from arbitrary threads; the cache owner drains at
// safepoints. Messages for unknown keys must be ignored silently.

use std::sync::OnceLock;

use rescache::prelude::*;

#[derive(Debug)]
struct TestResource {
    size: usize,
}

impl GpuResource for TestResource {
    fn gpu_memory_size(&self) -> usize {
        self.size
    }

    fn release(&mut self) {}

    fn abandon(&mut self) {}
}

fn unique_key(word: u32) -> UniqueKey {
    static DOMAIN: OnceLock<UniqueKeyDomain> = OnceLock::new();
    UniqueKey::new(*DOMAIN.get_or_init(UniqueKeyDomain::generate), &[word])
}

#[test]
fn cross_thread_posts_reach_the_cache_owner() {
    let mut cache = ResourceCache::new();
    let bus = InvalidationBus::new();

    let ids: Vec<_> = (0..4)
        .map(|word| {
            let id = cache.insert(TestResource { size: 10 }, ResourceDesc::default());
            cache.change_unique_key(id, unique_key(word));
            id
        })
        .collect();

    let handles: Vec<_> = (0..4u32)
        .map(|word| {
            let producer = bus.clone();
            std::thread::spawn(move || producer.invalidate(unique_key(word)))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    cache.process_invalidation_bus(&bus);

    assert!(bus.is_empty());
    for (word, id) in ids.iter().enumerate() {
        assert_eq!(cache.unique_key(*id), None);
        assert_eq!(cache.find_and_ref_unique_resource(&unique_key(word as u32)), None);
        cache.unref_resource(*id);
    }
}

#[test]
fn unknown_keys_are_ignored_silently() {
    let mut cache: ResourceCache<TestResource> = ResourceCache::new();
    let msgs = [
        UniqueKeyInvalidatedMessage::new(unique_key(100)),
        UniqueKeyInvalidatedMessage::new(unique_key(101)),
    ];
    cache.process_invalid_unique_keys(&msgs);
    assert_eq!(cache.resource_count(), 0);
}

#[test]
fn batch_processing_handles_mixed_known_and_unknown_keys() {
    let mut cache = ResourceCache::new();
    let a = cache.insert(TestResource { size: 10 }, ResourceDesc::default());
    cache.change_unique_key(a, unique_key(7));

    let msgs = [
        UniqueKeyInvalidatedMessage::new(unique_key(6)),
        UniqueKeyInvalidatedMessage::new(unique_key(7)),
        UniqueKeyInvalidatedMessage::new(unique_key(8)),
    ];
    cache.process_invalid_unique_keys(&msgs);

    assert_eq!(cache.unique_key(a), None);
    assert!(cache.contains(a));
    cache.unref_resource(a);
}
