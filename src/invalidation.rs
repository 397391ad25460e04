//! Unique key invalidation bus.
//!
//! Producers on any thread post messages naming unique keys whose cached
//! resources should lose those keys (a text blob was mutated, a bitmap's
//! generation changed). The cache owner drains the bus at safepoints and
//! feeds the batch to
//! [`ResourceCache::process_invalid_unique_keys`](crate::cache::ResourceCache::process_invalid_unique_keys).
//!
//! The bus is the one thread-safe piece of this crate: handles are clonable
//! and posting is lock-guarded, while the cache itself stays single-owner.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::key::UniqueKey;

/// Notice that the resource cached under `key` is no longer valid for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueKeyInvalidatedMessage {
    key: UniqueKey,
}

impl UniqueKeyInvalidatedMessage {
    /// Creates a message for `key`.
    pub fn new(key: UniqueKey) -> Self {
        Self { key }
    }

    /// Returns the invalidated key.
    pub fn key(&self) -> &UniqueKey {
        &self.key
    }
}

/// Clonable multi-producer queue of invalidation messages.
///
/// # Example
///
/// ```
/// use rescache::invalidation::InvalidationBus;
/// use rescache::key::{UniqueKey, UniqueKeyDomain};
///
/// let bus = InvalidationBus::new();
/// let producer = bus.clone();
/// let domain = UniqueKeyDomain::generate();
/// producer.invalidate(UniqueKey::new(domain, &[1]));
///
/// let drained = bus.drain();
/// assert_eq!(drained.len(), 1);
/// assert!(bus.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct InvalidationBus {
    queue: Arc<Mutex<Vec<UniqueKeyInvalidatedMessage>>>,
}

impl InvalidationBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts a message.
    pub fn post(&self, msg: UniqueKeyInvalidatedMessage) {
        self.queue.lock().push(msg);
    }

    /// Posts an invalidation for `key`.
    pub fn invalidate(&self, key: UniqueKey) {
        self.post(UniqueKeyInvalidatedMessage::new(key));
    }

    /// Takes every pending message, leaving the bus empty.
    pub fn drain(&self) -> Vec<UniqueKeyInvalidatedMessage> {
        std::mem::take(&mut *self.queue.lock())
    }

    /// Returns `true` if no messages are pending.
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::UniqueKeyDomain;

    #[test]
    fn drain_returns_messages_in_post_order() {
        let bus = InvalidationBus::new();
        let domain = UniqueKeyDomain::generate();
        bus.invalidate(UniqueKey::new(domain, &[1]));
        bus.invalidate(UniqueKey::new(domain, &[2]));

        let drained = bus.drain();
        assert_eq!(drained[0].key().payload(), &[1]);
        assert_eq!(drained[1].key().payload(), &[2]);
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn clones_share_one_queue() {
        let bus = InvalidationBus::new();
        let producer = bus.clone();
        let domain = UniqueKeyDomain::generate();
        producer.invalidate(UniqueKey::new(domain, &[5]));

        assert!(!bus.is_empty());
        assert_eq!(bus.drain().len(), 1);
        assert!(producer.is_empty());
    }

    #[test]
    fn posting_from_another_thread_is_visible() {
        let bus = InvalidationBus::new();
        let producer = bus.clone();
        let domain = UniqueKeyDomain::generate();

        std::thread::spawn(move || {
            producer.invalidate(UniqueKey::new(domain, &[9]));
        })
        .join()
        .unwrap();

        let drained = bus.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].key().payload(), &[9]);
    }
}
