//! Scratch and unique resource keys.
//!
//! Both key kinds share the same wire shape: a 16-bit domain tag plus a
//! variable-length payload of 32-bit words, with a checksum precomputed at
//! construction so map lookups never rehash the payload.
//!
//! ```text
//!   ScratchKey                         UniqueKey
//!   ┌────────────┬───────────────┐     ┌─────────────────┬───────────────┐
//!   │ domain u16 │ payload [u32] │     │ domain u16      │ payload [u32] │
//!   │ (ResourceType)             │     │ (UniqueKeyDomain)               │
//!   └────────────┴───────────────┘     └─────────────────┴───────────────┘
//!         coarse identity:                  fine identity: at most one
//!         same key ⇒ interchangeable        cached resource per key
//! ```
//!
//! Domains are allocated from process-global monotonic counters so that
//! independent subsystems can mint non-colliding key spaces without
//! coordination. Domain `0` is reserved invalid; allocating past `u16::MAX`
//! is a fatal error.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};

use rustc_hash::FxHasher;

/// Reserved invalid domain value; generated domains start above it.
const INVALID_DOMAIN: u32 = 0;

fn next_domain(counter: &AtomicU32, kind: &str) -> u16 {
    let value = counter.fetch_add(1, Ordering::Relaxed);
    if value > u16::MAX as u32 {
        panic!("too many {kind} domains");
    }
    value as u16
}

fn checksum(domain: u16, payload: &[u32]) -> u32 {
    let mut hasher = FxHasher::default();
    hasher.write_u16(domain);
    for &word in payload {
        hasher.write_u32(word);
    }
    hasher.finish() as u32
}

// ---------------------------------------------------------------------------
// Domains
// ---------------------------------------------------------------------------

/// Domain tag for [`ScratchKey`]s.
///
/// One `ResourceType` is typically generated per reusable resource class
/// (e.g. one for textures, one for buffers) and retained for the process
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceType(u16);

impl ResourceType {
    /// Allocates the next process-global resource type.
    ///
    /// Panics once the 16-bit space is exhausted.
    pub fn generate() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(INVALID_DOMAIN + 1);
        ResourceType(next_domain(&NEXT, "resource type"))
    }

    /// Returns the raw 16-bit tag.
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

/// Domain tag for [`UniqueKey`]s, allocated identically to [`ResourceType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniqueKeyDomain(u16);

impl UniqueKeyDomain {
    /// Allocates the next process-global unique key domain.
    ///
    /// Panics once the 16-bit space is exhausted.
    pub fn generate() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(INVALID_DOMAIN + 1);
        UniqueKeyDomain(next_domain(&NEXT, "unique key"))
    }

    /// Returns the raw 16-bit tag.
    pub fn as_u16(self) -> u16 {
        self.0
    }
}

// ---------------------------------------------------------------------------
// Key data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct KeyData {
    domain: u16,
    payload: Box<[u32]>,
    hash: u32,
}

impl KeyData {
    fn new(domain: u16, payload: &[u32]) -> Self {
        Self {
            domain,
            payload: payload.into(),
            hash: checksum(domain, payload),
        }
    }
}

impl PartialEq for KeyData {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.domain == other.domain && self.payload == other.payload
    }
}

impl Eq for KeyData {}

impl Hash for KeyData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash);
    }
}

// ---------------------------------------------------------------------------
// ScratchKey
// ---------------------------------------------------------------------------

/// Coarse reuse identity: resources with equal scratch keys are
/// interchangeable for compatible work.
///
/// # Example
///
/// ```
/// use rescache::key::{ResourceType, ScratchKey};
///
/// let ty = ResourceType::generate();
/// let a = ScratchKey::new(ty, &[256, 256, 4]);
/// let b = ScratchKey::new(ty, &[256, 256, 4]);
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScratchKey(KeyData);

impl ScratchKey {
    /// Builds a key from a resource type and payload words.
    pub fn new(resource_type: ResourceType, payload: &[u32]) -> Self {
        ScratchKey(KeyData::new(resource_type.as_u16(), payload))
    }

    /// Returns the key's resource type.
    pub fn resource_type(&self) -> ResourceType {
        ResourceType(self.0.domain)
    }

    /// Returns the payload words.
    pub fn payload(&self) -> &[u32] {
        &self.0.payload
    }
}

// ---------------------------------------------------------------------------
// UniqueKey
// ---------------------------------------------------------------------------

/// Fine identity: at most one cached resource carries a given unique key.
///
/// # Example
///
/// ```
/// use rescache::key::{UniqueKey, UniqueKeyDomain};
///
/// let domain = UniqueKeyDomain::generate();
/// let key = UniqueKey::new(domain, &[17]);
/// assert_eq!(key.payload(), &[17]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniqueKey(KeyData);

impl UniqueKey {
    /// Builds a key from a domain and payload words.
    pub fn new(domain: UniqueKeyDomain, payload: &[u32]) -> Self {
        UniqueKey(KeyData::new(domain.as_u16(), payload))
    }

    /// Returns the key's domain.
    pub fn domain(&self) -> UniqueKeyDomain {
        UniqueKeyDomain(self.0.domain)
    }

    /// Returns the payload words.
    pub fn payload(&self) -> &[u32] {
        &self.0.payload
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
