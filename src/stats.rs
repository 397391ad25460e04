//! Cache statistics: high-water marks and operation counters.
//!
//! Counters are updated inline by the cache and exported as a plain
//! [`CacheStatsSnapshot`] value, so callers can diff snapshots across frames
//! without holding a borrow of the cache.

/// Point-in-time view of the cache's gauges, high-water marks, and counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    // gauges captured at snapshot time
    pub resource_count: usize,
    pub resource_bytes: usize,
    pub budgeted_count: usize,
    pub budgeted_bytes: usize,
    pub max_count: usize,
    pub max_bytes: usize,

    // high-water marks (monotonic)
    pub high_water_count: usize,
    pub high_water_bytes: usize,
    pub budgeted_high_water_count: usize,
    pub budgeted_high_water_bytes: usize,

    // counters
    pub scratch_searches: u64,
    pub scratch_hits: u64,
    pub unique_searches: u64,
    pub unique_hits: u64,
    pub released_resources: u64,
    pub timestamp_compactions: u64,
}

/// Internal counter block embedded in the cache.
#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub high_water_count: usize,
    pub high_water_bytes: usize,
    pub budgeted_high_water_count: usize,
    pub budgeted_high_water_bytes: usize,

    pub scratch_searches: u64,
    pub scratch_hits: u64,
    pub unique_searches: u64,
    pub unique_hits: u64,
    pub released_resources: u64,
    pub timestamp_compactions: u64,
}

impl StatCounters {
    /// Raises the overall high-water marks to at least the given totals.
    pub fn update_resource_high_water(&mut self, count: usize, bytes: usize) {
        self.high_water_count = self.high_water_count.max(count);
        self.high_water_bytes = self.high_water_bytes.max(bytes);
    }

    /// Raises the budgeted high-water marks to at least the given totals.
    pub fn update_budgeted_high_water(&mut self, count: usize, bytes: usize) {
        self.budgeted_high_water_count = self.budgeted_high_water_count.max(count);
        self.budgeted_high_water_bytes = self.budgeted_high_water_bytes.max(bytes);
    }
}
