//! Per-namespace cache statistics

use serde::Serialize;

/// Running counters for one namespace
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Counters {
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Snapshot of a namespace's counters and tier sizes
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Lookups answered by either tier
    pub hits: u64,
    /// Lookups answered by the memory tier
    pub memory_hits: u64,
    /// Lookups answered by the persistent tier
    pub persistent_hits: u64,
    /// Lookups with no fresh entry in either tier
    pub misses: u64,
    /// Calls to `set`
    pub writes: u64,
    /// Memory entries dropped to stay within the bound
    pub evictions: u64,
    /// Expired memory entries discarded on read
    pub expirations: u64,
    /// `hits / (hits + misses)`, or 0 without lookups
    pub hit_rate: f64,
    /// Entries currently in the memory tier
    pub entry_count: usize,
    /// Records currently in the persistent tier
    pub persistent_entries: usize,
    /// Whether the persistent tier is still in use for this namespace
    pub persistent_enabled: bool,
}

impl CacheStats {
    pub(crate) fn from_counters(
        counters: Counters,
        entry_count: usize,
        persistent_entries: usize,
        persistent_enabled: bool,
    ) -> Self {
        let hits = counters.memory_hits + counters.persistent_hits;
        let lookups = hits + counters.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64
        };

        Self {
            hits,
            memory_hits: counters.memory_hits,
            persistent_hits: counters.persistent_hits,
            misses: counters.misses,
            writes: counters.writes,
            evictions: counters.evictions,
            expirations: counters.expirations,
            hit_rate,
            entry_count,
            persistent_entries,
            persistent_enabled,
        }
    }

    /// Total lookups recorded
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }
}
