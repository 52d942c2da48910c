//! Bounded in-memory tier with least-recently-used eviction

use std::num::NonZeroUsize;

use chrono::{DateTime, Utc};
use lru::LruCache;

use super::entry::StoredEntry;

/// Recency-ordered map of sanitized key to entry
///
/// Both reads ([`MemoryTier::get`]) and writes ([`MemoryTier::insert`])
/// mark a key as most recently used. Inserting a new key into a full tier
/// evicts the least recently used one.
#[derive(Debug)]
pub struct MemoryTier {
    entries: LruCache<String, StoredEntry>,
}

impl MemoryTier {
    /// Creates a tier holding at most `max_entries` (minimum 1)
    pub fn new(max_entries: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Looks up a key and marks it most recently used
    pub fn get(&mut self, key: &str) -> Option<&StoredEntry> {
        self.entries.get(key)
    }

    /// Looks up a key without touching recency
    #[cfg(test)]
    pub fn peek(&self, key: &str) -> Option<&StoredEntry> {
        self.entries.peek(key)
    }

    /// Stores an entry, returning the key that had to be evicted to make room
    pub fn insert(&mut self, key: String, entry: StoredEntry) -> Option<String> {
        match self.entries.push(key.clone(), entry) {
            Some((old_key, _)) if old_key != key => Some(old_key),
            _ => None,
        }
    }

    /// Removes a key, returning its entry if present
    pub fn remove(&mut self, key: &str) -> Option<StoredEntry> {
        self.entries.pop(key)
    }

    /// Drops every entry whose TTL has elapsed at `now`
    pub fn remove_expired(&mut self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.pop(key);
        }
        expired.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Keys from most to least recently used
    #[cfg(test)]
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(key, _)| key.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::{CacheEntry, Metadata};
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap()
    }

    fn entry(value: i64, ttl_minutes: Option<i64>) -> StoredEntry {
        CacheEntry::new(
            json!(value),
            noon(),
            ttl_minutes.map(Duration::minutes),
            Metadata::new(),
        )
    }

    #[test]
    fn test_insert_beyond_capacity_evicts_oldest() {
        let mut tier = MemoryTier::new(3);
        for (i, key) in ["KJFK", "KLGA", "KEWR"].iter().enumerate() {
            assert!(tier.insert(key.to_string(), entry(i as i64, None)).is_none());
        }

        let evicted = tier.insert("KBOS".to_string(), entry(3, None));

        assert_eq!(evicted.as_deref(), Some("KJFK"));
        assert_eq!(tier.len(), 3);
        assert!(tier.peek("KJFK").is_none());
    }

    #[test]
    fn test_read_refreshes_recency() {
        let mut tier = MemoryTier::new(3);
        tier.insert("KJFK".to_string(), entry(1, None));
        tier.insert("KLGA".to_string(), entry(2, None));
        tier.insert("KEWR".to_string(), entry(3, None));

        assert!(tier.get("KJFK").is_some());
        let evicted = tier.insert("KBOS".to_string(), entry(4, None));

        assert_eq!(evicted.as_deref(), Some("KLGA"));
        assert!(tier.peek("KJFK").is_some());
    }

    #[test]
    fn test_overwrite_is_not_an_eviction() {
        let mut tier = MemoryTier::new(2);
        tier.insert("KJFK".to_string(), entry(1, None));
        tier.insert("KLGA".to_string(), entry(2, None));

        assert!(tier.insert("KJFK".to_string(), entry(10, None)).is_none());
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.peek("KJFK").map(|e| e.value.clone()), Some(json!(10)));
        assert_eq!(tier.keys(), vec!["KJFK".to_string(), "KLGA".to_string()]);
    }

    #[test]
    fn test_remove_expired() {
        let mut tier = MemoryTier::new(10);
        tier.insert("short".to_string(), entry(1, Some(5)));
        tier.insert("long".to_string(), entry(2, Some(120)));
        tier.insert("forever".to_string(), entry(3, None));

        let removed = tier.remove_expired(noon() + Duration::minutes(30));

        assert_eq!(removed, 1);
        assert!(tier.peek("short").is_none());
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let mut tier = MemoryTier::new(0);
        tier.insert("a".to_string(), entry(1, None));
        tier.insert("b".to_string(), entry(2, None));

        assert_eq!(tier.capacity(), 1);
        assert_eq!(tier.len(), 1);
        assert!(tier.peek("b").is_some());
    }
}
