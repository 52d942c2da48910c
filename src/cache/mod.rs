//! Cache module for storing upstream API responses
//!
//! This module provides a two-tier cache: a bounded in-memory LRU tier in
//! front of a durable on-disk tier that survives restarts. Entries carry a
//! TTL, and expired entries stay readable through
//! [`CacheStore::get_with_stale`] so callers can degrade gracefully when an
//! upstream source is down or over budget.

mod disk;
mod entry;
mod key;
mod memory;
mod stats;
mod store;

pub use entry::{parse_timestamp, CacheEntry, JsonCodec, Metadata, RecordCodec, StoredEntry};
pub use key::{sanitize_key, MAX_KEY_LEN};
pub use stats::CacheStats;
pub use store::{CacheStore, CachedData};
