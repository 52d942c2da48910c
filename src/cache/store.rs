//! Two-tier cache store
//!
//! A bounded in-memory LRU tier in front of a durable on-disk tier, split
//! into namespaces (one per upstream source). Lookups check memory first,
//! then disk, promoting disk hits into memory. Writes go to both tiers.
//!
//! Storage faults never escape: if a namespace's directory cannot be created
//! or written, the store logs once and carries on memory-only for that
//! namespace. Corrupt records read as misses.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::disk::DiskTier;
use super::entry::{CacheEntry, JsonCodec, Metadata, RecordCodec, StoredEntry};
use super::key::sanitize_key;
use super::memory::MemoryTier;
use super::stats::{CacheStats, Counters};
use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::error::CacheError;

/// A cached value along with how fresh it is
#[derive(Debug, Clone, PartialEq)]
pub struct CachedData<T> {
    /// The cached payload
    pub data: T,
    /// When the value was originally cached
    pub cached_at: DateTime<Utc>,
    /// Whether the value's TTL had elapsed when it was read
    pub is_stale: bool,
}

/// Outcome of checking both tiers for one key
enum Lookup {
    Fresh(StoredEntry),
    Expired(StoredEntry),
    Miss,
}

/// Per-namespace state
#[derive(Debug)]
struct Namespace {
    name: String,
    memory: Mutex<MemoryTier>,
    /// Cleared for good after the first storage fault
    persistent: AtomicBool,
    /// Set once the namespace directory is known to be writable
    prepared: AtomicBool,
    counters: Mutex<Counters>,
}

impl Namespace {
    fn new(name: String, capacity: usize, persistent: bool) -> Self {
        Self {
            name,
            memory: Mutex::new(MemoryTier::new(capacity)),
            persistent: AtomicBool::new(persistent),
            prepared: AtomicBool::new(false),
            counters: Mutex::new(Counters::default()),
        }
    }

    fn record(&self, update: impl FnOnce(&mut Counters)) {
        update(&mut self.counters.lock());
    }

    fn disable_persistence(&self, error: &CacheError) {
        if self.persistent.swap(false, Ordering::SeqCst) {
            warn!(
                namespace = %self.name,
                error = %error,
                "Persistent cache tier unavailable, continuing memory-only"
            );
        }
    }
}

/// Runs blocking disk work on the blocking thread pool
///
/// A caller that stops waiting does not abort the work; the task runs to
/// completion, and record writes are atomic renames.
async fn run_blocking<R, F>(disk: DiskTier, work: F) -> Result<R, CacheError>
where
    F: FnOnce(&DiskTier) -> Result<R, CacheError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(move || work(&disk)).await?
}

/// Multi-level cache shared by every caller in the process
#[derive(Debug)]
pub struct CacheStore {
    config: CacheConfig,
    disk: Option<DiskTier>,
    clock: Arc<dyn Clock>,
    namespaces: Mutex<HashMap<String, Arc<Namespace>>>,
}

impl CacheStore {
    /// Creates a store using wall-clock time and JSON records
    pub fn new(config: CacheConfig) -> Self {
        let disk = config
            .persistent_enabled
            .then(|| DiskTier::new(config.storage_root.clone(), Arc::new(JsonCodec)));
        Self {
            config,
            disk,
            clock: Arc::new(SystemClock),
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    /// Replaces the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the record serialization strategy
    pub fn with_codec(mut self, codec: Arc<dyn RecordCodec>) -> Self {
        self.disk = self
            .disk
            .map(|disk| DiskTier::new(disk.root().to_path_buf(), codec));
        self
    }

    /// Returns a fresh value, or `None` on a miss
    ///
    /// Expired memory entries are dropped when seen. A fresh record found
    /// only on disk is promoted into memory. A payload that does not decode
    /// as `T` counts as a miss.
    pub async fn get<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<T>, CacheError> {
        let ns = self.namespace(namespace)?;
        let key = sanitize_key(key)?;

        match self.lookup(&ns, &key, true).await {
            Lookup::Fresh(entry) => Ok(decode(&ns, &key, &entry)),
            Lookup::Expired(_) | Lookup::Miss => Ok(None),
        }
    }

    /// Like [`CacheStore::get`], falling back to `default` on a miss
    pub async fn get_or<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
        default: T,
    ) -> Result<T, CacheError> {
        Ok(self.get(namespace, key).await?.unwrap_or(default))
    }

    /// Returns a fresh value, or an expired one no older than `max_age`
    ///
    /// With `max_age = None` an expired entry of any age qualifies.
    /// Expired values come back with `is_stale = true`.
    pub async fn get_with_stale<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
        max_age: Option<Duration>,
    ) -> Result<Option<CachedData<T>>, CacheError> {
        self.read_with_stale(namespace, key, max_age, true).await
    }

    /// Looks a key up again for a request that already counted its miss
    ///
    /// Behaves like [`CacheStore::get_with_stale`] with no age limit, but a
    /// miss here is not recorded a second time.
    pub(crate) async fn recheck_with_stale<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<Option<CachedData<T>>, CacheError> {
        self.read_with_stale(namespace, key, None, false).await
    }

    async fn read_with_stale<T: DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
        max_age: Option<Duration>,
        count_miss: bool,
    ) -> Result<Option<CachedData<T>>, CacheError> {
        let ns = self.namespace(namespace)?;
        let key = sanitize_key(key)?;

        let (entry, is_stale) = match self.lookup(&ns, &key, count_miss).await {
            Lookup::Fresh(entry) => (entry, false),
            Lookup::Expired(entry) => {
                let age = entry.age(self.clock.now());
                if max_age.is_some_and(|max_age| age > max_age) {
                    debug!(namespace = %ns.name, key = %key, age_secs = age.num_seconds(), "Stale entry too old");
                    return Ok(None);
                }
                (entry, true)
            }
            Lookup::Miss => return Ok(None),
        };

        Ok(decode(&ns, &key, &entry).map(|data| CachedData {
            data,
            cached_at: entry.created_at,
            is_stale,
        }))
    }

    /// Stores a value in both tiers
    ///
    /// `ttl = None` applies the configured default TTL (which may itself be
    /// "never expires"). Fails only for an invalid key or a payload that
    /// cannot be represented as JSON.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        metadata: Option<Metadata>,
    ) -> Result<(), CacheError> {
        let ns = self.namespace(namespace)?;
        let key = sanitize_key(key)?;
        let entry = CacheEntry::new(
            serde_json::to_value(value)?,
            self.clock.now(),
            ttl.or_else(|| self.config.default_ttl()),
            metadata.unwrap_or_default(),
        );

        ns.record(|c| c.writes += 1);
        if self.config.memory_enabled {
            self.insert_memory(&ns, &key, entry.clone());
        }

        if let Some(disk) = self.writable_tier(&ns).await {
            let (name, record_key) = (ns.name.clone(), key.clone());
            if let Err(e) = run_blocking(disk, move |disk| disk.write(&name, &record_key, &entry)).await {
                ns.disable_persistence(&e);
            }
        }

        Ok(())
    }

    /// Removes a key from both tiers
    pub async fn delete(&self, namespace: &str, key: &str) -> Result<(), CacheError> {
        let ns = self.namespace(namespace)?;
        let key = sanitize_key(key)?;

        ns.memory.lock().remove(&key);

        if let Some(disk) = self.persistent_tier(&ns) {
            let (name, record_key) = (ns.name.clone(), key.clone());
            if let Err(e) = run_blocking(disk, move |disk| disk.remove(&name, &record_key)).await {
                warn!(namespace = %ns.name, key = %key, error = %e, "Failed to delete cache record");
            }
        }

        Ok(())
    }

    /// Removes every key in a namespace from both tiers
    pub async fn clear(&self, namespace: &str) -> Result<(), CacheError> {
        let ns = self.namespace(namespace)?;

        let in_memory = {
            let mut memory = ns.memory.lock();
            let len = memory.len();
            memory.clear();
            len
        };

        let mut on_disk = 0;
        if let Some(disk) = self.persistent_tier(&ns) {
            let name = ns.name.clone();
            match run_blocking(disk, move |disk| disk.clear(&name)).await {
                Ok(removed) => on_disk = removed,
                Err(e) => warn!(namespace = %ns.name, error = %e, "Failed to clear cache records"),
            }
            // The namespace directory is gone; recreate it on next use
            ns.prepared.store(false, Ordering::SeqCst);
        }

        debug!(namespace = %ns.name, in_memory, on_disk, "Cleared cache namespace");
        Ok(())
    }

    /// Removes expired entries from both tiers
    ///
    /// Memory and disk copies of the same key count separately.
    pub async fn cleanup_expired(&self, namespace: &str) -> Result<usize, CacheError> {
        let ns = self.namespace(namespace)?;
        let now = self.clock.now();

        let mut removed = ns.memory.lock().remove_expired(now);

        if let Some(disk) = self.persistent_tier(&ns) {
            let name = ns.name.clone();
            match run_blocking(disk, move |disk| disk.remove_expired(&name, now)).await {
                Ok(count) => removed += count,
                Err(e) => warn!(namespace = %ns.name, error = %e, "Failed to clean up cache records"),
            }
        }

        debug!(namespace = %ns.name, removed, "Removed expired cache entries");
        Ok(removed)
    }

    /// Counters and tier sizes for a namespace
    pub async fn stats(&self, namespace: &str) -> Result<CacheStats, CacheError> {
        let ns = self.namespace(namespace)?;
        let counters = *ns.counters.lock();
        let entry_count = ns.memory.lock().len();

        let mut persistent_entries = 0;
        if let Some(disk) = self.persistent_tier(&ns) {
            let name = ns.name.clone();
            match run_blocking(disk, move |disk| disk.count(&name)).await {
                Ok(count) => persistent_entries = count,
                Err(e) => debug!(namespace = %ns.name, error = %e, "Failed to count cache records"),
            }
        }

        let persistent_enabled = self.disk.is_some() && ns.persistent.load(Ordering::SeqCst);
        Ok(CacheStats::from_counters(
            counters,
            entry_count,
            persistent_entries,
            persistent_enabled,
        ))
    }

    /// Namespaces used in this process or present under the storage root
    pub async fn namespaces(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.namespaces.lock().keys().cloned().collect();

        if let Some(disk) = &self.disk {
            match run_blocking(disk.clone(), |disk| disk.namespaces()).await {
                Ok(found) => names.extend(found),
                Err(e) => debug!(error = %e, "Failed to list cache namespaces"),
            }
        }

        names.into_iter().collect()
    }

    fn namespace(&self, raw: &str) -> Result<Arc<Namespace>, CacheError> {
        let name = sanitize_key(raw)?;
        let mut namespaces = self.namespaces.lock();
        let ns = namespaces.entry(name.clone()).or_insert_with(|| {
            Arc::new(Namespace::new(
                name,
                self.config.memory_capacity(),
                self.disk.is_some(),
            ))
        });
        Ok(Arc::clone(ns))
    }

    /// The disk tier, if still usable for this namespace
    ///
    /// Never touches the filesystem. Readers treat a missing namespace
    /// directory as empty.
    fn persistent_tier(&self, ns: &Namespace) -> Option<DiskTier> {
        let disk = self.disk.as_ref()?;
        ns.persistent.load(Ordering::SeqCst).then(|| disk.clone())
    }

    /// The disk tier for a write, creating the namespace directory first
    async fn writable_tier(&self, ns: &Namespace) -> Option<DiskTier> {
        let disk = self.persistent_tier(ns)?;

        if !ns.prepared.load(Ordering::SeqCst) {
            let name = ns.name.clone();
            match run_blocking(disk.clone(), move |disk| disk.prepare(&name)).await {
                Ok(()) => ns.prepared.store(true, Ordering::SeqCst),
                Err(e) => {
                    ns.disable_persistence(&e);
                    return None;
                }
            }
        }

        Some(disk)
    }

    async fn lookup(&self, ns: &Namespace, key: &str, count_miss: bool) -> Lookup {
        let now = self.clock.now();
        let mut expired = None;

        if self.config.memory_enabled {
            let mut memory = ns.memory.lock();
            let found = memory
                .get(key)
                .map(|entry| (entry.is_expired(now), entry.clone()));
            match found {
                Some((false, entry)) => {
                    drop(memory);
                    ns.record(|c| c.memory_hits += 1);
                    return Lookup::Fresh(entry);
                }
                Some((true, entry)) => {
                    memory.remove(key);
                    drop(memory);
                    ns.record(|c| c.expirations += 1);
                    expired = Some(entry);
                }
                None => {}
            }
        }

        if let Some(disk) = self.persistent_tier(ns) {
            let (name, record_key) = (ns.name.clone(), key.to_string());
            match run_blocking(disk, move |disk| disk.read(&name, &record_key)).await {
                Ok(Some(entry)) if !entry.is_expired(now) => {
                    ns.record(|c| c.persistent_hits += 1);
                    if self.config.memory_enabled {
                        self.insert_memory(ns, key, entry.clone());
                    }
                    return Lookup::Fresh(entry);
                }
                Ok(Some(entry)) => {
                    expired = match expired {
                        Some(held) if newer(&held, &entry) => Some(held),
                        _ => Some(entry),
                    };
                }
                Ok(None) => {}
                Err(CacheError::Serialization(e)) => {
                    debug!(namespace = %ns.name, key = %key, error = %e, "Ignoring corrupt cache record");
                }
                Err(e) => {
                    warn!(namespace = %ns.name, key = %key, error = %e, "Failed to read cache record");
                }
            }
        }

        if count_miss {
            ns.record(|c| c.misses += 1);
        }
        match expired {
            Some(entry) => Lookup::Expired(entry),
            None => Lookup::Miss,
        }
    }

    fn insert_memory(&self, ns: &Namespace, key: &str, entry: StoredEntry) {
        let evicted = ns.memory.lock().insert(key.to_string(), entry);
        if let Some(evicted) = evicted {
            ns.record(|c| c.evictions += 1);
            debug!(namespace = %ns.name, key = %evicted, "Evicted least recently used entry");
        }
    }
}

fn newer(a: &StoredEntry, b: &StoredEntry) -> bool {
    a.created_at >= b.created_at
}

fn decode<T: DeserializeOwned>(ns: &Namespace, key: &str, entry: &StoredEntry) -> Option<T> {
    match entry.decode() {
        Ok(value) => Some(value),
        Err(e) => {
            debug!(namespace = %ns.name, key = %key, error = %e, "Cached payload has unexpected shape");
            None
        }
    }
}
