//! Get-or-refresh-or-degrade policy for one upstream source
//!
//! [`ResilientFetcher::fetch`] answers with the freshest value it is allowed
//! to produce:
//!
//! 1. a fresh cache hit, without touching the source or the budget
//! 2. otherwise, if the daily budget allows, a new value from the source,
//!    written back to the cache
//! 3. otherwise (budget exhausted or the fetch failed) a cached value of
//!    any age, flagged stale
//! 4. otherwise [`FetchOutcome::Unavailable`]
//!
//! Concurrent callers for the same key share one upstream request: the
//! first caller fetches while the others wait on a per-key gate, then read
//! what it cached.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Duration;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::cache::{sanitize_key, CacheStore, CachedData, Metadata};
use crate::error::CacheError;
use crate::rate_limit::RateLimiter;

/// What a fetch produced
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome<T> {
    /// Current data, from the cache or straight from the source
    Fresh(T),
    /// Expired cached data served because the source could not be used
    Stale(T),
    /// Nothing cached and the source could not be used
    Unavailable,
}

impl<T> FetchOutcome<T> {
    pub fn is_stale(&self) -> bool {
        matches!(self, FetchOutcome::Stale(_))
    }

    pub fn is_available(&self) -> bool {
        !matches!(self, FetchOutcome::Unavailable)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            FetchOutcome::Fresh(value) | FetchOutcome::Stale(value) => Some(value),
            FetchOutcome::Unavailable => None,
        }
    }

    /// Splits into `(value, is_stale)`
    pub fn into_parts(self) -> (Option<T>, bool) {
        match self {
            FetchOutcome::Fresh(value) => (Some(value), false),
            FetchOutcome::Stale(value) => (Some(value), true),
            FetchOutcome::Unavailable => (None, false),
        }
    }

    fn from_cached(cached: CachedData<T>) -> Self {
        if cached.is_stale {
            FetchOutcome::Stale(cached.data)
        } else {
            FetchOutcome::Fresh(cached.data)
        }
    }
}

/// Fetcher activity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetcherStats {
    /// Calls answered by a fresh cache entry
    pub cache_hits: u64,
    /// Upstream requests issued
    pub fetches: u64,
    /// Failed fetches plus budget blocks
    pub failures: u64,
    /// Failures since the last successful fetch
    pub consecutive_failures: u64,
    /// Calls answered with stale data
    pub stale_served: u64,
    /// Calls answered with nothing
    pub unavailable: u64,
    /// Calls that waited on another caller's in-flight fetch
    pub coalesced: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cache_hits: AtomicU64,
    fetches: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
    stale_served: AtomicU64,
    unavailable: AtomicU64,
    coalesced: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Holds a key's gate; releases and unregisters it when dropped
struct InFlight<'a> {
    registry: &'a Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    key: String,
    gate: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut registry = self.registry.lock();
        // Registry plus this handle; anyone else still waiting holds another
        if Arc::strong_count(&self.gate) <= 2 {
            registry.remove(&self.key);
        }
    }
}

/// Cache + budget + upstream for one source
#[derive(Debug)]
pub struct ResilientFetcher {
    namespace: String,
    ttl: Option<Duration>,
    store: Arc<CacheStore>,
    limiter: Arc<RateLimiter>,
    single_flight: bool,
    in_flight: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    counters: Counters,
}

impl ResilientFetcher {
    /// Creates a fetcher caching into `namespace`
    pub fn new(namespace: impl Into<String>, store: Arc<CacheStore>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            namespace: namespace.into(),
            ttl: None,
            store,
            limiter,
            single_flight: true,
            in_flight: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// TTL for fetched values; the store default applies otherwise
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Lets concurrent callers for the same key each fetch independently
    pub fn without_single_flight(mut self) -> Self {
        self.single_flight = false;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Failures since the last successful fetch
    pub fn consecutive_failures(&self) -> u64 {
        self.counters.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> FetcherStats {
        let c = &self.counters;
        FetcherStats {
            cache_hits: c.cache_hits.load(Ordering::Relaxed),
            fetches: c.fetches.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            consecutive_failures: c.consecutive_failures.load(Ordering::Relaxed),
            stale_served: c.stale_served.load(Ordering::Relaxed),
            unavailable: c.unavailable.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
        }
    }

    /// Returns the freshest value allowed for `key`
    ///
    /// `fetch_fn` is only invoked when the cache has nothing fresh and the
    /// daily budget allows a request. Its error (including its own timeout)
    /// is logged and answered with stale data or `Unavailable`; only an
    /// invalid key is returned as an error.
    pub async fn fetch<T, F, Fut, E>(&self, key: &str, fetch_fn: F) -> Result<FetchOutcome<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let key = sanitize_key(key)?;

        let fallback = match self.store.get_with_stale::<T>(&self.namespace, &key, None).await? {
            Some(cached) if !cached.is_stale => {
                Counters::bump(&self.counters.cache_hits);
                return Ok(FetchOutcome::Fresh(cached.data));
            }
            other => other,
        };

        let _in_flight = if self.single_flight {
            let (in_flight, waited) = self.enter(&key).await;
            if waited {
                // The caller we waited on may have refreshed the entry
                if let Some(cached) = self.store.recheck_with_stale::<T>(&self.namespace, &key).await? {
                    if !cached.is_stale {
                        Counters::bump(&self.counters.cache_hits);
                        return Ok(FetchOutcome::Fresh(cached.data));
                    }
                }
            }
            Some(in_flight)
        } else {
            None
        };

        if !self.limiter.try_acquire() {
            debug!(namespace = %self.namespace, key = %key, "Budget exhausted, skipping upstream fetch");
            return self.degrade(&key, fallback).await;
        }

        Counters::bump(&self.counters.fetches);

        match fetch_fn().await {
            Ok(value) => {
                self.counters.consecutive_failures.store(0, Ordering::Relaxed);
                let mut metadata = Metadata::new();
                metadata.insert("source".to_string(), self.namespace.clone().into());
                if let Err(e) = self
                    .store
                    .set(&self.namespace, &key, &value, self.ttl, Some(metadata))
                    .await
                {
                    warn!(namespace = %self.namespace, key = %key, error = %e, "Failed to cache fetched value");
                }
                Ok(FetchOutcome::Fresh(value))
            }
            Err(e) => {
                warn!(namespace = %self.namespace, key = %key, error = %e, "Upstream fetch failed");
                self.degrade(&key, fallback).await
            }
        }
    }

    /// Answers from the cache after the source could not be used
    async fn degrade<T: DeserializeOwned>(
        &self,
        key: &str,
        fallback: Option<CachedData<T>>,
    ) -> Result<FetchOutcome<T>, CacheError> {
        Counters::bump(&self.counters.failures);
        let failures = Counters::bump(&self.counters.consecutive_failures);

        // Prefer whatever is cached now; an expired memory entry was already
        // dropped by the first lookup, so keep that copy as a last resort
        let cached = match self.store.recheck_with_stale::<T>(&self.namespace, key).await? {
            Some(cached) => Some(cached),
            None => fallback,
        };

        match cached {
            Some(cached) => {
                if cached.is_stale {
                    Counters::bump(&self.counters.stale_served);
                } else {
                    Counters::bump(&self.counters.cache_hits);
                }
                info!(
                    namespace = %self.namespace,
                    key = %key,
                    cached_at = %cached.cached_at,
                    consecutive_failures = failures,
                    "Serving cached data"
                );
                Ok(FetchOutcome::from_cached(cached))
            }
            None => {
                Counters::bump(&self.counters.unavailable);
                warn!(
                    namespace = %self.namespace,
                    key = %key,
                    consecutive_failures = failures,
                    "No data available"
                );
                Ok(FetchOutcome::Unavailable)
            }
        }
    }

    /// Takes the key's gate, waiting if another caller holds it
    ///
    /// Returns whether this caller had to wait.
    async fn enter(&self, key: &str) -> (InFlight<'_>, bool) {
        let gate = {
            let mut registry = self.in_flight.lock();
            Arc::clone(
                registry
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        let mut in_flight = InFlight {
            registry: &self.in_flight,
            key: key.to_string(),
            gate: Arc::clone(&gate),
            guard: None,
        };

        match Arc::clone(&gate).try_lock_owned() {
            Ok(guard) => {
                in_flight.guard = Some(guard);
                (in_flight, false)
            }
            Err(_) => {
                Counters::bump(&self.counters.coalesced);
                debug!(namespace = %self.namespace, key = %key, "Waiting for in-flight fetch");
                in_flight.guard = Some(gate.lock_owned().await);
                (in_flight, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStats;
    use crate::clock::{Clock, ManualClock};
    use crate::config::CacheConfig;
    use crate::rate_limit::RateLimitState;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        fetcher: ResilientFetcher,
        clock: Arc<ManualClock>,
        calls: AtomicUsize,
    }

    impl Harness {
        fn new(budget: u32) -> Self {
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 7, 15, 12, 0, 0).unwrap(),
            ));
            let store = Arc::new(CacheStore::new(CacheConfig::memory_only()).with_clock(clock.clone()));
            let limiter = Arc::new(RateLimiter::new("weather", budget, budget).with_clock(clock.clone()));
            let fetcher = ResilientFetcher::new("weather", store, limiter).with_ttl(Duration::minutes(15));
            Self {
                fetcher,
                clock,
                calls: AtomicUsize::new(0),
            }
        }

        async fn succeed(&self, value: &str) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(value.to_string())
        }

        async fn fail(&self) -> Result<String, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err("connection refused".to_string())
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn cache_stats(&self) -> CacheStats {
            self.fetcher.store().stats("weather").await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_first_fetch_populates_cache() {
        let h = Harness::new(100);

        let outcome = h.fetcher.fetch("KJFK", || h.succeed("METAR KJFK")).await.unwrap();

        assert_eq!(outcome, FetchOutcome::Fresh("METAR KJFK".to_string()));
        assert_eq!(h.calls(), 1);
        assert_eq!(h.fetcher.limiter().stats().count, 1);
        assert_eq!(h.cache_stats().await.writes, 1);
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_source_and_budget() {
        let h = Harness::new(100);
        h.fetcher.fetch("KJFK", || h.succeed("first")).await.unwrap();

        let outcome = h.fetcher.fetch("KJFK", || h.succeed("second")).await.unwrap();

        assert_eq!(outcome.value().map(String::as_str), Some("first"));
        assert_eq!(h.calls(), 1);
        assert_eq!(h.fetcher.limiter().stats().count, 1);
        assert_eq!(h.fetcher.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_refetched() {
        let h = Harness::new(100);
        h.fetcher.fetch("KJFK", || h.succeed("old")).await.unwrap();
        h.clock.advance(Duration::minutes(16));

        let outcome = h.fetcher.fetch("KJFK", || h.succeed("new")).await.unwrap();

        assert_eq!(outcome, FetchOutcome::Fresh("new".to_string()));
        assert_eq!(h.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_serves_stale_and_counts() {
        let h = Harness::new(100);
        h.fetcher.fetch("KJFK", || h.succeed("cached")).await.unwrap();
        h.clock.advance(Duration::hours(2));

        let outcome = h.fetcher.fetch("KJFK", || h.fail()).await.unwrap();

        assert_eq!(outcome, FetchOutcome::Stale("cached".to_string()));
        assert_eq!(outcome.clone().into_parts(), (Some("cached".to_string()), true));
        assert_eq!(h.fetcher.consecutive_failures(), 1);
        assert_eq!(h.fetcher.stats().stale_served, 1);
    }

    #[tokio::test]
    async fn test_failure_with_empty_cache_is_unavailable() {
        let h = Harness::new(100);

        let outcome = h.fetcher.fetch("KJFK", || h.fail()).await.unwrap();

        assert_eq!(outcome, FetchOutcome::Unavailable);
        assert!(!outcome.is_available());
        assert_eq!(h.fetcher.stats().unavailable, 1);
        assert_eq!(h.fetcher.consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_counts_one_miss() {
        let h = Harness::new(100);

        h.fetcher.fetch("KJFK", || h.fail()).await.unwrap();

        assert_eq!(h.cache_stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_refresh_during_failure_is_not_stale() {
        let h = Harness::new(100);
        let store = Arc::clone(h.fetcher.store());

        let outcome = h
            .fetcher
            .fetch("KJFK", || async {
                store
                    .set("weather", "KJFK", &"refreshed", None, None)
                    .await
                    .unwrap();
                Err::<String, _>("connection reset")
            })
            .await
            .unwrap();

        assert_eq!(outcome, FetchOutcome::Fresh("refreshed".to_string()));
        let stats = h.fetcher.stats();
        assert_eq!(stats.stale_served, 0);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.failures, 1);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let h = Harness::new(100);
        h.fetcher.fetch("KJFK", || h.fail()).await.unwrap();
        h.fetcher.fetch("KJFK", || h.fail()).await.unwrap();
        assert_eq!(h.fetcher.consecutive_failures(), 2);

        h.fetcher.fetch("KJFK", || h.succeed("ok")).await.unwrap();

        assert_eq!(h.fetcher.consecutive_failures(), 0);
        assert_eq!(h.fetcher.stats().failures, 2);
    }

    #[tokio::test]
    async fn test_budget_block_never_calls_source() {
        let h = Harness::new(5);
        h.fetcher.fetch("KJFK", || h.succeed("cached")).await.unwrap();
        h.clock.advance(Duration::hours(1));
        let today = h.clock.now().date_naive();
        h.fetcher.limiter().set_state(RateLimitState {
            count: 5,
            window_start_date: today,
            warned: true,
            warnings: 1,
        });

        let outcome = h.fetcher.fetch("KJFK", || h.succeed("fresh")).await.unwrap();

        assert_eq!(outcome, FetchOutcome::Stale("cached".to_string()));
        assert_eq!(h.calls(), 1);
        assert_eq!(h.fetcher.consecutive_failures(), 1);
        assert_eq!(h.fetcher.limiter().stats().count, 5);
    }

    #[tokio::test]
    async fn test_invalid_key_is_an_error() {
        let h = Harness::new(100);

        let result = h.fetcher.fetch("..", || h.succeed("never")).await;

        assert!(matches!(result, Err(CacheError::InvalidKey(_))));
        assert_eq!(h.calls(), 0);
    }

    #[tokio::test]
    async fn test_fetched_value_tagged_with_source() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(CacheStore::new(CacheConfig::with_storage_root(temp_dir.path())));
        let limiter = Arc::new(RateLimiter::new("notam", 10, 8));
        let fetcher = ResilientFetcher::new("notam", store, limiter);

        fetcher
            .fetch("KJFK", || async { Ok::<_, String>(vec!["A0001/24".to_string()]) })
            .await
            .unwrap();

        let record =
            std::fs::read_to_string(temp_dir.path().join("notam").join("KJFK.json")).unwrap();
        assert!(record.contains("\"source\": \"notam\""));
    }

    async fn slow_fetch(calls: &AtomicUsize) -> Result<String, String> {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        Ok("shared".to_string())
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let h = Harness::new(100);

        let (a, b) = tokio::join!(
            h.fetcher.fetch("KJFK", || slow_fetch(&h.calls)),
            h.fetcher.fetch("KJFK", || slow_fetch(&h.calls)),
        );

        assert_eq!(a.unwrap(), FetchOutcome::Fresh("shared".to_string()));
        assert_eq!(b.unwrap(), FetchOutcome::Fresh("shared".to_string()));
        assert_eq!(h.calls(), 1);
        assert_eq!(h.fetcher.stats().coalesced, 1);
        assert!(h.fetcher.in_flight.lock().is_empty());
    }

    #[tokio::test]
    async fn test_without_single_flight_fetches_twice() {
        let mut h = Harness::new(100);
        h.fetcher = h.fetcher.without_single_flight();

        let (a, b) = tokio::join!(
            h.fetcher.fetch("KJFK", || slow_fetch(&h.calls)),
            h.fetcher.fetch("KJFK", || slow_fetch(&h.calls)),
        );

        assert!(a.unwrap().is_available());
        assert!(b.unwrap().is_available());
        assert_eq!(h.calls(), 2);
    }
}
