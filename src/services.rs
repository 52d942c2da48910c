//! Process-wide wiring of the cache, budgets and upstream clients
//!
//! [`Services`] is built once at startup from [`AppConfig`] and handed to
//! whatever needs aviation data. It owns the single [`CacheStore`], one
//! [`RateLimiter`] and [`ResilientFetcher`] per source, and the HTTP
//! clients. [`Services::shutdown`] saves the day's request counts so a
//! restart does not hand out a fresh budget.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::CacheStore;
use crate::config::{AppConfig, SourceConfig};
use crate::fetcher::{FetchOutcome, FetcherStats, ResilientFetcher};
use crate::rate_limit::{RateLimitStats, RateLimiter};
use crate::sources::{normalize_icao, AviationWeatherClient, NotamClient, SourceError};

/// Cache namespace for METAR and TAF payloads
pub const WEATHER_NAMESPACE: &str = "weather";

/// Cache namespace for NOTAM payloads
pub const NOTAM_NAMESPACE: &str = "notam";

/// Directory under the storage root holding saved rate-limit state
const LIMITS_DIR: &str = ".limits";

/// Everything a collaborator needs to read aviation data
#[derive(Debug)]
pub struct Services {
    store: Arc<CacheStore>,
    weather: ResilientFetcher,
    notam: ResilientFetcher,
    weather_client: AviationWeatherClient,
    notam_client: NotamClient,
}

impl Services {
    /// Builds the services, restoring saved budgets when persistence is on
    pub async fn start(config: &AppConfig) -> Self {
        let store = Arc::new(CacheStore::new(config.cache.clone()));
        let limits_dir = config
            .cache
            .persistent_enabled
            .then(|| config.cache.storage_root.join(LIMITS_DIR));

        let weather = Self::fetcher(WEATHER_NAMESPACE, &config.weather, &store, limits_dir.clone()).await;
        let notam = Self::fetcher(NOTAM_NAMESPACE, &config.notam, &store, limits_dir).await;

        info!(
            storage_root = %config.cache.storage_root.display(),
            persistent = config.cache.persistent_enabled,
            "Aviation data services started"
        );

        Self {
            store,
            weather,
            notam,
            weather_client: AviationWeatherClient::from_config(&config.weather),
            notam_client: NotamClient::from_config(&config.notam),
        }
    }

    async fn fetcher(
        namespace: &str,
        config: &SourceConfig,
        store: &Arc<CacheStore>,
        limits_dir: Option<PathBuf>,
    ) -> ResilientFetcher {
        let limiter = RateLimiter::from_config(namespace, config);
        let limiter = match limits_dir {
            Some(dir) => limiter.restore(dir.join(format!("{}.json", namespace))).await,
            None => limiter,
        };
        ResilientFetcher::new(namespace, Arc::clone(store), Arc::new(limiter)).with_ttl(config.ttl())
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn weather(&self) -> &ResilientFetcher {
        &self.weather
    }

    pub fn notam(&self) -> &ResilientFetcher {
        &self.notam
    }

    /// Latest METAR for a station
    pub async fn metar(&self, icao: &str) -> Result<FetchOutcome<Value>, SourceError> {
        let icao = normalize_icao(icao)?;
        let client = &self.weather_client;
        Ok(self
            .weather
            .fetch(&format!("metar_{}", icao), || client.fetch_metar(&icao))
            .await?)
    }

    /// Current TAF for a station
    pub async fn taf(&self, icao: &str) -> Result<FetchOutcome<Value>, SourceError> {
        let icao = normalize_icao(icao)?;
        let client = &self.weather_client;
        Ok(self
            .weather
            .fetch(&format!("taf_{}", icao), || client.fetch_taf(&icao))
            .await?)
    }

    /// Active NOTAMs for a location
    pub async fn notams(&self, icao: &str) -> Result<FetchOutcome<Value>, SourceError> {
        let icao = normalize_icao(icao)?;
        let client = &self.notam_client;
        Ok(self.notam.fetch(&icao, || client.fetch_notams(&icao)).await?)
    }

    /// Budget usage per source
    pub fn budgets(&self) -> Vec<RateLimitStats> {
        vec![self.weather.limiter().stats(), self.notam.limiter().stats()]
    }

    /// Fetcher activity per source
    pub fn fetcher_stats(&self) -> Vec<(&str, FetcherStats)> {
        vec![
            (self.weather.namespace(), self.weather.stats()),
            (self.notam.namespace(), self.notam.stats()),
        ]
    }

    /// Saves rate-limit state; cached data is already on disk
    pub async fn shutdown(&self) {
        for fetcher in [&self.weather, &self.notam] {
            if let Err(e) = fetcher.limiter().save().await {
                warn!(source = %fetcher.namespace(), error = %e, "Failed to save rate limit state");
            }
            debug!(source = %fetcher.namespace(), stats = ?fetcher.stats(), "Fetcher stopped");
        }
    }
}
