//! Configuration for the cache store and the upstream sources
//!
//! Configuration is a single JSON document. Each section may be omitted and
//! cache fields default individually, so an empty object (or no file at
//! all) yields a working setup. A source section, when present, is given in
//! full:
//!
//! ```json
//! {
//!   "cache": { "ttlMinutes": 15, "storageRoot": "/var/cache/aerocache" },
//!   "weather": { "baseUrl": "https://aviationweather.gov/api/data",
//!                "dailyBudget": 3000, "warnThreshold": 2500, "ttlMinutes": 15 }
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default aviation weather API endpoint
pub const DEFAULT_WEATHER_URL: &str = "https://aviationweather.gov/api/data";

/// Default NOTAM API endpoint
pub const DEFAULT_NOTAM_URL: &str = "https://external-api.faa.gov/notamapi/v1/notams";

/// Settings recognized by the cache store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    /// Whether the in-memory tier is used
    pub memory_enabled: bool,
    /// Whether the on-disk tier is used
    pub persistent_enabled: bool,
    /// TTL applied when `set` is called without one; `None` never expires
    pub ttl_minutes: Option<u32>,
    /// Bound on memory entries per namespace
    pub max_memory_entries: usize,
    /// Directory holding one subdirectory per namespace
    pub storage_root: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_enabled: true,
            persistent_enabled: true,
            ttl_minutes: Some(15),
            max_memory_entries: 500,
            storage_root: default_storage_root(),
        }
    }
}

impl CacheConfig {
    /// Memory-only settings, for tests and ephemeral embedders
    pub fn memory_only() -> Self {
        Self {
            persistent_enabled: false,
            ..Self::default()
        }
    }

    /// Settings persisting under `storage_root`
    pub fn with_storage_root(storage_root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: storage_root.into(),
            ..Self::default()
        }
    }

    /// Default TTL as a duration
    pub fn default_ttl(&self) -> Option<Duration> {
        self.ttl_minutes.map(|minutes| Duration::minutes(i64::from(minutes)))
    }

    /// Memory bound with zero clamped to one
    pub fn memory_capacity(&self) -> usize {
        self.max_memory_entries.max(1)
    }
}

/// XDG-compliant cache directory (`~/.cache/aerocache` on Linux)
///
/// Falls back to the system temp directory when no home directory exists.
pub fn default_storage_root() -> PathBuf {
    ProjectDirs::from("", "", "aerocache")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("aerocache"))
}

/// Settings for one upstream source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    /// API base URL
    pub base_url: String,
    /// Requests allowed per UTC day
    pub daily_budget: u32,
    /// Request count at which a one-time warning is logged
    pub warn_threshold: u32,
    /// How long fetched data stays fresh
    pub ttl_minutes: u32,
    /// Optional API credentials sent as `client_id`/`client_secret` headers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl SourceConfig {
    /// Aviation weather defaults
    pub fn weather() -> Self {
        Self {
            base_url: DEFAULT_WEATHER_URL.to_string(),
            daily_budget: 3000,
            warn_threshold: 2500,
            ttl_minutes: 15,
            client_id: None,
            client_secret: None,
        }
    }

    /// NOTAM feed defaults
    pub fn notam() -> Self {
        Self {
            base_url: DEFAULT_NOTAM_URL.to_string(),
            daily_budget: 1000,
            warn_threshold: 800,
            ttl_minutes: 60,
            client_id: None,
            client_secret: None,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::minutes(i64::from(self.ttl_minutes))
    }
}

fn default_weather() -> SourceConfig {
    SourceConfig::weather()
}

fn default_notam() -> SourceConfig {
    SourceConfig::notam()
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default = "default_weather")]
    pub weather: SourceConfig,
    #[serde(default = "default_notam")]
    pub notam: SourceConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            weather: SourceConfig::weather(),
            notam: SourceConfig::notam(),
        }
    }
}

impl AppConfig {
    /// Reads configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads `path` if given, otherwise returns defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}
