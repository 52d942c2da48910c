//! Cache entries and their durable record format
//!
//! A [`CacheEntry`] wraps a payload with its creation time, optional expiry
//! and diagnostic metadata. On disk each entry is one JSON object:
//!
//! ```json
//! {
//!   "data": { ... },
//!   "cachedAt": "2024-07-15T12:00:00Z",
//!   "expiresAt": "2024-07-15T12:15:00Z",
//!   "metadata": { "source": "weather" }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt::Debug;

use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::CacheError;

/// Diagnostic tags attached to an entry (e.g. which source produced it)
pub type Metadata = BTreeMap<String, Value>;

/// Payload-agnostic entry as held by both tiers
pub type StoredEntry = CacheEntry<Value>;

/// A cached value with its freshness window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    /// The cached payload
    #[serde(rename = "data")]
    pub value: T,
    /// When the entry was written
    #[serde(rename = "cachedAt", deserialize_with = "deserialize_timestamp")]
    pub created_at: DateTime<Utc>,
    /// When the entry stops being fresh; `None` never expires by TTL
    #[serde(default, deserialize_with = "deserialize_optional_timestamp")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Diagnostic tags
    #[serde(default)]
    pub metadata: Metadata,
}

impl<T> CacheEntry<T> {
    /// Creates an entry written at `created_at` that lives for `ttl`
    ///
    /// A negative TTL is treated as zero so `expires_at >= created_at` holds.
    /// A TTL reaching past the representable range never expires.
    pub fn new(
        value: T,
        created_at: DateTime<Utc>,
        ttl: Option<Duration>,
        metadata: Metadata,
    ) -> Self {
        let expires_at =
            ttl.and_then(|ttl| created_at.checked_add_signed(ttl.max(Duration::zero())));
        Self {
            value,
            created_at,
            expires_at,
            metadata,
        }
    }

    /// True once `now` has reached the expiry instant
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if now >= expires_at)
    }

    /// Time elapsed since the entry was written
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

impl StoredEntry {
    /// Converts the stored JSON payload into the caller's type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CacheError> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// Parses an ISO-8601 timestamp, accepting both zone-aware and naive forms
///
/// Naive timestamps are taken to be UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(aware) = DateTime::parse_from_rfc3339(raw) {
        return Some(aware.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
}

fn deserialize_optional_timestamp<'de, D>(
    deserializer: D,
) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(raw) => parse_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw))),
    }
}

/// Strategy for turning entries into durable bytes and back
pub trait RecordCodec: Send + Sync + Debug {
    /// Encodes an entry for the persistent tier
    fn encode(&self, entry: &StoredEntry) -> Result<Vec<u8>, CacheError>;

    /// Decodes a persisted record
    fn decode(&self, bytes: &[u8]) -> Result<StoredEntry, CacheError>;

    /// File extension used for records, without the dot
    fn extension(&self) -> &'static str;
}

/// Pretty-printed JSON records
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl RecordCodec for JsonCodec {
    fn encode(&self, entry: &StoredEntry) -> Result<Vec<u8>, CacheError> {
        Ok(serde_json::to_vec_pretty(entry)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<StoredEntry, CacheError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn extension(&self) -> &'static str {
        "json"
    }
}
