//! Upstream aviation data clients
//!
//! Thin HTTP clients whose fetch methods are handed to a
//! [`ResilientFetcher`](crate::fetcher::ResilientFetcher). Payloads are kept
//! as raw JSON; interpreting METAR, TAF or NOTAM content is up to callers.

pub mod notam;
pub mod weather;

pub use notam::NotamClient;
pub use weather::AviationWeatherClient;

use std::time::Duration;

use reqwest::{Client, Response};
use serde_json::Value;
use thiserror::Error;

use crate::error::CacheError;

/// Per-request timeout for upstream calls
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors that can occur when fetching from an upstream source
#[derive(Debug, Error)]
pub enum SourceError {
    /// HTTP request failed (connection, timeout, TLS)
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    /// Upstream answered with a non-success status
    #[error("Upstream returned HTTP {0}")]
    Status(u16),

    /// Failed to parse JSON response
    #[error("Failed to parse JSON response: {0}")]
    ParseError(#[from] serde_json::Error),

    /// Response contained no data for the request
    #[error("No data returned for {0}")]
    EmptyPayload(String),

    /// Identifier is not an ICAO location code
    #[error("Invalid ICAO identifier: '{0}'")]
    InvalidIdentifier(String),

    /// Cache rejected the lookup
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

/// Normalizes and validates an ICAO location identifier
///
/// Accepts 3-4 ASCII alphanumerics (e.g. `KJFK`, `LAX`), returned uppercase.
pub fn normalize_icao(raw: &str) -> Result<String, SourceError> {
    let icao = raw.trim().to_ascii_uppercase();
    let valid = (3..=4).contains(&icao.len()) && icao.chars().all(|c| c.is_ascii_alphanumeric());
    if valid {
        Ok(icao)
    } else {
        Err(SourceError::InvalidIdentifier(raw.to_string()))
    }
}

/// HTTP client with the upstream timeout applied
pub(crate) fn http_client() -> Client {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Reads a response body as JSON, rejecting error statuses
pub(crate) async fn read_json(response: Response) -> Result<String, SourceError> {
    let status = response.status();
    if !status.is_success() {
        return Err(SourceError::Status(status.as_u16()));
    }
    Ok(response.text().await?)
}

/// Parses a body, treating `null`, `[]` and blank bodies as no data
pub(crate) fn parse_payload(body: &str, what: &str) -> Result<Value, SourceError> {
    if body.trim().is_empty() {
        return Err(SourceError::EmptyPayload(what.to_string()));
    }
    let payload: Value = serde_json::from_str(body)?;
    let empty = match &payload {
        Value::Null => true,
        Value::Array(items) => items.is_empty(),
        _ => false,
    };
    if empty {
        return Err(SourceError::EmptyPayload(what.to_string()));
    }
    Ok(payload)
}
