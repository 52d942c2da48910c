//! Aviation weather API client (METAR and TAF)

use reqwest::Client;
use serde_json::Value;

use super::{http_client, normalize_icao, parse_payload, read_json, SourceError};
use crate::config::{SourceConfig, DEFAULT_WEATHER_URL};

/// Client for the aviation weather data API
#[derive(Debug, Clone)]
pub struct AviationWeatherClient {
    client: Client,
    base_url: String,
}

impl Default for AviationWeatherClient {
    fn default() -> Self {
        Self::new()
    }
}

impl AviationWeatherClient {
    /// Create a client against the public API
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_WEATHER_URL)
    }

    /// Create a client against a custom endpoint
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        Self::with_base_url(config.base_url.clone())
    }

    /// URL for a product (`metar`, `taf`) at a station
    fn product_url(&self, product: &str, icao: &str) -> String {
        format!("{}/{}?ids={}&format=json", self.base_url, product, icao)
    }

    /// Fetch the latest METAR observation for a station
    pub async fn fetch_metar(&self, icao: &str) -> Result<Value, SourceError> {
        self.fetch_product("metar", icao).await
    }

    /// Fetch the current TAF forecast for a station
    pub async fn fetch_taf(&self, icao: &str) -> Result<Value, SourceError> {
        self.fetch_product("taf", icao).await
    }

    async fn fetch_product(&self, product: &str, icao: &str) -> Result<Value, SourceError> {
        let icao = normalize_icao(icao)?;
        let response = self.client.get(self.product_url(product, &icao)).send().await?;
        let body = read_json(response).await?;
        parse_payload(&body, &format!("{} {}", product, icao))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_default_uses_public_api() {
        let client = AviationWeatherClient::default();
        assert_eq!(client.base_url, DEFAULT_WEATHER_URL);
    }

    #[test]
    fn test_product_url() {
        let client = AviationWeatherClient::with_base_url("http://localhost:8080/api/data/");

        assert_eq!(
            client.product_url("metar", "KJFK"),
            "http://localhost:8080/api/data/metar?ids=KJFK&format=json"
        );
        assert_eq!(
            client.product_url("taf", "EGLL"),
            "http://localhost:8080/api/data/taf?ids=EGLL&format=json"
        );
    }

    #[test]
    fn test_from_config() {
        let mut config = SourceConfig::weather();
        config.base_url = "http://weather.test".to_string();

        let client = AviationWeatherClient::from_config(&config);

        assert_eq!(client.base_url, "http://weather.test");
    }

    #[tokio::test]
    async fn test_invalid_identifier_rejected_before_request() {
        let client = AviationWeatherClient::with_base_url("http://127.0.0.1:9");

        let result = client.fetch_metar("not-an-airport").await;

        assert!(matches!(result, Err(SourceError::InvalidIdentifier(_))));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_request_error() {
        let client = AviationWeatherClient::with_base_url("http://127.0.0.1:9");

        let result = client.fetch_taf("KJFK").await;

        assert!(matches!(result, Err(SourceError::RequestFailed(_))));
    }
}
