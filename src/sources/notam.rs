//! NOTAM feed client

use reqwest::Client;
use serde_json::Value;

use super::{http_client, normalize_icao, parse_payload, read_json, SourceError};
use crate::config::{SourceConfig, DEFAULT_NOTAM_URL};

/// Client for the government NOTAM API
///
/// The API requires `client_id`/`client_secret` headers; without them the
/// upstream answers 401, which callers see as [`SourceError::Status`].
#[derive(Debug, Clone)]
pub struct NotamClient {
    client: Client,
    base_url: String,
    credentials: Option<(String, String)>,
}

impl Default for NotamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl NotamClient {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_NOTAM_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials: None,
        }
    }

    /// Attach API credentials
    pub fn with_credentials(mut self, client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        self.credentials = Some((client_id.into(), client_secret.into()));
        self
    }

    pub fn from_config(config: &SourceConfig) -> Self {
        let client = Self::with_base_url(config.base_url.clone());
        match (&config.client_id, &config.client_secret) {
            (Some(id), Some(secret)) => client.with_credentials(id.clone(), secret.clone()),
            _ => client,
        }
    }

    fn notams_url(&self, icao: &str) -> String {
        format!(
            "{}?icaoLocation={}&responseFormat=geoJson&pageSize=1000",
            self.base_url, icao
        )
    }

    /// Fetch active NOTAMs for a location
    pub async fn fetch_notams(&self, icao: &str) -> Result<Value, SourceError> {
        let icao = normalize_icao(icao)?;
        let mut request = self.client.get(self.notams_url(&icao));
        if let Some((id, secret)) = &self.credentials {
            request = request.header("client_id", id).header("client_secret", secret);
        }

        let response = request.send().await?;
        let body = read_json(response).await?;
        parse_payload(&body, &format!("NOTAMs {}", icao))
    }
}
