//! HTTP client for the BootBoots cloud API

use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, error};

use crate::authn::Credentials;
use crate::errors::LinkError;

/// Authenticated client for the device API
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new client rooted at `base_url`
    pub fn new(base_url: &str) -> Result<Self, LinkError> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, LinkError> {
        let base_url = base_url.trim_end_matches('/');
        if base_url.is_empty() {
            return Err(LinkError::ConfigError("API base URL is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bootlink/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Make a GET request with the id token as bearer
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
        credentials: &Credentials,
    ) -> Result<T, LinkError> {
        credentials.ensure_valid()?;

        let url = format!("{}{}", self.base_url, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .query(query)
            .header(header::AUTHORIZATION, format!("Bearer {}", credentials.bearer()))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("HTTP GET failed: {} - {}", status, body);
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    LinkError::AuthError(format!("{}: {}", status, body))
                }
                StatusCode::NOT_FOUND => LinkError::NotFound(path.to_string()),
                _ => LinkError::ConnectionError(format!("{}: {}", status, body)),
            });
        }

        let body = response.json().await?;
        Ok(body)
    }
}
