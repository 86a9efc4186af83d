//! HTTP Client
//!
//! Thin wrapper over reqwest. Retry and outcome classification live in the
//! dispatcher; this layer only sends one request and hands back the raw
//! status, headers and body.

use crate::error::{KeypoolError, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Raw upstream response, returned verbatim to callers
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON, when the caller wants structure back
    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.body)
            .map_err(|e| KeypoolError::Internal(format!("invalid upstream JSON: {}", e)))
    }
}

/// Async HTTP client with bounded timeouts
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| KeypoolError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }

    /// POST a JSON body with the credential's secret as the Authorization
    /// header value. Transport and timeout failures map onto the error
    /// taxonomy; any HTTP status comes back as a response.
    pub async fn post_json(&self, url: &str, secret: &str, body: &Value) -> Result<UpstreamResponse> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(secret)
                .map_err(|e| KeypoolError::Config(format!("Invalid API key format: {}", e)))?,
        );

        let response = self
            .client
            .post(url)
            .headers(headers)
            .json(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await.unwrap_or_default();

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        assert!(HttpClient::new(Duration::from_secs(30)).is_ok());
    }

    #[test]
    fn test_success_range() {
        let resp = UpstreamResponse {
            status: 204,
            headers: HeaderMap::new(),
            body: String::new(),
        };
        assert!(resp.is_success());

        let resp = UpstreamResponse {
            status: 429,
            headers: HeaderMap::new(),
            body: String::new(),
        };
        assert!(!resp.is_success());
    }
}
