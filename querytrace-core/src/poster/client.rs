//! HTTP client for the monitoring endpoint
//!
//! Posts [`ReportBatch`]es as JSON to `{server_url}/v1/query-reports` with
//! HTTP basic authentication.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;

use crate::config::PosterConfig;
use crate::error::{Error, Result};

use super::payload::ReportBatch;

/// Response from POST /v1/query-reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PostResponse {
    /// Number of reports accepted
    pub accepted: usize,
    /// Number of reports rejected
    #[serde(default)]
    pub rejected: usize,
}

/// HTTP client for the monitoring endpoint
pub struct ReportClient {
    http_client: reqwest::Client,
    base_url: String,
    user: String,
    password: Option<String>,
}

impl ReportClient {
    /// Create a new client from configuration
    ///
    /// Returns an error if the configuration is invalid or missing required fields.
    pub fn new(config: &PosterConfig) -> Result<Self> {
        config.validate()?;

        let base_url = config
            .server_url
            .clone()
            .ok_or_else(|| Error::Config("poster.server_url is required".to_string()))?
            .trim_end_matches('/')
            .to_string();
        let user = config
            .user
            .clone()
            .ok_or_else(|| Error::Config("poster.user is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url,
            user,
            password: config.password.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Post one batch of reports.
    ///
    /// An empty success body counts every report as accepted.
    pub async fn post_reports(&self, batch: &ReportBatch) -> Result<PostResponse> {
        let url = format!("{}/v1/query-reports", self.base_url);

        let response = self
            .http_client
            .post(&url)
            .basic_auth(&self.user, self.password.as_ref())
            .json(batch)
            .send()
            .await
            .map_err(|e| Error::Poster(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Poster(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::Poster(format!("API error ({}): {}", status, body)));
        }
        if body.trim().is_empty() {
            return Ok(PostResponse {
                accepted: batch.reports.len(),
                rejected: 0,
            });
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::Poster(format!("failed to parse response: {}", e)))
    }

    /// Check if the endpoint is reachable
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/health", self.base_url);

        match self.http_client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }
}
