//! HTTP sender
//!
//! POSTs the report fields as a JSON object to a configured endpoint.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use super::ReportSender;
use crate::config::HttpSenderConfig;
use crate::error::{Error, Result};
use crate::types::Report;

const SENDER_NAME: &str = "http";

/// Sender that delivers reports to an HTTP endpoint
pub struct HttpSender {
    http_client: reqwest::Client,
    url: String,
}

impl HttpSender {
    /// Create a new HTTP sender from configuration
    ///
    /// Returns an error if no URL is configured or the token is not a valid
    /// header value.
    pub fn new(config: &HttpSenderConfig) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| Error::Config("http.url is required".to_string()))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(token) = &config.token {
            let auth_value = format!("Bearer {}", token);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value)
                    .map_err(|e| Error::Config(format!("invalid http.token: {}", e)))?,
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { http_client, url })
    }

    /// Endpoint reports are posted to
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReportSender for HttpSender {
    fn name(&self) -> &str {
        SENDER_NAME
    }

    async fn send(&self, report: &Report) -> Result<()> {
        let response = self
            .http_client
            .post(&self.url)
            .json(&report.fields)
            .send()
            .await
            .map_err(|e| Error::sender(SENDER_NAME, format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(url = %self.url, status = %status, "Report delivered");
            Ok(())
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::sender(
                SENDER_NAME,
                format!("API error ({}): {}", status, error_text),
            ))
        }
    }
}
