//! Upstream client for forwarding requests.
//!
//! This module handles all communication with the upstream service. The
//! response is read in full so one copy can be replayed to every waiter.

use std::time::Duration;

use axum::http::{header, HeaderValue, Method};
use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, error, info, instrument};

use crate::coalescer::CoalescedResponse;
use crate::error::ProxyError;

/// Upstream HTTP client
#[derive(Clone)]
pub struct UpstreamClient {
    /// HTTP client
    client: Client,
    /// Upstream base URL, without trailing slash
    base_url: String,
}

impl UpstreamClient {
    /// Create a new upstream client
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProxyError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(url = %base_url, timeout_secs = timeout.as_secs(), "Creating upstream client");

        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self { client, base_url })
    }

    /// Get the upstream base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full upstream URL for a request target
    pub fn url_for(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{}", self.base_url, path_and_query)
        } else {
            format!("{}/{}", self.base_url, path_and_query)
        }
    }

    /// Check if the upstream is reachable. Any status below 500 counts as up.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), ProxyError> {
        let url = self.url_for("/");
        debug!(url = %url, "Checking upstream health");

        match self.client.get(&url).send().await {
            Ok(response) if !response.status().is_server_error() => {
                debug!(status = %response.status(), "Upstream is healthy");
                Ok(())
            }
            Ok(response) => {
                let status = response.status();
                error!(status = %status, "Upstream returned server error");
                Err(ProxyError::Upstream(format!("upstream returned status {}", status)))
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to upstream");
                Err(ProxyError::UpstreamConnection(e.to_string()))
            }
        }
    }

    /// Forward a request and capture status, body and content type.
    ///
    /// Non-2xx upstream statuses are returned as responses; only transport
    /// failures are errors.
    #[instrument(skip(self, content_type, body), fields(body_bytes = body.len()))]
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        content_type: Option<HeaderValue>,
        body: Bytes,
    ) -> Result<CoalescedResponse, ProxyError> {
        let url = self.url_for(path_and_query);
        debug!(url = %url, method = %method, "Sending upstream request");

        let mut builder = self.client.request(method, &url);
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        if !body.is_empty() {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_connect() {
                ProxyError::UpstreamConnection(e.to_string())
            } else {
                ProxyError::Http(e)
            }
        })?;

        let status = response.status();
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();

        let body = response.bytes().await?;
        debug!(status = status.as_u16(), bytes = body.len(), "Upstream response received");

        let mut result = CoalescedResponse::new(status, body);
        if let Some(content_type) = content_type {
            result = result.with_content_type(content_type);
        }
        Ok(result)
    }
}
