//! HTTP probing of the host started by the CLI

use std::time::Duration;

use crate::common::config::HttpReadiness;
use crate::common::{Error, Result};
use crate::readiness::{poll_until, RetryPolicy};

/// Status and body of a probe response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Small HTTP client bound to one base URL
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProbe {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Http {
                url: base_url.clone(),
                source: e,
            })?;
        Ok(Self { client, base_url })
    }

    /// Probe for `http://localhost:<port>`
    pub fn localhost(port: u16, request_timeout: Duration) -> Result<Self> {
        Self::new(format!("http://localhost:{port}"), request_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a path or path-and-query
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    /// GET a path and read the whole body
    pub async fn get(&self, path: &str) -> Result<HttpResponse> {
        let url = self.url(path);
        let map_err = |source| Error::Http {
            url: url.clone(),
            source,
        };

        let response = self.client.get(&url).send().await.map_err(map_err)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_err)?;
        tracing::debug!(%url, status, "HTTP GET");
        Ok(HttpResponse { status, body })
    }

    /// Poll `health_path` until it answers with a 2xx status
    ///
    /// Connection errors count as "not ready yet".
    pub async fn wait_until_ready(&self, health_path: &str, policy: RetryPolicy) -> bool {
        poll_until(policy, move |attempt| async move {
            match self.get(health_path).await {
                Ok(response) => response.is_success(),
                Err(e) => {
                    tracing::trace!(attempt, "Health probe failed: {}", e);
                    false
                }
            }
        })
        .await
    }

    /// [`HttpProbe::wait_until_ready`] with the configured policy
    pub async fn wait_until_ready_with(&self, readiness: &HttpReadiness) -> bool {
        self.wait_until_ready(&readiness.health_path, readiness.policy())
            .await
    }
}
