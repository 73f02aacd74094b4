//! Readiness probing of the inference server.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::Client;
use tracing::trace;

use common::error::{Error, Result};
use deploy_config::ProbeSettings;

/// Per-request timeout; the probe loop owns the overall deadline
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    Ready,
    /// Not ready yet, with what was observed
    NotReady(String),
}

/// A single readiness check against a running server
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn check(&self) -> ProbeResult;

    /// What is being probed, for messages
    fn target(&self) -> String;
}

/// Probes an HTTP endpoint; any 2xx answer means ready
#[derive(Debug, Clone)]
pub struct HttpReadinessProbe {
    client: Client,
    url: String,
}

impl HttpReadinessProbe {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// Probe for a server published on `port`
    pub fn from_settings(settings: &ProbeSettings, port: u16) -> Result<Self> {
        Self::new(settings.url(port))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReadinessProbe for HttpReadinessProbe {
    async fn check(&self) -> ProbeResult {
        let response = self
            .client
            .get(&self.url)
            .header(ACCEPT, "application/json")
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => ProbeResult::Ready,
            Ok(response) => ProbeResult::NotReady(format!("HTTP {}", response.status())),
            Err(e) => {
                trace!("Probe of {} failed: {}", self.url, e);
                let observed = if e.is_connect() {
                    "connection refused".to_string()
                } else if e.is_timeout() {
                    "timed out".to_string()
                } else {
                    e.to_string()
                };
                ProbeResult::NotReady(observed)
            }
        }
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}
