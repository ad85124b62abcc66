//! Resource Monitor Client
//!
//! RPC client for the resource monitor service that runs next to each
//! backend. The monitor listens on the backend's host, on a port chosen by
//! hardware class, and answers "is there enough free memory for a model of
//! N GB right now?".
//!
//! Every failure mode (refused connection, timeout, non-2xx, malformed or
//! error-status body) becomes [`ResourceVerdict::Unknown`]; the scheduler
//! decides what an unknown means.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::config::MonitorConfig;
use crate::registry::ServerType;

// ============================================================================
// Verdicts
// ============================================================================

/// Outcome of a resource check
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceVerdict {
    /// Enough memory is free
    Sufficient,

    /// Not enough memory is free
    Insufficient,

    /// The monitor could not answer
    Unknown,
}

impl ResourceVerdict {
    /// Whether the verdict is a plain yes
    #[must_use]
    pub fn is_sufficient(self) -> bool {
        matches!(self, Self::Sufficient)
    }
}

/// Verdict plus the numbers the monitor reported alongside it
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResourceCheck {
    /// The verdict
    pub verdict: ResourceVerdict,
    /// Free memory in GB, when reported
    pub available_gb: Option<f64>,
    /// Total memory in GB, when reported
    pub total_gb: Option<f64>,
    /// Failure description for unknown verdicts
    pub detail: Option<String>,
}

impl ResourceCheck {
    /// A bare verdict without details
    #[must_use]
    pub fn from_verdict(verdict: ResourceVerdict) -> Self {
        Self {
            verdict,
            available_gb: None,
            total_gb: None,
            detail: None,
        }
    }

    fn unknown(detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..Self::from_verdict(ResourceVerdict::Unknown)
        }
    }
}

/// Answers resource sufficiency questions for a backend
#[async_trait]
pub trait ResourceMonitor: Send + Sync {
    /// Ask whether the host behind `server_url` can fit `performance_gb`
    async fn check_resource(
        &self,
        server_url: &str,
        server_type: ServerType,
        performance_gb: u32,
    ) -> ResourceCheck;
}

// ============================================================================
// Wire Format
// ============================================================================

#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    #[serde(rename = "type")]
    server_type: &'a str,
    performance: u32,
}

/// Accepts both `{sufficient}` and `{status, data: {sufficient, ...}}`
#[derive(Debug, Default, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    sufficient: Option<bool>,
    #[serde(default)]
    data: Option<CheckData>,
}

#[derive(Debug, Default, Deserialize)]
struct CheckData {
    #[serde(default)]
    sufficient: Option<bool>,
    #[serde(default)]
    available_gb: Option<f64>,
    #[serde(default)]
    total_gb: Option<f64>,
}

impl CheckResponse {
    fn into_check(self) -> ResourceCheck {
        if self.status.as_deref() == Some("error") {
            return ResourceCheck::unknown(
                self.message
                    .unwrap_or_else(|| "monitor reported an error".to_string()),
            );
        }

        let data = self.data.unwrap_or_default();
        match data.sufficient.or(self.sufficient) {
            Some(sufficient) => ResourceCheck {
                verdict: if sufficient {
                    ResourceVerdict::Sufficient
                } else {
                    ResourceVerdict::Insufficient
                },
                available_gb: data.available_gb,
                total_gb: data.total_gb,
                detail: None,
            },
            None => ResourceCheck::unknown("response has no sufficient field"),
        }
    }
}

/// Failures of the informational monitor calls
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Server URL has no usable host
    #[error("cannot derive monitor address from {0}")]
    BadServerUrl(String),

    /// Request failed or timed out
    #[error("monitor request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Monitor answered with a non-success status
    #[error("monitor returned status {0}")]
    Status(u16),
}

// ============================================================================
// HTTP Client
// ============================================================================

/// HTTP client for the resource monitor service
#[derive(Clone, Debug)]
pub struct ResourceMonitorClient {
    client: reqwest::Client,
    config: MonitorConfig,
}

impl ResourceMonitorClient {
    /// Create a client using `config.timeout` for every call
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: MonitorConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Monitor base URL for a backend: same scheme and host, port by type
    #[must_use]
    pub fn monitor_url(&self, server_url: &str, server_type: ServerType) -> Option<String> {
        let url = reqwest::Url::parse(server_url).ok()?;
        let host = url.host_str()?;
        let port = match server_type {
            ServerType::Cpu => self.config.cpu_port,
            ServerType::Gpu => self.config.gpu_port,
        };
        Some(format!("{}://{}:{}", url.scheme(), host, port))
    }

    async fn get_json(
        &self,
        server_url: &str,
        server_type: ServerType,
        path: &str,
    ) -> Result<serde_json::Value, MonitorError> {
        let base = self
            .monitor_url(server_url, server_type)
            .ok_or_else(|| MonitorError::BadServerUrl(server_url.to_string()))?;
        let response = self.client.get(format!("{base}{path}")).send().await?;
        if !response.status().is_success() {
            return Err(MonitorError::Status(response.status().as_u16()));
        }
        Ok(response.json().await?)
    }

    /// Monitor liveness (`GET /health`)
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn health(
        &self,
        server_url: &str,
        server_type: ServerType,
    ) -> Result<serde_json::Value, MonitorError> {
        self.get_json(server_url, server_type, "/health").await
    }

    /// Host memory report (`GET /memory`)
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn memory(
        &self,
        server_url: &str,
        server_type: ServerType,
    ) -> Result<serde_json::Value, MonitorError> {
        self.get_json(server_url, server_type, "/memory").await
    }

    /// GPU memory report (`GET /gpu-memory`)
    ///
    /// # Errors
    ///
    /// Returns an error on transport failure or a non-success status.
    pub async fn gpu_memory(
        &self,
        server_url: &str,
        server_type: ServerType,
    ) -> Result<serde_json::Value, MonitorError> {
        self.get_json(server_url, server_type, "/gpu-memory").await
    }
}

#[async_trait]
impl ResourceMonitor for ResourceMonitorClient {
    async fn check_resource(
        &self,
        server_url: &str,
        server_type: ServerType,
        performance_gb: u32,
    ) -> ResourceCheck {
        let Some(base) = self.monitor_url(server_url, server_type) else {
            return ResourceCheck::unknown(format!("cannot derive monitor address from {server_url}"));
        };

        let body = CheckRequest {
            server_type: server_type.as_str(),
            performance: performance_gb,
        };
        let response = match self
            .client
            .post(format!("{base}/resource-check"))
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(monitor = %base, error = %e, "Resource monitor unreachable");
                return ResourceCheck::unknown(e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(monitor = %base, status = status.as_u16(), "Resource monitor returned error status");
            return ResourceCheck::unknown(format!("monitor returned status {}", status.as_u16()));
        }

        let check = match response.json::<CheckResponse>().await {
            Ok(parsed) => parsed.into_check(),
            Err(e) => ResourceCheck::unknown(format!("malformed monitor response: {e}")),
        };
        tracing::debug!(
            server = %server_url,
            server_type = %server_type,
            required_gb = performance_gb,
            verdict = ?check.verdict,
            available_gb = ?check.available_gb,
            "Resource check"
        );
        check
    }
}
