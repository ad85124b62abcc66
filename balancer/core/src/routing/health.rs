//! Server Health Probing
//!
//! Liveness checks for backend servers with a cooldown after failure:
//! - A probe is a short-timeout `GET {server_url}/api/tags`
//! - A failed probe (or a failed forward) marks the server unhealthy
//! - While in cooldown the server is reported unhealthy without probing
//! - The first successful probe after cooldown clears the state
//!
//! ```text
//!              probe ok                      probe failed / forward failed
//! +---------+ ---------> +---------+ ----------------------------------> +-----------+
//! | Unknown |            | Healthy |                                     | Unhealthy |
//! +---------+ ---------> +---------+ <---------------------------------- +-----------+
//!              probe failed            probe ok after cooldown expires
//! ```
//!
//! # Thread Safety
//!
//! Per-server state is atomic and lives in a `DashMap` keyed by server URL,
//! so probes for different servers never contend. No map guard is held
//! while a probe is in flight.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use super::config::HealthConfig;
use crate::registry::ServerConfig;

// ============================================================================
// Probe Transport
// ============================================================================

/// Why a probe failed
#[derive(Debug, Error)]
pub enum ProbeError {
    /// No answer within the probe timeout
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    /// Connection or protocol failure
    #[error("probe transport error: {0}")]
    Transport(String),

    /// Server answered with a non-success status
    #[error("probe returned status {0}")]
    Status(u16),
}

/// Performs a single liveness check
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Check one server, `Ok` meaning alive
    async fn probe(&self, server_url: &str) -> Result<(), ProbeError>;
}

/// Probe over HTTP
#[derive(Clone, Debug)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    probe_path: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    /// Create a probe hitting `config.probe_path` with `config.timeout`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &HealthConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            probe_path: config.probe_path.clone(),
            timeout: config.timeout,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, server_url: &str) -> Result<(), ProbeError> {
        let url = format!("{}{}", server_url.trim_end_matches('/'), self.probe_path);
        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(self.timeout)
            } else {
                ProbeError::Transport(e.to_string())
            }
        })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(response.status().as_u16()))
        }
    }
}

// ============================================================================
// Health State
// ============================================================================

/// Observed liveness of a server
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Never probed
    #[default]
    Unknown,

    /// Last probe succeeded
    Healthy,

    /// Last probe or forward failed
    Unhealthy,
}

impl HealthState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Healthy,
            2 => Self::Unhealthy,
            _ => Self::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Healthy => 1,
            Self::Unhealthy => 2,
        }
    }
}

/// Health record for one server URL
///
/// Timestamps are milliseconds since the owning prober's epoch, with 0
/// meaning "never".
pub struct ServerHealth {
    /// Server base URL
    pub server_url: String,

    state: AtomicU8,
    last_checked_ms: AtomicU64,
    cooldown_until_ms: AtomicU64,
    consecutive_failures: AtomicU32,
    total_probes: AtomicU64,
    total_failures: AtomicU64,
    suppressed_probes: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl ServerHealth {
    fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            state: AtomicU8::new(HealthState::Unknown.as_u8()),
            last_checked_ms: AtomicU64::new(0),
            cooldown_until_ms: AtomicU64::new(0),
            consecutive_failures: AtomicU32::new(0),
            total_probes: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            suppressed_probes: AtomicU64::new(0),
            last_error: RwLock::new(None),
        }
    }

    /// Current state
    pub fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn in_cooldown(&self, now_ms: u64) -> bool {
        now_ms < self.cooldown_until_ms.load(Ordering::Acquire)
    }

    /// Returns true when the server was unhealthy before this success
    fn record_success(&self, now_ms: u64) -> bool {
        self.total_probes.fetch_add(1, Ordering::Relaxed);
        self.last_checked_ms.store(now_ms, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.cooldown_until_ms.store(0, Ordering::Release);
        *self.last_error.write() = None;
        let previous = self
            .state
            .swap(HealthState::Healthy.as_u8(), Ordering::AcqRel);
        HealthState::from_u8(previous) == HealthState::Unhealthy
    }

    /// Returns true when the server was not already unhealthy
    fn record_failure(&self, now_ms: u64, cooldown: Duration, reason: &str, probed: bool) -> bool {
        if probed {
            self.total_probes.fetch_add(1, Ordering::Relaxed);
            self.last_checked_ms.store(now_ms, Ordering::Release);
        }
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel);
        let cooldown_ms = u64::try_from(cooldown.as_millis()).unwrap_or(u64::MAX);
        self.cooldown_until_ms
            .store(now_ms.saturating_add(cooldown_ms), Ordering::Release);
        *self.last_error.write() = Some(reason.to_string());
        let previous = self
            .state
            .swap(HealthState::Unhealthy.as_u8(), Ordering::AcqRel);
        HealthState::from_u8(previous) != HealthState::Unhealthy
    }

    fn snapshot(&self, now_ms: u64) -> HealthSnapshot {
        let last_checked = self.last_checked_ms.load(Ordering::Acquire);
        let cooldown_until = self.cooldown_until_ms.load(Ordering::Acquire);
        HealthSnapshot {
            server_url: self.server_url.clone(),
            state: self.state(),
            in_cooldown: self.in_cooldown(now_ms),
            cooldown_remaining_ms: cooldown_until.saturating_sub(now_ms),
            since_last_check_ms: (last_checked != 0).then(|| now_ms.saturating_sub(last_checked)),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            total_probes: self.total_probes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            suppressed_probes: self.suppressed_probes.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
        }
    }
}

impl std::fmt::Debug for ServerHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHealth")
            .field("server_url", &self.server_url)
            .field("state", &self.state())
            .field(
                "consecutive_failures",
                &self.consecutive_failures.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a server's health
#[derive(Clone, Debug, Serialize)]
pub struct HealthSnapshot {
    /// Server base URL
    pub server_url: String,
    /// Current state
    pub state: HealthState,
    /// Whether probes are currently suppressed
    pub in_cooldown: bool,
    /// Time left in cooldown
    pub cooldown_remaining_ms: u64,
    /// Time since the last probe, if any
    pub since_last_check_ms: Option<u64>,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Probes issued
    pub total_probes: u64,
    /// Failed probes plus failed forwards
    pub total_failures: u64,
    /// Requests answered from cooldown without probing
    pub suppressed_probes: u64,
    /// Most recent failure reason
    pub last_error: Option<String>,
}

// ============================================================================
// Health Prober
// ============================================================================

/// Health table plus the probe used to fill it
pub struct HealthProber {
    probe: Arc<dyn HealthProbe>,
    config: HealthConfig,
    servers: DashMap<String, Arc<ServerHealth>>,
    epoch: Instant,
}

impl HealthProber {
    /// Create a prober with an empty table
    pub fn new(probe: Arc<dyn HealthProbe>, config: HealthConfig) -> Self {
        Self {
            probe,
            config,
            servers: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Milliseconds since the epoch, at least 1 so 0 can mean "never"
    fn now_millis(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX - 1) + 1
    }

    fn entry(&self, server_url: &str) -> Arc<ServerHealth> {
        if let Some(existing) = self.servers.get(server_url) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.servers
                .entry(server_url.to_string())
                .or_insert_with(|| Arc::new(ServerHealth::new(server_url)))
                .value(),
        )
    }

    async fn run_probe(&self, server_url: &str) -> Result<(), ProbeError> {
        match tokio::time::timeout(self.config.timeout, self.probe.probe(server_url)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(self.config.timeout)),
        }
    }

    /// Whether a server should receive traffic
    ///
    /// Servers in cooldown return `false` without a probe. Otherwise a
    /// probe runs and its outcome is recorded.
    pub async fn is_healthy(&self, server_url: &str) -> bool {
        let health = self.entry(server_url);
        if health.in_cooldown(self.now_millis()) {
            health.suppressed_probes.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        match self.run_probe(server_url).await {
            Ok(()) => {
                if health.record_success(self.now_millis()) {
                    tracing::info!(server = %server_url, "Server recovered");
                }
                true
            }
            Err(e) => {
                let reason = e.to_string();
                if health.record_failure(self.now_millis(), self.config.cooldown, &reason, true) {
                    tracing::warn!(
                        server = %server_url,
                        error = %reason,
                        cooldown_secs = self.config.cooldown.as_secs(),
                        "Health probe failed, server marked unhealthy"
                    );
                }
                false
            }
        }
    }

    /// Split servers into healthy and unhealthy, preserving order
    ///
    /// Probes run concurrently when `concurrent_probes` is set.
    pub async fn partition_healthy(
        &self,
        servers: &[Arc<ServerConfig>],
    ) -> (Vec<Arc<ServerConfig>>, Vec<Arc<ServerConfig>>) {
        let verdicts = if self.config.concurrent_probes {
            futures::future::join_all(servers.iter().map(|s| self.is_healthy(&s.server_url))).await
        } else {
            let mut verdicts = Vec::with_capacity(servers.len());
            for server in servers {
                verdicts.push(self.is_healthy(&server.server_url).await);
            }
            verdicts
        };

        let mut healthy = Vec::new();
        let mut unhealthy = Vec::new();
        for (server, ok) in servers.iter().zip(verdicts) {
            if ok {
                healthy.push(Arc::clone(server));
            } else {
                unhealthy.push(Arc::clone(server));
            }
        }
        (healthy, unhealthy)
    }

    /// Record a failure seen outside a probe, e.g. a failed forward
    pub fn mark_unhealthy(&self, server_url: &str, reason: &str) {
        let health = self.entry(server_url);
        if health.record_failure(self.now_millis(), self.config.cooldown, reason, false) {
            tracing::warn!(
                server = %server_url,
                error = %reason,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Server marked unhealthy"
            );
        }
    }

    /// Whether a server is currently in cooldown, without probing
    #[must_use]
    pub fn in_cooldown(&self, server_url: &str) -> bool {
        self.servers
            .get(server_url)
            .is_some_and(|h| h.in_cooldown(self.now_millis()))
    }

    /// Probe without touching the health table
    pub async fn probe_readonly(&self, server_url: &str) -> bool {
        self.run_probe(server_url).await.is_ok()
    }

    /// Current state of one server
    #[must_use]
    pub fn state(&self, server_url: &str) -> HealthState {
        self.servers
            .get(server_url)
            .map_or(HealthState::Unknown, |h| h.state())
    }

    /// Snapshot of one server
    #[must_use]
    pub fn snapshot(&self, server_url: &str) -> Option<HealthSnapshot> {
        let now = self.now_millis();
        self.servers.get(server_url).map(|h| h.snapshot(now))
    }

    /// Snapshot of every known server, sorted by URL
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<HealthSnapshot> {
        let now = self.now_millis();
        let mut all: Vec<HealthSnapshot> = self.servers.iter().map(|h| h.snapshot(now)).collect();
        all.sort_by(|a, b| a.server_url.cmp(&b.server_url));
        all
    }
}

impl std::fmt::Debug for HealthProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthProber")
            .field("config", &self.config)
            .field("servers", &self.servers.len())
            .finish_non_exhaustive()
    }
}
