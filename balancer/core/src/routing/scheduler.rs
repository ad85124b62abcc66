//! Request Scheduler
//!
//! Turns one logical request into at most `max_retry_count` sequential
//! attempts against concrete backends, walking tiers in priority order.
//!
//! # State Machine
//!
//! ```text
//! ResolvingTiers ──(none)──────────────────────────────> NotFound
//!       │
//!       v
//! SelectingServer <─────────────────────────────────┐
//!   │  health filter once per tier, weighted pick    │
//!   │  (tier empty -> next tier)                     │
//!   v                                                │
//! CheckingResource ──(insufficient / unknown)────────┤ RetryingNextCandidate
//!   │  skip flag | reuse | cache | monitor RPC        │
//!   v                                                │
//! Forwarding ──(connect error, timeout, 5xx, 404/429)┘
//!   │
//!   ├──(2xx)──────────────> Succeeded   (body streams, token held)
//!   ├──(other non-2xx)────> PassedThrough
//!   └──(budget or tiers exhausted) ──> Exhausted (NoAvailableServer)
//! ```
//!
//! Once headers are back the choice is final. A body that fails after that
//! point ends the client stream with [`SchedulerError::TruncatedResponse`];
//! it is never retried because the client already holds part of it.
//!
//! # Attempt Accounting
//!
//! Every candidate that reaches the resource gate consumes one attempt,
//! whether it is then rejected or forwarded. Servers dropped by the health
//! filter are recorded for diagnostics but cost nothing, since no request
//! was made to them beyond the probe.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use super::concurrency::{ConcurrencyToken, ConcurrencyTracker};
use super::config::SchedulerConfig;
use super::health::{HealthProber, HttpHealthProbe};
use super::metrics::{BalancerMetrics, ServerMetrics};
use super::monitor::{ResourceMonitor, ResourceMonitorClient, ResourceVerdict};
use super::resource_cache::ResourceCheckCache;
use super::selection::pick_weighted;
use crate::config::BalancerConfig;
use crate::proxy::{BackendResponse, ForwardError, Forwarder, HttpForwarder, ProxyRequest};
use crate::registry::{ModelPriorityOverview, RegistryCache, ServerConfig, ServerType};

/// Per-model priority distribution reported by [`Scheduler::priority_overview`]
pub type PriorityOverview = ModelPriorityOverview;

// ============================================================================
// Errors and Diagnostics
// ============================================================================

/// Terminal failures that reach the client
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No routable server is registered for the virtual model
    #[error("no active server for virtual model '{virtual_model}'")]
    NotFound { virtual_model: String },

    /// Every tier or the whole attempt budget was used up
    #[error("no available server for virtual model '{virtual_model}' after {} candidates", .attempts.len())]
    NoAvailableServer {
        virtual_model: String,
        attempts: Vec<AttemptRecord>,
    },

    /// The backend failed after headers were sent to the client
    #[error("response from {server_url} truncated: {reason}")]
    TruncatedResponse { server_url: String, reason: String },

    /// The client request cannot be routed at all
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// What happened to one candidate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Failed its probe or was in cooldown
    Unhealthy,
    /// Resource check said no
    Insufficient,
    /// Resource check could not answer and the policy is fail-closed
    MonitorUnknown,
    /// Failed before headers or answered with a retryable status
    ForwardFailed,
    /// Answered with a 2xx
    Succeeded,
    /// Answered with a non-retryable error status, returned as is
    PassedThrough,
}

impl AttemptOutcome {
    /// Whether the outcome used up one unit of the attempt budget
    #[must_use]
    pub fn consumed_attempt(self) -> bool {
        !matches!(self, Self::Unhealthy)
    }
}

/// Diagnostic record of one candidate
#[derive(Clone, Debug, Serialize)]
pub struct AttemptRecord {
    pub server_id: u64,
    pub server_url: String,
    pub priority: u32,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
}

impl AttemptRecord {
    fn new(server: &ServerConfig, outcome: AttemptOutcome, detail: Option<String>) -> Self {
        Self {
            server_id: server.id,
            server_url: server.server_url.clone(),
            priority: server.priority,
            outcome,
            detail,
        }
    }
}

// ============================================================================
// Response
// ============================================================================

/// Backend response chosen for the client
pub struct ProxyResponse {
    /// Backend status
    pub status: StatusCode,
    /// Backend headers without hop-by-hop entries
    pub headers: HeaderMap,
    /// Body chunks; holds the concurrency slot until finished or dropped
    pub body: BoxStream<'static, Result<Bytes, SchedulerError>>,
    /// Server that answered
    pub server: Arc<ServerConfig>,
    /// Every candidate considered, the answering one last
    pub attempts: Vec<AttemptRecord>,
    /// Request identifier
    pub request_id: Uuid,
}

impl std::fmt::Debug for ProxyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyResponse")
            .field("status", &self.status)
            .field("server", &self.server.server_url)
            .field("attempts", &self.attempts.len())
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}

/// Response body that owns the request's concurrency slot
///
/// Finishing, failing or being dropped all release the slot exactly once.
/// Dropping it also drops the backend stream, which cancels the upstream
/// call.
struct GuardedBody {
    inner: BoxStream<'static, Result<Bytes, ForwardError>>,
    token: Option<ConcurrencyToken>,
    server_metrics: Arc<ServerMetrics>,
    metrics: Arc<BalancerMetrics>,
    health: Arc<HealthProber>,
    request_id: Uuid,
}

impl GuardedBody {
    fn release(&mut self) -> bool {
        match self.token.take() {
            Some(token) => {
                token.end();
                self.server_metrics.in_flight.dec();
                true
            }
            None => false,
        }
    }
}

impl Stream for GuardedBody {
    type Item = Result<Bytes, SchedulerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.token.is_none() {
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {
                this.release();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(e))) => {
                let server_url = this.server_metrics.server_url.clone();
                let reason = e.to_string();
                this.release();
                this.server_metrics.truncated.inc();
                this.metrics.truncated.inc();
                this.health.mark_unhealthy(&server_url, &reason);
                tracing::warn!(
                    request_id = %this.request_id,
                    server = %server_url,
                    error = %reason,
                    "Backend stream failed after headers, response truncated"
                );
                Poll::Ready(Some(Err(SchedulerError::TruncatedResponse { server_url, reason })))
            }
        }
    }
}

impl Drop for GuardedBody {
    fn drop(&mut self) {
        if self.release() {
            self.server_metrics.cancelled.inc();
            self.metrics.cancelled.inc();
            tracing::debug!(
                request_id = %self.request_id,
                server = %self.server_metrics.server_url,
                "Client went away mid-stream, backend call cancelled"
            );
        }
    }
}

// ============================================================================
// Priority Simulation
// ============================================================================

/// Read-only run of tier resolution, health filtering and selection
#[derive(Clone, Debug, Serialize)]
pub struct PrioritySimulation {
    pub virtual_model: String,
    pub tiers: Vec<SimulatedTier>,
    /// Server a real request would most likely start with, if any
    pub selected: Option<SimulatedServer>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SimulatedTier {
    pub priority: u32,
    pub total_weight: u64,
    pub servers: Vec<SimulatedServer>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SimulatedServer {
    pub id: u64,
    pub server_url: String,
    pub actual_model_name: String,
    pub weight: u32,
    pub skip_resource_check: bool,
    pub healthy: bool,
    pub in_cooldown: bool,
}

// ============================================================================
// Model Type Check
// ============================================================================

/// CPU/GPU breakdown of one virtual model with live health
#[derive(Clone, Debug, Serialize)]
pub struct ModelTypeCheck {
    pub virtual_model: String,
    pub total_servers: usize,
    pub healthy_servers: usize,
    pub server_types: BTreeMap<&'static str, TypeGroup>,
    pub recommendation: Option<TypeRecommendation>,
}

/// Servers of one type
#[derive(Clone, Debug, Default, Serialize)]
pub struct TypeGroup {
    pub count: usize,
    pub healthy_count: usize,
    pub servers: Vec<TypedServer>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TypedServer {
    pub id: u64,
    pub server_url: String,
    pub actual_model_name: String,
    #[serde(rename = "type")]
    pub server_type: ServerType,
    pub performance: u32,
    pub priority: u32,
    pub weight: u32,
    pub skip_resource_check: bool,
    pub healthy: bool,
}

/// Server type a request for the model would most likely land on
#[derive(Clone, Debug, Serialize)]
pub struct TypeRecommendation {
    pub recommended_type: ServerType,
    pub reason: String,
    /// Lowest priority, then highest weight, among healthy servers
    pub best_server: Option<TypedServer>,
}

/// What an admin reset of resource checks dropped
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ResourceCheckReset {
    /// Cached verdicts removed
    pub cache_entries: usize,
    /// Pairs whose in-flight reuse window was closed
    pub reuse_windows: usize,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Shared components the scheduler drives
#[derive(Clone)]
pub struct SchedulerComponents {
    pub registry: Arc<RegistryCache>,
    pub health: Arc<HealthProber>,
    pub monitor: Arc<dyn ResourceMonitor>,
    pub resource_cache: Arc<ResourceCheckCache>,
    pub concurrency: Arc<ConcurrencyTracker>,
    pub forwarder: Arc<dyn Forwarder>,
    pub metrics: Arc<BalancerMetrics>,
}

impl SchedulerComponents {
    /// Components talking HTTP to real backends and monitors
    ///
    /// # Errors
    ///
    /// Returns an error if one of the HTTP clients cannot be built.
    pub fn http(config: &BalancerConfig, registry: Arc<RegistryCache>) -> Result<Self, reqwest::Error> {
        let probe = HttpHealthProbe::new(&config.health)?;
        Ok(Self {
            registry,
            health: Arc::new(HealthProber::new(Arc::new(probe), config.health.clone())),
            monitor: Arc::new(ResourceMonitorClient::new(config.monitor.clone())?),
            resource_cache: Arc::new(ResourceCheckCache::new(config.resource_cache.clone())),
            concurrency: Arc::new(ConcurrencyTracker::new(&config.concurrency)),
            forwarder: Arc::new(HttpForwarder::new(config.proxy.clone())?),
            metrics: Arc::new(BalancerMetrics::new()),
        })
    }
}

/// Result of the resource gate for one candidate
enum Gate {
    Proceed,
    Reject(AttemptOutcome, Option<String>),
}

/// Per-request decision pipeline
pub struct Scheduler {
    config: SchedulerConfig,
    registry: Arc<RegistryCache>,
    health: Arc<HealthProber>,
    monitor: Arc<dyn ResourceMonitor>,
    resource_cache: Arc<ResourceCheckCache>,
    concurrency: Arc<ConcurrencyTracker>,
    forwarder: Arc<dyn Forwarder>,
    metrics: Arc<BalancerMetrics>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, components: SchedulerComponents) -> Self {
        Self {
            config,
            registry: components.registry,
            health: components.health,
            monitor: components.monitor,
            resource_cache: components.resource_cache,
            concurrency: components.concurrency,
            forwarder: components.forwarder,
            metrics: components.metrics,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RegistryCache> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthProber> {
        &self.health
    }

    pub fn resource_cache(&self) -> &Arc<ResourceCheckCache> {
        &self.resource_cache
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyTracker> {
        &self.concurrency
    }

    pub fn metrics(&self) -> &Arc<BalancerMetrics> {
        &self.metrics
    }

    /// Route one request and return once a backend has sent headers
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotFound`] when the virtual model has no routable
    /// server, [`SchedulerError::NoAvailableServer`] when every candidate
    /// failed or the attempt budget ran out.
    pub async fn dispatch(&self, request: ProxyRequest) -> Result<ProxyResponse, SchedulerError> {
        self.metrics.requests.inc();
        let virtual_model = request.virtual_model.clone();

        let Some(tiers) = self.registry.resolve(&virtual_model) else {
            self.metrics.not_found.inc();
            tracing::warn!(
                request_id = %request.request_id,
                virtual_model = %virtual_model,
                "No active server for virtual model"
            );
            return Err(SchedulerError::NotFound { virtual_model });
        };

        let budget = self.config.max_retry_count;
        let mut consumed = 0u32;
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for tier in &tiers {
            if consumed >= budget {
                break;
            }

            let (mut candidates, unhealthy) = self.health.partition_healthy(&tier.servers).await;
            for server in &unhealthy {
                self.metrics.server(&server.server_url).unhealthy_skips.inc();
                let detail = self
                    .health
                    .snapshot(&server.server_url)
                    .and_then(|s| s.last_error);
                attempts.push(AttemptRecord::new(server, AttemptOutcome::Unhealthy, detail));
            }
            if candidates.is_empty() {
                tracing::debug!(
                    request_id = %request.request_id,
                    virtual_model = %virtual_model,
                    priority = tier.priority,
                    "No healthy server in tier, moving to next tier"
                );
                continue;
            }

            while consumed < budget {
                let picked = {
                    let mut rng = rand::thread_rng();
                    pick_weighted(&candidates, &mut rng).cloned()
                };
                let Some(server) = picked else {
                    break;
                };
                candidates.retain(|c| c.id != server.id);
                consumed += 1;

                if !server.skip_resource_check {
                    if let Gate::Reject(outcome, detail) = self.resource_gate(&server).await {
                        self.retrying(&request, &server, outcome, detail, consumed, &mut attempts);
                        continue;
                    }
                }

                match self.forward(&server, &request).await {
                    Ok((response, token, server_metrics)) => {
                        let status = response.status;
                        if status.is_success() {
                            server_metrics.successes.inc();
                            self.metrics.succeeded.inc();
                            attempts.push(AttemptRecord::new(&server, AttemptOutcome::Succeeded, None));
                        } else if self.config.should_retry_status(status) {
                            server_metrics.failures.inc();
                            server_metrics.in_flight.dec();
                            drop(token);
                            let detail = format!("backend returned status {}", status.as_u16());
                            if SchedulerConfig::marks_unhealthy(status) {
                                self.health.mark_unhealthy(&server.server_url, &detail);
                            }
                            self.retrying(
                                &request,
                                &server,
                                AttemptOutcome::ForwardFailed,
                                Some(detail),
                                consumed,
                                &mut attempts,
                            );
                            continue;
                        } else {
                            self.metrics.passed_through.inc();
                            attempts.push(AttemptRecord::new(
                                &server,
                                AttemptOutcome::PassedThrough,
                                Some(format!("backend returned status {}", status.as_u16())),
                            ));
                        }

                        tracing::info!(
                            request_id = %request.request_id,
                            virtual_model = %virtual_model,
                            server = %server.server_url,
                            model = %server.actual_model_name,
                            status = status.as_u16(),
                            stream = request.wants_stream(),
                            attempts = consumed,
                            time_to_headers_ms = u64::try_from(response.time_to_headers.as_millis()).unwrap_or(u64::MAX),
                            "Request routed"
                        );

                        let body = GuardedBody {
                            inner: response.body,
                            token: Some(token),
                            server_metrics,
                            metrics: Arc::clone(&self.metrics),
                            health: Arc::clone(&self.health),
                            request_id: request.request_id,
                        };
                        return Ok(ProxyResponse {
                            status,
                            headers: response.headers,
                            body: body.boxed(),
                            server,
                            attempts,
                            request_id: request.request_id,
                        });
                    }
                    Err(e) => {
                        let detail = e.to_string();
                        self.health.mark_unhealthy(&server.server_url, &detail);
                        self.retrying(
                            &request,
                            &server,
                            AttemptOutcome::ForwardFailed,
                            Some(detail),
                            consumed,
                            &mut attempts,
                        );
                    }
                }
            }
        }

        self.metrics.exhausted.inc();
        let reasons: Vec<String> = attempts
            .iter()
            .map(|a| {
                format!(
                    "{}(p{}): {:?}{}",
                    a.server_url,
                    a.priority,
                    a.outcome,
                    a.detail.as_deref().map(|d| format!(" ({d})")).unwrap_or_default()
                )
            })
            .collect();
        tracing::error!(
            request_id = %request.request_id,
            virtual_model = %virtual_model,
            attempts = consumed,
            max_retry_count = budget,
            reasons = ?reasons,
            "No available server"
        );
        Err(SchedulerError::NoAvailableServer {
            virtual_model,
            attempts,
        })
    }

    /// Decide whether a candidate may take the request
    async fn resource_gate(&self, server: &ServerConfig) -> Gate {
        let url = &server.server_url;
        let model = &server.actual_model_name;

        let (verdict, detail) = if self.concurrency.can_reuse(url, model) {
            tracing::trace!(server = %url, model = %model, "Reusing recent sufficient check");
            (ResourceVerdict::Sufficient, None)
        } else if let Some(verdict) = self.resource_cache.get(url, model) {
            (verdict, Some("cached".to_string()))
        } else {
            let check = self
                .monitor
                .check_resource(url, server.server_type, server.performance)
                .await;
            let entry = self.resource_cache.put(url, model, check.verdict);
            if check.verdict.is_sufficient() {
                self.concurrency.record_sufficient(url, model);
            }
            tracing::debug!(
                server = %url,
                model = %model,
                verdict = ?check.verdict,
                ttl_secs = entry.ttl.as_secs(),
                stability = entry.stability_count,
                "Resource check cached"
            );
            (check.verdict, check.detail)
        };

        match verdict {
            ResourceVerdict::Sufficient => Gate::Proceed,
            ResourceVerdict::Insufficient => {
                self.metrics.server(url).insufficient.inc();
                Gate::Reject(AttemptOutcome::Insufficient, detail)
            }
            ResourceVerdict::Unknown if self.config.fail_closed => {
                self.metrics.server(url).insufficient.inc();
                Gate::Reject(AttemptOutcome::MonitorUnknown, detail)
            }
            ResourceVerdict::Unknown => {
                tracing::warn!(
                    server = %url,
                    detail = ?detail,
                    "Resource check unknown, forwarding anyway (fail open)"
                );
                Gate::Proceed
            }
        }
    }

    /// Forward with a concurrency slot held; the slot is released on failure
    async fn forward(
        &self,
        server: &ServerConfig,
        request: &ProxyRequest,
    ) -> Result<(BackendResponse, ConcurrencyToken, Arc<ServerMetrics>), ForwardError> {
        let server_metrics = self.metrics.server(&server.server_url);
        let token = self
            .concurrency
            .begin(&server.server_url, &server.actual_model_name);
        server_metrics.attempts.inc();
        server_metrics.in_flight.inc();

        match self.forwarder.forward(server, request).await {
            Ok(response) => {
                server_metrics
                    .time_to_headers
                    .record_duration(response.time_to_headers);
                Ok((response, token, server_metrics))
            }
            Err(e) => {
                server_metrics.failures.inc();
                server_metrics.in_flight.dec();
                drop(token);
                Err(e)
            }
        }
    }

    fn retrying(
        &self,
        request: &ProxyRequest,
        server: &ServerConfig,
        outcome: AttemptOutcome,
        detail: Option<String>,
        attempt: u32,
        attempts: &mut Vec<AttemptRecord>,
    ) {
        self.metrics.retries.inc();
        tracing::info!(
            request_id = %request.request_id,
            virtual_model = %request.virtual_model,
            server = %server.server_url,
            outcome = ?outcome,
            reason = detail.as_deref().unwrap_or(""),
            attempt,
            max_retry_count = self.config.max_retry_count,
            "Candidate rejected, trying next"
        );
        attempts.push(AttemptRecord::new(server, outcome, detail));
    }

    /// Dry run of tier resolution, health filtering and weighted selection
    ///
    /// Probes do not touch the health table, the resource monitor is not
    /// called and nothing is forwarded.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotFound`] when the virtual model has no routable server.
    pub async fn simulate(&self, virtual_model: &str) -> Result<PrioritySimulation, SchedulerError> {
        let tiers = self
            .registry
            .resolve(virtual_model)
            .ok_or_else(|| SchedulerError::NotFound {
                virtual_model: virtual_model.to_string(),
            })?;

        let health = &self.health;
        let mut simulated = Vec::with_capacity(tiers.len());
        let mut selected = None;

        for tier in &tiers {
            let probes = futures::future::join_all(tier.servers.iter().map(|s| async move {
                let in_cooldown = health.in_cooldown(&s.server_url);
                let healthy = !in_cooldown && health.probe_readonly(&s.server_url).await;
                (in_cooldown, healthy)
            }))
            .await;

            let servers: Vec<SimulatedServer> = tier
                .servers
                .iter()
                .zip(&probes)
                .map(|(s, &(in_cooldown, healthy))| SimulatedServer {
                    id: s.id,
                    server_url: s.server_url.clone(),
                    actual_model_name: s.actual_model_name.clone(),
                    weight: s.weight,
                    skip_resource_check: s.skip_resource_check,
                    healthy,
                    in_cooldown,
                })
                .collect();

            if selected.is_none() {
                let healthy: Vec<Arc<ServerConfig>> = tier
                    .servers
                    .iter()
                    .zip(&probes)
                    .filter(|(_, probe)| probe.1)
                    .map(|(s, _)| Arc::clone(s))
                    .collect();
                let pick = {
                    let mut rng = rand::thread_rng();
                    pick_weighted(&healthy, &mut rng).map(|s| s.id)
                };
                selected = pick.and_then(|id| servers.iter().find(|s| s.id == id).cloned());
            }

            simulated.push(SimulatedTier {
                priority: tier.priority,
                total_weight: tier.total_weight(),
                servers,
            });
        }

        Ok(PrioritySimulation {
            virtual_model: virtual_model.to_string(),
            tiers: simulated,
            selected,
        })
    }

    /// Priority distribution of every virtual model, without probing
    pub fn priority_overview(&self) -> Vec<PriorityOverview> {
        self.registry.snapshot().priority_overview()
    }

    /// Drop every cached verdict and every in-flight reuse window
    ///
    /// The next candidate for any pair goes to the monitor, even while
    /// requests to that pair are still streaming.
    pub fn clear_resource_checks(&self) -> ResourceCheckReset {
        let reset = ResourceCheckReset {
            cache_entries: self.resource_cache.clear(),
            reuse_windows: self.concurrency.clear_checks(),
        };
        tracing::info!(
            cache_entries = reset.cache_entries,
            reuse_windows = reset.reuse_windows,
            "Resource checks cleared"
        );
        reset
    }

    /// CPU/GPU breakdown of a virtual model using read-only probes
    ///
    /// # Errors
    ///
    /// [`SchedulerError::NotFound`] when the virtual model has no routable server.
    pub async fn model_type_check(&self, virtual_model: &str) -> Result<ModelTypeCheck, SchedulerError> {
        let tiers = self
            .registry
            .resolve(virtual_model)
            .ok_or_else(|| SchedulerError::NotFound {
                virtual_model: virtual_model.to_string(),
            })?;
        let servers: Vec<&Arc<ServerConfig>> = tiers.iter().flat_map(|t| &t.servers).collect();

        let health = &self.health;
        let healthy = futures::future::join_all(servers.iter().map(|s| async move {
            !health.in_cooldown(&s.server_url) && health.probe_readonly(&s.server_url).await
        }))
        .await;

        let mut server_types: BTreeMap<&'static str, TypeGroup> = BTreeMap::new();
        let mut best: Option<TypedServer> = None;
        for (server, healthy) in servers.iter().zip(healthy) {
            let typed = TypedServer {
                id: server.id,
                server_url: server.server_url.clone(),
                actual_model_name: server.actual_model_name.clone(),
                server_type: server.server_type,
                performance: server.performance,
                priority: server.priority,
                weight: server.weight,
                skip_resource_check: server.skip_resource_check,
                healthy,
            };
            let better = match &best {
                None => true,
                Some(b) => (typed.priority, Reverse(typed.weight)) < (b.priority, Reverse(b.weight)),
            };
            if healthy && better {
                best = Some(typed.clone());
            }

            let group = server_types.entry(server.server_type.as_str()).or_default();
            group.count += 1;
            group.healthy_count += usize::from(healthy);
            group.servers.push(typed);
        }

        let healthy_servers = server_types.values().map(|g| g.healthy_count).sum();
        let recommendation = match best {
            Some(best) => Some(TypeRecommendation {
                recommended_type: best.server_type,
                reason: format!(
                    "healthy server with priority {} and weight {}",
                    best.priority, best.weight
                ),
                best_server: Some(best),
            }),
            None => {
                let count = |kind: ServerType| server_types.get(kind.as_str()).map_or(0, |g| g.count);
                let kind = if count(ServerType::Cpu) > count(ServerType::Gpu) {
                    ServerType::Cpu
                } else {
                    ServerType::Gpu
                };
                Some(TypeRecommendation {
                    recommended_type: kind,
                    reason: format!(
                        "no healthy server, {} has the most configured servers ({})",
                        kind,
                        count(kind)
                    ),
                    best_server: None,
                })
            }
        };

        Ok(ModelTypeCheck {
            virtual_model: virtual_model.to_string(),
            total_servers: servers.len(),
            healthy_servers,
            server_types,
            recommendation,
        })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryStore;
    use crate::routing::config::{ConcurrencyConfig, HealthConfig, ResourceCacheConfig};
    use crate::routing::test_utils::{server, MockForwarder, MockMonitor, MockProbe, Reply};
    use serde_json::json;
    use std::sync::atomic::Ordering;

    const S1: &str = "http://s1:11434";
    const S2: &str = "http://s2:11434";
    const S3: &str = "http://s3:11434";

    struct Harness {
        scheduler: Scheduler,
        probe: Arc<MockProbe>,
        monitor: Arc<MockMonitor>,
        forwarder: Arc<MockForwarder>,
    }

    async fn harness(rows: Vec<ServerConfig>, config: SchedulerConfig) -> Harness {
        let probe = Arc::new(MockProbe::new());
        let monitor = Arc::new(MockMonitor::new());
        let forwarder = Arc::new(MockForwarder::new());
        let registry = RegistryCache::load(Arc::new(MemoryStore::new(rows)))
            .await
            .unwrap();

        let scheduler = Scheduler::new(
            config,
            SchedulerComponents {
                registry: Arc::new(registry),
                health: Arc::new(HealthProber::new(
                    Arc::clone(&probe) as Arc<dyn crate::routing::health::HealthProbe>,
                    HealthConfig::default(),
                )),
                monitor: Arc::clone(&monitor) as Arc<dyn ResourceMonitor>,
                resource_cache: Arc::new(ResourceCheckCache::new(ResourceCacheConfig::default())),
                concurrency: Arc::new(ConcurrencyTracker::new(&ConcurrencyConfig::default())),
                forwarder: Arc::clone(&forwarder) as Arc<dyn Forwarder>,
                metrics: Arc::new(BalancerMetrics::new()),
            },
        );
        Harness {
            scheduler,
            probe,
            monitor,
            forwarder,
        }
    }

    fn chat() -> ProxyRequest {
        ProxyRequest::new("/api/chat", json!({"model": "chat", "messages": []})).unwrap()
    }

    async fn drain(response: ProxyResponse) -> Vec<Result<Bytes, SchedulerError>> {
        response.body.collect().await
    }

    #[tokio::test]
    async fn test_unhealthy_tier_falls_through_to_skip_check_server() {
        let h = harness(
            vec![
                server(1, S1, 30, 1),
                server(2, S2, 70, 1),
                server(3, S3, 100, 2).skipping_resource_check(),
            ],
            SchedulerConfig::default(),
        )
        .await;
        h.probe.set_down(S1);
        h.probe.set_down(S2);

        let response = h.scheduler.dispatch(chat()).await.unwrap();

        assert_eq!(response.server.id, 3);
        assert_eq!(h.monitor.total_calls(), 0);
        assert_eq!(h.forwarder.calls(), vec![S3.to_string()]);
        let outcomes: Vec<AttemptOutcome> = response.attempts.iter().map(|a| a.outcome).collect();
        assert_eq!(
            outcomes,
            vec![AttemptOutcome::Unhealthy, AttemptOutcome::Unhealthy, AttemptOutcome::Succeeded]
        );
    }

    #[tokio::test]
    async fn test_insufficient_then_sufficient_within_budget() {
        let config = SchedulerConfig {
            max_retry_count: 2,
            ..SchedulerConfig::default()
        };
        for _ in 0..20 {
            let h = harness(vec![server(1, S1, 50, 1), server(2, S2, 50, 1)], config.clone()).await;
            h.monitor.set(S1, ResourceVerdict::Insufficient);

            let response = h.scheduler.dispatch(chat()).await.unwrap();
            assert_eq!(response.server.id, 2);
            let consumed = response
                .attempts
                .iter()
                .filter(|a| a.outcome.consumed_attempt())
                .count();
            assert!(consumed <= 2);
            assert_eq!(h.forwarder.calls(), vec![S2.to_string()]);
        }
    }

    #[tokio::test]
    async fn test_priority_one_always_preferred() {
        let h = harness(
            vec![server(1, S1, 1, 1), server(2, S2, 1000, 2)],
            SchedulerConfig::default(),
        )
        .await;

        for _ in 0..50 {
            let response = h.scheduler.dispatch(chat()).await.unwrap();
            assert_eq!(response.server.id, 1);
        }
        assert_eq!(h.forwarder.call_count(S2), 0);
    }

    #[tokio::test]
    async fn test_model_rewritten_to_actual_name() {
        let h = harness(vec![server(1, S1, 1, 1)], SchedulerConfig::default()).await;
        h.scheduler.dispatch(chat()).await.unwrap();

        let call = h.forwarder.last_call().unwrap();
        assert_eq!(call.body["model"], "llama3");
        assert_eq!(call.endpoint, "/api/chat");
    }

    #[tokio::test]
    async fn test_cached_verdict_reused_until_clear() {
        let h = harness(vec![server(1, S1, 1, 1)], SchedulerConfig::default()).await;

        for _ in 0..3 {
            let response = h.scheduler.dispatch(chat()).await.unwrap();
            drain(response).await;
        }
        assert_eq!(h.monitor.calls(S1), 1);
        assert_eq!(h.forwarder.call_count(S1), 3);

        h.scheduler.resource_cache().clear();
        drain(h.scheduler.dispatch(chat()).await.unwrap()).await;
        assert_eq!(h.monitor.calls(S1), 2);
    }

    #[tokio::test]
    async fn test_in_flight_reuse_skips_monitor() {
        let h = harness(vec![server(1, S1, 1, 1)], SchedulerConfig::default()).await;

        let held = h.scheduler.dispatch(chat()).await.unwrap();
        let second = h.scheduler.dispatch(chat()).await.unwrap();
        assert_eq!(h.monitor.calls(S1), 1);
        assert_eq!(h.scheduler.concurrency().in_flight(S1, "llama3"), 2);

        drop(held);
        drop(second);
        assert_eq!(h.scheduler.concurrency().total_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_clear_closes_reuse_window_while_in_flight() {
        let h = harness(vec![server(1, S1, 1, 1)], SchedulerConfig::default()).await;

        let held = h.scheduler.dispatch(chat()).await.unwrap();
        assert_eq!(h.monitor.calls(S1), 1);

        let reset = h.scheduler.clear_resource_checks();
        assert_eq!(
            reset,
            ResourceCheckReset {
                cache_entries: 1,
                reuse_windows: 1
            }
        );
        assert_eq!(h.scheduler.concurrency().in_flight(S1, "llama3"), 1);

        h.monitor.set(S1, ResourceVerdict::Insufficient);
        let err = h.scheduler.dispatch(chat()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NoAvailableServer { .. }));
        assert_eq!(h.monitor.calls(S1), 2);
        assert_eq!(h.forwarder.calls().len(), 1);

        drop(held);
        assert_eq!(h.scheduler.concurrency().total_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_tokens_released_on_every_outcome() {
        let h = harness(
            vec![server(1, S1, 1, 1), server(2, S2, 1, 2), server(3, S3, 1, 3)],
            SchedulerConfig::default(),
        )
        .await;
        h.forwarder.reply(S1, Reply::ConnectError);
        h.forwarder.reply(S2, Reply::status(500));

        let response = h.scheduler.dispatch(chat()).await.unwrap();
        assert_eq!(response.server.id, 3);
        assert_eq!(h.scheduler.concurrency().total_in_flight(), 1);

        let chunks = drain(response).await;
        assert!(chunks.iter().all(Result::is_ok));
        assert_eq!(h.scheduler.concurrency().total_in_flight(), 0);
        assert_eq!(h.scheduler.metrics().server(S3).in_flight.get(), 0);

        // Failed forwards took their servers out of rotation
        assert!(h.scheduler.health().in_cooldown(S1));
        assert!(h.scheduler.health().in_cooldown(S2));
        assert_eq!(h.scheduler.metrics().retries.get(), 2);
    }

    #[tokio::test]
    async fn test_client_disconnect_cancels_backend_without_retry() {
        let h = harness(vec![server(1, S1, 1, 1), server(2, S2, 1, 1)], SchedulerConfig::default()).await;
        let (hanging, dropped) = Reply::hanging(vec!["{\"response\":\"Hel\"}\n"]);
        h.forwarder.reply(S1, hanging.clone());
        h.forwarder.reply(S2, hanging);

        let mut response = h.scheduler.dispatch(chat()).await.unwrap();
        let first = response.body.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"{\"response\":\"Hel\"}\n"));
        assert_eq!(h.scheduler.concurrency().total_in_flight(), 1);

        drop(response);

        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(h.scheduler.concurrency().total_in_flight(), 0);
        assert_eq!(h.forwarder.calls().len(), 1);
        assert_eq!(h.scheduler.metrics().cancelled.get(), 1);
    }

    #[tokio::test]
    async fn test_silent_backend_holds_slot_while_pending() {
        let h = harness(vec![server(1, S1, 1, 1)], SchedulerConfig::default()).await;
        let (hanging, dropped) = Reply::hanging(vec![]);
        h.forwarder.reply(S1, hanging);

        let mut response = h.scheduler.dispatch(chat()).await.unwrap();
        {
            let mut next = tokio_test::task::spawn(response.body.next());
            tokio_test::assert_pending!(next.poll());
        }
        assert_eq!(h.scheduler.concurrency().in_flight(S1, "llama3"), 1);
        assert_eq!(h.scheduler.metrics().server(S1).in_flight.get(), 1);

        drop(response);
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(h.scheduler.concurrency().total_in_flight(), 0);
        assert_eq!(h.scheduler.metrics().server(S1).in_flight.get(), 0);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_truncation_not_retry() {
        let h = harness(vec![server(1, S1, 1, 1), server(2, S2, 1, 2)], SchedulerConfig::default()).await;
        h.forwarder.reply(
            S1,
            Reply::BrokenStream {
                chunks: vec!["partial"],
            },
        );

        let response = h.scheduler.dispatch(chat()).await.unwrap();
        let items = drain(response).await;

        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(
            &items[1],
            Err(SchedulerError::TruncatedResponse { server_url, .. }) if server_url == S1
        ));
        assert_eq!(h.forwarder.call_count(S2), 0);
        assert!(h.scheduler.health().in_cooldown(S1));
        assert_eq!(h.scheduler.concurrency().total_in_flight(), 0);
        assert_eq!(h.scheduler.metrics().truncated.get(), 1);
        assert_eq!(h.scheduler.metrics().cancelled.get(), 0);
    }

    #[tokio::test]
    async fn test_unknown_verdict_fail_closed() {
        let h = harness(vec![server(1, S1, 1, 1)], SchedulerConfig::default()).await;
        h.monitor.set(S1, ResourceVerdict::Unknown);

        let err = h.scheduler.dispatch(chat()).await.unwrap_err();
        let SchedulerError::NoAvailableServer { attempts, .. } = err else {
            panic!("expected NoAvailableServer, got {err:?}");
        };
        assert_eq!(attempts[0].outcome, AttemptOutcome::MonitorUnknown);
        assert_eq!(h.forwarder.calls().len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_verdict_fail_open() {
        let config = SchedulerConfig {
            fail_closed: false,
            ..SchedulerConfig::default()
        };
        let h = harness(vec![server(1, S1, 1, 1)], config).await;
        h.monitor.set(S1, ResourceVerdict::Unknown);

        let response = h.scheduler.dispatch(chat()).await.unwrap();
        assert_eq!(response.server.id, 1);
    }

    #[tokio::test]
    async fn test_unknown_virtual_model() {
        let h = harness(vec![server(1, S1, 1, 1)], SchedulerConfig::default()).await;
        let request = ProxyRequest::new("/api/generate", json!({"model": "nope"})).unwrap();

        let err = h.scheduler.dispatch(request).await.unwrap_err();
        assert!(matches!(err, SchedulerError::NotFound { ref virtual_model } if virtual_model == "nope"));
        assert_eq!(h.scheduler.metrics().not_found.get(), 1);
    }

    #[tokio::test]
    async fn test_inactive_rows_are_not_found() {
        let h = harness(vec![server(1, S1, 1, 1).inactive()], SchedulerConfig::default()).await;
        assert!(matches!(
            h.scheduler.dispatch(chat()).await,
            Err(SchedulerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_budget_bounds_attempts_across_tiers() {
        let rows = (1..=5)
            .map(|i| server(i, &format!("http://s{i}:11434"), 1, u32::try_from(i).unwrap()))
            .collect();
        let h = harness(rows, SchedulerConfig::default()).await;
        h.monitor.set("http://s1:11434", ResourceVerdict::Insufficient);
        h.monitor.set("http://s2:11434", ResourceVerdict::Insufficient);
        h.monitor.set("http://s3:11434", ResourceVerdict::Insufficient);

        let err = h.scheduler.dispatch(chat()).await.unwrap_err();
        let SchedulerError::NoAvailableServer { attempts, .. } = err else {
            panic!("expected NoAvailableServer");
        };
        assert_eq!(attempts.len(), 3);
        assert_eq!(h.monitor.total_calls(), 3);
        assert_eq!(h.forwarder.calls().len(), 0);
        assert_eq!(h.scheduler.metrics().exhausted.get(), 1);
    }

    #[tokio::test]
    async fn test_every_server_down_is_exhausted() {
        let h = harness(vec![server(1, S1, 1, 1), server(2, S2, 1, 2)], SchedulerConfig::default()).await;
        h.probe.set_down(S1);
        h.probe.set_down(S2);

        let err = h.scheduler.dispatch(chat()).await.unwrap_err();
        let SchedulerError::NoAvailableServer { attempts, .. } = err else {
            panic!("expected NoAvailableServer");
        };
        assert!(attempts.iter().all(|a| a.outcome == AttemptOutcome::Unhealthy));
        assert_eq!(attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_retryable_status_moves_on_without_cooldown() {
        let h = harness(vec![server(1, S1, 1, 1), server(2, S2, 1, 2)], SchedulerConfig::default()).await;
        h.forwarder.reply(S1, Reply::status(404));

        let response = h.scheduler.dispatch(chat()).await.unwrap();
        assert_eq!(response.server.id, 2);
        assert_eq!(response.attempts[0].outcome, AttemptOutcome::ForwardFailed);
        assert!(!h.scheduler.health().in_cooldown(S1));
    }

    #[tokio::test]
    async fn test_client_error_passed_through() {
        let h = harness(vec![server(1, S1, 1, 1), server(2, S2, 1, 2)], SchedulerConfig::default()).await;
        h.forwarder.reply(S1, Reply::status(400));

        let response = h.scheduler.dispatch(chat()).await.unwrap();
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.attempts.last().unwrap().outcome, AttemptOutcome::PassedThrough);
        assert_eq!(h.forwarder.calls().len(), 1);

        drain(response).await;
        assert_eq!(h.scheduler.concurrency().total_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_health_probed_once_per_tier() {
        let h = harness(
            vec![server(1, S1, 1, 1), server(2, S2, 1, 1), server(3, S3, 1, 2)],
            SchedulerConfig::default(),
        )
        .await;
        h.monitor.set(S1, ResourceVerdict::Insufficient);
        h.monitor.set(S2, ResourceVerdict::Insufficient);

        let response = h.scheduler.dispatch(chat()).await.unwrap();
        assert_eq!(response.server.id, 3);
        assert_eq!(h.probe.calls(S1), 1);
        assert_eq!(h.probe.calls(S2), 1);
        assert_eq!(h.probe.calls(S3), 1);
    }

    #[tokio::test]
    async fn test_simulation_has_no_side_effects() {
        let h = harness(
            vec![server(1, S1, 30, 1), server(2, S2, 70, 1), server(3, S3, 100, 2)],
            SchedulerConfig::default(),
        )
        .await;
        h.probe.set_down(S1);
        h.probe.set_down(S2);

        let sim = h.scheduler.simulate("chat").await.unwrap();

        assert_eq!(sim.tiers.len(), 2);
        assert_eq!(sim.tiers[0].total_weight, 100);
        assert!(sim.tiers[0].servers.iter().all(|s| !s.healthy));
        assert_eq!(sim.selected.unwrap().id, 3);

        assert_eq!(h.monitor.total_calls(), 0);
        assert!(h.forwarder.calls().is_empty());
        assert!(!h.scheduler.health().in_cooldown(S1));
        assert!(h.scheduler.health().snapshot_all().is_empty());
        assert_eq!(h.scheduler.metrics().requests.get(), 0);

        assert!(matches!(
            h.scheduler.simulate("nope").await,
            Err(SchedulerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_priority_overview() {
        let h = harness(
            vec![server(1, S1, 30, 1), server(2, S2, 70, 1), server(3, S3, 100, 2)],
            SchedulerConfig::default(),
        )
        .await;

        let overview = h.scheduler.priority_overview();
        assert_eq!(overview.len(), 1);
        assert_eq!(overview[0].preferred_priority, Some(1));
        assert_eq!(overview[0].active_servers, 3);
        assert_eq!(overview[0].priorities.get(&1), Some(&2));
    }

    #[tokio::test]
    async fn test_model_type_check_recommends_best_healthy() {
        let h = harness(
            vec![
                server(1, S1, 100, 1),
                server(2, S2, 50, 1).with_type(ServerType::Cpu),
                server(3, S3, 100, 2).with_type(ServerType::Cpu),
            ],
            SchedulerConfig::default(),
        )
        .await;
        h.probe.set_down(S1);

        let check = h.scheduler.model_type_check("chat").await.unwrap();
        assert_eq!(check.total_servers, 3);
        assert_eq!(check.healthy_servers, 2);
        assert_eq!(check.server_types["CPU"].count, 2);
        assert_eq!(check.server_types["GPU"].healthy_count, 0);

        let recommendation = check.recommendation.unwrap();
        assert_eq!(recommendation.recommended_type, ServerType::Cpu);
        assert_eq!(recommendation.best_server.unwrap().id, 2);
        assert!(h.scheduler.health().snapshot_all().is_empty());
        assert_eq!(h.monitor.total_calls(), 0);
    }

    #[tokio::test]
    async fn test_model_type_check_without_healthy_servers() {
        let h = harness(
            vec![
                server(1, S1, 1, 1).with_type(ServerType::Cpu),
                server(2, S2, 1, 1).with_type(ServerType::Cpu),
                server(3, S3, 1, 2),
            ],
            SchedulerConfig::default(),
        )
        .await;
        for url in [S1, S2, S3] {
            h.probe.set_down(url);
        }

        let check = h.scheduler.model_type_check("chat").await.unwrap();
        assert_eq!(check.healthy_servers, 0);
        let recommendation = check.recommendation.unwrap();
        assert_eq!(recommendation.recommended_type, ServerType::Cpu);
        assert!(recommendation.best_server.is_none());

        assert!(matches!(
            h.scheduler.model_type_check("nope").await,
            Err(SchedulerError::NotFound { .. })
        ));
    }
}
