//! Balancer Metrics
//!
//! Observability for scheduling and forwarding:
//! - Per-server attempts, successes, failures and skips
//! - Time to response headers per server
//! - Terminal outcomes (not found, exhausted, truncated, cancelled)
//! - Resource cache hit ratio (read from the cache at export time)

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use super::resource_cache::ResourceCacheStats;

// ============================================================================
// Histogram
// ============================================================================

/// Bucketed latency distribution
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    total_count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
}

impl Histogram {
    /// Histogram with the given upper bounds
    pub fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            total_count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
        }
    }

    /// Millisecond buckets suited to inference time-to-headers
    pub fn latency_default() -> Self {
        Self::new(vec![
            10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0,
            300_000.0,
        ])
    }

    /// Record one sample
    pub fn record(&self, value: f64) {
        if self.counts.is_empty() {
            return;
        }
        let idx = self
            .buckets
            .iter()
            .position(|&b| value <= b)
            .unwrap_or(self.buckets.len() - 1);
        self.counts[idx].fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);

        let value = value.max(0.0) as u64;
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    /// Record a duration in milliseconds
    pub fn record_duration(&self, elapsed: Duration) {
        self.record(elapsed.as_secs_f64() * 1000.0);
    }

    /// Copy of the current counts
    pub fn snapshot(&self) -> HistogramSnapshot {
        let total = self.total_count.load(Ordering::Relaxed);
        let sum = self.sum.load(Ordering::Relaxed);
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self
                .counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            total,
            sum,
            max: self.max.load(Ordering::Relaxed),
            mean: if total > 0 {
                sum as f64 / total as f64
            } else {
                0.0
            },
        }
    }
}

/// Histogram counts at one point in time
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub total: u64,
    pub sum: u64,
    pub max: u64,
    pub mean: f64,
}

impl HistogramSnapshot {
    /// Upper bound of the bucket holding the `p` quantile
    pub fn percentile(&self, p: f64) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let target = ((self.total as f64 * p).ceil() as u64).max(1);
        let mut cumulative = 0u64;
        for (i, &count) in self.counts.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return self.buckets[i];
            }
        }
        self.buckets.last().copied().unwrap_or(0.0)
    }

    pub fn p50(&self) -> f64 {
        self.percentile(0.5)
    }

    pub fn p99(&self) -> f64 {
        self.percentile(0.99)
    }
}

// ============================================================================
// Counter / Gauge
// ============================================================================

/// Monotonic counter
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Up/down value that never goes below zero
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Per-Server Metrics
// ============================================================================

/// Counters for one backend server
#[derive(Debug)]
pub struct ServerMetrics {
    pub server_url: String,
    /// Forwards started
    pub attempts: Counter,
    /// Forwards answered with a 2xx
    pub successes: Counter,
    /// Forwards failing before headers or answered with a retryable status
    pub failures: Counter,
    /// Times skipped because of a failed probe or cooldown
    pub unhealthy_skips: Counter,
    /// Times skipped because resources were insufficient or unknown
    pub insufficient: Counter,
    /// Streams that failed after headers
    pub truncated: Counter,
    /// Streams dropped by the client before completion
    pub cancelled: Counter,
    /// Response bodies currently streaming
    pub in_flight: Gauge,
    /// Time from forward start to response headers, in ms
    pub time_to_headers: Histogram,
}

impl ServerMetrics {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            attempts: Counter::new(),
            successes: Counter::new(),
            failures: Counter::new(),
            unhealthy_skips: Counter::new(),
            insufficient: Counter::new(),
            truncated: Counter::new(),
            cancelled: Counter::new(),
            in_flight: Gauge::new(),
            time_to_headers: Histogram::latency_default(),
        }
    }

    /// Failures over attempts, 0 when nothing was attempted
    pub fn error_rate(&self) -> f64 {
        let attempts = self.attempts.get();
        if attempts == 0 {
            return 0.0;
        }
        self.failures.get() as f64 / attempts as f64
    }

    pub fn summary(&self) -> ServerMetricsSummary {
        let latency = self.time_to_headers.snapshot();
        ServerMetricsSummary {
            server_url: self.server_url.clone(),
            attempts: self.attempts.get(),
            successes: self.successes.get(),
            failures: self.failures.get(),
            unhealthy_skips: self.unhealthy_skips.get(),
            insufficient: self.insufficient.get(),
            truncated: self.truncated.get(),
            cancelled: self.cancelled.get(),
            in_flight: self.in_flight.get(),
            error_rate: self.error_rate(),
            time_to_headers_p50_ms: latency.p50(),
            time_to_headers_p99_ms: latency.p99(),
        }
    }
}

/// Serializable view of [`ServerMetrics`]
#[derive(Clone, Debug, Serialize)]
pub struct ServerMetricsSummary {
    pub server_url: String,
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub unhealthy_skips: u64,
    pub insufficient: u64,
    pub truncated: u64,
    pub cancelled: u64,
    pub in_flight: u64,
    pub error_rate: f64,
    pub time_to_headers_p50_ms: f64,
    pub time_to_headers_p99_ms: f64,
}

// ============================================================================
// Balancer Metrics
// ============================================================================

/// Process-wide metrics registry
pub struct BalancerMetrics {
    servers: DashMap<String, Arc<ServerMetrics>>,

    /// Logical requests received by the scheduler
    pub requests: Counter,
    /// Requests that reached a backend and got a 2xx
    pub succeeded: Counter,
    /// Requests whose backend answered with a non-retryable error status
    pub passed_through: Counter,
    /// Requests for unknown virtual models
    pub not_found: Counter,
    /// Requests that ran out of candidates or attempts
    pub exhausted: Counter,
    /// Candidates abandoned in favour of another
    pub retries: Counter,
    /// Streams that failed after headers
    pub truncated: Counter,
    /// Streams dropped by the client
    pub cancelled: Counter,

    started_at: Instant,
}

impl BalancerMetrics {
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
            requests: Counter::new(),
            succeeded: Counter::new(),
            passed_through: Counter::new(),
            not_found: Counter::new(),
            exhausted: Counter::new(),
            retries: Counter::new(),
            truncated: Counter::new(),
            cancelled: Counter::new(),
            started_at: Instant::now(),
        }
    }

    /// Get or create the metrics for a server
    pub fn server(&self, server_url: &str) -> Arc<ServerMetrics> {
        if let Some(existing) = self.servers.get(server_url) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.servers
                .entry(server_url.to_string())
                .or_insert_with(|| Arc::new(ServerMetrics::new(server_url)))
                .value(),
        )
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Per-server summaries sorted by URL
    pub fn server_summaries(&self) -> Vec<ServerMetricsSummary> {
        let mut all: Vec<ServerMetricsSummary> =
            self.servers.iter().map(|m| m.summary()).collect();
        all.sort_by(|a, b| a.server_url.cmp(&b.server_url));
        all
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            uptime_seconds: self.uptime().as_secs(),
            requests: self.requests.get(),
            succeeded: self.succeeded.get(),
            passed_through: self.passed_through.get(),
            not_found: self.not_found.get(),
            exhausted: self.exhausted.get(),
            retries: self.retries.get(),
            truncated: self.truncated.get(),
            cancelled: self.cancelled.get(),
            servers: self.server_summaries(),
        }
    }

    /// Prometheus text exposition
    pub fn to_prometheus(&self, cache: &ResourceCacheStats) -> String {
        let mut out = String::new();

        let totals = [
            ("balancer_requests_total", "Logical requests received", self.requests.get()),
            ("balancer_succeeded_total", "Requests answered with 2xx", self.succeeded.get()),
            ("balancer_passed_through_total", "Requests answered with a non-retryable backend error", self.passed_through.get()),
            ("balancer_not_found_total", "Requests for unknown virtual models", self.not_found.get()),
            ("balancer_exhausted_total", "Requests with no available server", self.exhausted.get()),
            ("balancer_retries_total", "Candidates abandoned for another", self.retries.get()),
            ("balancer_truncated_total", "Streams failed after headers", self.truncated.get()),
            ("balancer_cancelled_total", "Streams dropped by the client", self.cancelled.get()),
        ];
        for (name, help, value) in totals {
            let _ = write!(
                out,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            );
        }

        let _ = write!(
            out,
            "# HELP balancer_resource_cache_hits_total Resource cache hits\n\
             # TYPE balancer_resource_cache_hits_total counter\n\
             balancer_resource_cache_hits_total {}\n\n\
             # HELP balancer_resource_cache_misses_total Resource cache misses\n\
             # TYPE balancer_resource_cache_misses_total counter\n\
             balancer_resource_cache_misses_total {}\n\n\
             # HELP balancer_resource_cache_hit_ratio Resource cache hit ratio\n\
             # TYPE balancer_resource_cache_hit_ratio gauge\n\
             balancer_resource_cache_hit_ratio {}\n\n\
             # HELP balancer_resource_cache_entries Resource cache entries\n\
             # TYPE balancer_resource_cache_entries gauge\n\
             balancer_resource_cache_entries {}\n\n",
            cache.hits, cache.misses, cache.hit_ratio, cache.total_entries
        );

        let servers = self.server_summaries();
        let per_server: [(&str, &str, &str, fn(&ServerMetricsSummary) -> f64); 9] = [
            ("balancer_server_attempts_total", "counter", "Forwards started", |s| s.attempts as f64),
            ("balancer_server_successes_total", "counter", "Forwards answered with 2xx", |s| s.successes as f64),
            ("balancer_server_failures_total", "counter", "Forwards failed", |s| s.failures as f64),
            ("balancer_server_unhealthy_skips_total", "counter", "Skips for failed health", |s| s.unhealthy_skips as f64),
            ("balancer_server_insufficient_total", "counter", "Skips for insufficient resources", |s| s.insufficient as f64),
            ("balancer_server_truncated_total", "counter", "Streams failed after headers", |s| s.truncated as f64),
            ("balancer_server_cancelled_total", "counter", "Streams dropped by the client", |s| s.cancelled as f64),
            ("balancer_server_in_flight", "gauge", "Responses currently streaming", |s| s.in_flight as f64),
            ("balancer_server_time_to_headers_p50_ms", "gauge", "Median time to response headers", |s| s.time_to_headers_p50_ms),
        ];
        for (name, kind, help, value) in per_server {
            if servers.is_empty() {
                continue;
            }
            let _ = writeln!(out, "# HELP {name} {help}\n# TYPE {name} {kind}");
            for server in &servers {
                let _ = writeln!(out, "{name}{{server=\"{}\"}} {}", server.server_url, value(server));
            }
            out.push('\n');
        }

        out
    }
}

impl Default for BalancerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BalancerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalancerMetrics")
            .field("requests", &self.requests.get())
            .field("servers", &self.servers.len())
            .finish_non_exhaustive()
    }
}

/// Serializable view of [`BalancerMetrics`]
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSummary {
    pub uptime_seconds: u64,
    pub requests: u64,
    pub succeeded: u64,
    pub passed_through: u64,
    pub not_found: u64,
    pub exhausted: u64,
    pub retries: u64,
    pub truncated: u64,
    pub cancelled: u64,
    pub servers: Vec<ServerMetricsSummary>,
}
