//! Routing Configuration
//!
//! Tunables for each stage of the scheduling pipeline. Every struct has a
//! `Default` that matches the documented TOML defaults in [`crate::config`].

use std::time::Duration;

use reqwest::StatusCode;
use serde::Serialize;

use super::monitor::ResourceVerdict;

// ============================================================================
// Health Probing
// ============================================================================

/// Liveness probe settings
#[derive(Clone, Debug, Serialize)]
pub struct HealthConfig {
    /// Path appended to the server URL for the probe
    pub probe_path: String,

    /// Probe timeout
    pub timeout: Duration,

    /// How long a failed server is skipped without re-probing
    pub cooldown: Duration,

    /// Probe all tier members at once instead of one by one
    pub concurrent_probes: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_path: "/api/tags".to_string(),
            timeout: Duration::from_secs(1),
            cooldown: Duration::from_secs(30),
            concurrent_probes: true,
        }
    }
}

// ============================================================================
// Resource Monitor
// ============================================================================

/// Resource monitor client settings
#[derive(Clone, Debug, Serialize)]
pub struct MonitorConfig {
    /// Monitor port on CPU hosts
    pub cpu_port: u16,

    /// Monitor port on GPU hosts
    pub gpu_port: u16,

    /// Timeout for every monitor call, independent of health probes
    pub timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            cpu_port: 8005,
            gpu_port: 8006,
            timeout: Duration::from_secs(3),
        }
    }
}

// ============================================================================
// Resource Cache
// ============================================================================

/// Adaptive TTL settings for cached resource verdicts
#[derive(Clone, Debug, Serialize)]
pub struct ResourceCacheConfig {
    /// TTL after the first sufficient result
    pub base_ttl: Duration,

    /// Upper bound for sufficient results
    pub max_ttl: Duration,

    /// TTL for insufficient and unknown results
    pub insufficient_ttl: Duration,
}

impl Default for ResourceCacheConfig {
    fn default() -> Self {
        Self {
            base_ttl: Duration::from_secs(10),
            max_ttl: Duration::from_secs(300),
            insufficient_ttl: Duration::from_secs(5),
        }
    }
}

impl ResourceCacheConfig {
    /// TTL for a verdict given its stability count
    ///
    /// Sufficient results double from `base_ttl` per consecutive success
    /// (`base * 2^(n-1)`) and stop at `max_ttl`. Anything else gets the short
    /// fixed TTL.
    #[must_use]
    pub fn ttl_for(&self, verdict: ResourceVerdict, stability: u32) -> Duration {
        match verdict {
            ResourceVerdict::Sufficient => {
                let doublings = stability.saturating_sub(1).min(31);
                self.base_ttl
                    .saturating_mul(1u32 << doublings)
                    .min(self.max_ttl)
            }
            ResourceVerdict::Insufficient | ResourceVerdict::Unknown => self.insufficient_ttl,
        }
    }
}

// ============================================================================
// Concurrency Tracking
// ============================================================================

/// In-flight reuse settings
#[derive(Clone, Debug, Serialize)]
pub struct ConcurrencyConfig {
    /// How recent a sufficient check must be to reuse it while requests are in flight
    ///
    /// Kept no longer than [`ResourceCacheConfig::base_ttl`] by default so a
    /// burst never stretches a first-stage verdict past its cache life.
    pub grace_period: Duration,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Retry and failover policy
#[derive(Clone, Debug, Serialize)]
pub struct SchedulerConfig {
    /// Attempts allowed per logical request, across all tiers
    pub max_retry_count: u32,

    /// Treat an unknown resource verdict as insufficient
    pub fail_closed: bool,

    /// Non-5xx statuses that move on to the next candidate
    pub retry_status_codes: Vec<u16>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retry_count: 3,
            fail_closed: true,
            retry_status_codes: vec![404, 429],
        }
    }
}

impl SchedulerConfig {
    /// Whether a backend status sends the request to another candidate
    #[must_use]
    pub fn should_retry_status(&self, status: StatusCode) -> bool {
        status.is_server_error() || self.retry_status_codes.contains(&status.as_u16())
    }

    /// Whether a backend status means the backend itself is in trouble
    #[must_use]
    pub fn marks_unhealthy(status: StatusCode) -> bool {
        status.is_server_error()
    }
}

// ============================================================================
// Proxy
// ============================================================================

/// Forwarding timeouts
#[derive(Clone, Debug, Serialize)]
pub struct ProxyConfig {
    /// TCP connect timeout
    pub connect_timeout: Duration,

    /// Time allowed from sending the request to receiving response headers
    pub header_timeout: Duration,

    /// Longest gap allowed between two body chunks
    pub stream_idle_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            header_timeout: Duration::from_secs(300),
            stream_idle_timeout: Duration::from_secs(300),
        }
    }
}
