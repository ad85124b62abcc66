//! Request Routing
//!
//! The decision pipeline that turns a virtual model name into one backend,
//! plus the shared tables it reads and writes along the way.
//!
//! # Pipeline
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────┐   ┌─────────────────┐   ┌─────────┐
//! │ resolve  │──>│ health       │──>│ weighted  │──>│ resource gate   │──>│ forward │
//! │ tiers    │   │ filter tier  │   │ pick      │   │ reuse/cache/RPC │   │ + stream│
//! └──────────┘   └──────┬───────┘   └─────┬─────┘   └────────┬────────┘   └────┬────┘
//!      ^                │ none left       ^ insufficient      │                 │ failed
//!      │                v                 └───────────────────┘                 │ before
//!      │          next tier  <──────────────────────────────────────────────────┘ headers
//! ```
//!
//! # Modules
//!
//! - `config`: tunables for every stage
//! - `health`: liveness probes with cooldown
//! - `monitor`: resource monitor RPC client
//! - `resource_cache`: adaptive-TTL verdict cache
//! - `concurrency`: in-flight counters and check reuse
//! - `selection`: weighted random pick
//! - `scheduler`: the pipeline itself, with retry and failover
//! - `metrics`: counters for all of the above

#![allow(missing_docs)]

pub mod concurrency;
pub mod config;
pub mod health;
pub mod metrics;
pub mod monitor;
pub mod resource_cache;
pub mod scheduler;
pub mod selection;

#[cfg(test)]
pub mod test_utils;

pub use concurrency::{ConcurrencySnapshot, ConcurrencyToken, ConcurrencyTracker};
pub use config::{
    ConcurrencyConfig, HealthConfig, MonitorConfig, ProxyConfig, ResourceCacheConfig,
    SchedulerConfig,
};
pub use health::{HealthProbe, HealthProber, HealthSnapshot, HealthState, HttpHealthProbe};
pub use metrics::{BalancerMetrics, MetricsSummary, ServerMetrics};
pub use monitor::{ResourceCheck, ResourceMonitor, ResourceMonitorClient, ResourceVerdict};
pub use resource_cache::{ResourceCacheStats, ResourceCheckCache};
pub use scheduler::{Scheduler, SchedulerComponents, SchedulerError};
