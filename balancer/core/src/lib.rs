//! Balancer Core - Tiered Scheduling for Pools of Ollama Servers
//!
//! This crate decides, for every inbound inference request, which backend
//! server should serve it, checks that the backend can actually take the
//! request, and recovers from failure by moving on to the next candidate.
//! It has no HTTP server of its own; the daemon crate wires it to axum.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           Scheduler                              │
//! │                                                                  │
//! │  resolve ──> health filter ──> weighted pick ──> resource gate  │
//! │     │              │                                  │          │
//! │     v              v                                  v          │
//! │ ┌──────────┐ ┌────────────┐  ┌──────────────┐ ┌────────────────┐ │
//! │ │ Registry │ │   Health   │  │ Concurrency  │ │ Resource Cache │ │
//! │ │  Cache   │ │   Prober   │  │   Tracker    │ │  + Monitor RPC │ │
//! │ └────┬─────┘ └────────────┘  └──────────────┘ └────────────────┘ │
//! │      │                                                           │
//! └──────┼───────────────────────────────┬───────────────────────────┘
//!        │ periodic refresh              │ forward + stream back
//!        v                               v
//! ┌──────────────┐               ┌───────────────┐
//! │ ServerStore  │               │ HttpForwarder │ ──> backend servers
//! └──────────────┘               └───────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Scheduler`]: the per-request decision pipeline with retry/failover
//! - [`RegistryCache`]: periodically refreshed snapshot of [`ServerConfig`] rows
//! - [`HealthProber`]: liveness probes with cooldown for failed servers
//! - [`ResourceCheckCache`]: adaptive-TTL cache of resource verdicts
//! - [`ConcurrencyTracker`]: in-flight counters released by RAII tokens
//! - [`HttpForwarder`]: streaming HTTP forwarder
//! - [`BalancerConfig`]: TOML/env/CLI layered configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod proxy;
pub mod registry;
pub mod routing;

pub use config::{
    default_config_path, load_config, load_config_from_path, BalancerConfig, ConfigError,
    ConfigOverrides, ConfigSource,
};
pub use proxy::{BackendResponse, ForwardError, Forwarder, HttpForwarder, ProxyRequest};
pub use registry::{
    MemoryStore, ModelTypeOverview, RegistryCache, RegistrySnapshot, RegistryStats, ServerConfig,
    ServerStore, ServerType, StoreError, Tier, TomlFileStore,
};
pub use routing::concurrency::{ConcurrencyToken, ConcurrencyTracker};
pub use routing::health::{HealthProbe, HealthProber, HttpHealthProbe};
pub use routing::metrics::BalancerMetrics;
pub use routing::monitor::{ResourceCheck, ResourceMonitor, ResourceMonitorClient, ResourceVerdict};
pub use routing::resource_cache::{ResourceCacheStats, ResourceCheckCache};
pub use routing::scheduler::{
    AttemptOutcome, AttemptRecord, ModelTypeCheck, PriorityOverview, PrioritySimulation,
    ProxyResponse, ResourceCheckReset, Scheduler, SchedulerComponents, SchedulerError,
};
