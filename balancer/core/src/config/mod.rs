//! TOML Configuration File Support
//!
//! Centralized configuration loading for the balancer, from a TOML file at
//! `~/.config/ollama-balancer/balancer.toml`.
//!
//! # Configuration Priority
//!
//! Values are layered with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0:8080"
//! max_request_bytes = 10485760
//!
//! [registry]
//! path = "/etc/ollama-balancer/servers.toml"
//! refresh_interval_secs = 30
//!
//! [health]
//! timeout_ms = 1000
//! cooldown_secs = 30
//!
//! [monitor]
//! cpu_port = 8005
//! gpu_port = 8006
//! timeout_ms = 3000
//! fail_closed = true
//!
//! [resource_cache]
//! base_ttl_secs = 10
//! max_ttl_secs = 300
//! insufficient_ttl_secs = 5
//!
//! [concurrency]
//! grace_period_secs = 10
//!
//! [scheduler]
//! max_retry_count = 3
//!
//! [proxy]
//! header_timeout_secs = 300
//! retry_status_codes = [404, 429]
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::config::{
    ConcurrencyConfig, HealthConfig, MonitorConfig, ProxyConfig, ResourceCacheConfig,
    SchedulerConfig,
};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Highest layer that contributed a value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Listen address
    pub bind_address: Option<String>,
    /// Largest accepted request body
    pub max_request_bytes: Option<usize>,
}

/// `[registry]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryToml {
    /// TOML file holding `[[servers]]` rows
    pub path: Option<PathBuf>,
    /// Seconds between store reloads
    pub refresh_interval_secs: Option<u64>,
}

/// `[health]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Probe path appended to the server URL
    pub probe_path: Option<String>,
    /// Probe timeout in milliseconds
    pub timeout_ms: Option<u64>,
    /// Cooldown after a failure in seconds
    pub cooldown_secs: Option<u64>,
    /// Probe tier members concurrently
    pub concurrent_probes: Option<bool>,
}

/// `[monitor]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorToml {
    /// Monitor port on CPU hosts
    pub cpu_port: Option<u16>,
    /// Monitor port on GPU hosts
    pub gpu_port: Option<u16>,
    /// Monitor call timeout in milliseconds
    pub timeout_ms: Option<u64>,
    /// Treat unknown verdicts as insufficient
    pub fail_closed: Option<bool>,
}

/// `[resource_cache]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceCacheToml {
    /// TTL after the first sufficient result, in seconds
    pub base_ttl_secs: Option<u64>,
    /// TTL cap, in seconds
    pub max_ttl_secs: Option<u64>,
    /// TTL for insufficient and unknown results, in seconds
    pub insufficient_ttl_secs: Option<u64>,
}

/// `[concurrency]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyToml {
    /// Reuse window for sufficient checks, in seconds
    pub grace_period_secs: Option<u64>,
}

/// `[scheduler]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerToml {
    /// Attempts per logical request
    pub max_retry_count: Option<u32>,
}

/// `[proxy]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyToml {
    /// Connect timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
    /// Time to response headers, in seconds
    pub header_timeout_secs: Option<u64>,
    /// Longest gap between body chunks, in seconds
    pub stream_idle_timeout_secs: Option<u64>,
    /// Non-5xx statuses that move on to the next candidate
    pub retry_status_codes: Option<Vec<u16>>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancerToml {
    /// HTTP listener
    pub server: ServerToml,
    /// Registry store and refresh
    pub registry: RegistryToml,
    /// Health probing
    pub health: HealthToml,
    /// Resource monitor client
    pub monitor: MonitorToml,
    /// Resource check cache
    pub resource_cache: ResourceCacheToml,
    /// Concurrency tracking
    pub concurrency: ConcurrencyToml,
    /// Retry policy
    pub scheduler: SchedulerToml,
    /// Forwarding
    pub proxy: ProxyToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved configuration for the balancer
///
/// Use [`load_config`] to load with proper priority handling.
#[derive(Clone, Debug)]
pub struct BalancerConfig {
    /// HTTP listen address
    pub bind_address: SocketAddr,

    /// Largest accepted request body in bytes
    pub max_request_bytes: usize,

    /// Registry file path
    pub registry_path: PathBuf,

    /// Interval between registry reloads
    pub refresh_interval: Duration,

    /// Health probing
    pub health: HealthConfig,

    /// Resource monitor client
    pub monitor: MonitorConfig,

    /// Resource check cache
    pub resource_cache: ResourceCacheConfig,

    /// Concurrency tracking
    pub concurrency: ConcurrencyConfig,

    /// Retry and failover policy
    pub scheduler: SchedulerConfig,

    /// Forwarding timeouts
    pub proxy: ProxyConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_request_bytes: 10 * 1024 * 1024,
            registry_path: PathBuf::from("servers.toml"),
            refresh_interval: Duration::from_secs(30),
            health: HealthConfig::default(),
            monitor: MonitorConfig::default(),
            resource_cache: ResourceCacheConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            scheduler: SchedulerConfig::default(),
            proxy: ProxyConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl BalancerConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the highest layer that contributed a value
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Reject values the balancer cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.scheduler.max_retry_count == 0 {
            return fail("scheduler.max_retry_count must be at least 1");
        }
        if self.max_request_bytes == 0 {
            return fail("server.max_request_bytes must be positive");
        }
        if self.refresh_interval.is_zero() {
            return fail("registry.refresh_interval_secs must be positive");
        }
        if self.health.timeout.is_zero() || self.monitor.timeout.is_zero() {
            return fail("health and monitor timeouts must be positive");
        }
        if self.proxy.connect_timeout.is_zero()
            || self.proxy.header_timeout.is_zero()
            || self.proxy.stream_idle_timeout.is_zero()
        {
            return fail("proxy timeouts must be positive");
        }
        if self.monitor.cpu_port == 0 || self.monitor.gpu_port == 0 {
            return fail("monitor ports must be non-zero");
        }
        if self.resource_cache.base_ttl.is_zero() {
            return fail("resource_cache.base_ttl_secs must be positive");
        }
        if self.resource_cache.base_ttl > self.resource_cache.max_ttl {
            return fail("resource_cache.base_ttl_secs must not exceed max_ttl_secs");
        }
        if !self.health.probe_path.starts_with('/') {
            return fail("health.probe_path must start with '/'");
        }
        if let Some(code) = self
            .scheduler
            .retry_status_codes
            .iter()
            .find(|c| !(100..=599).contains(*c))
        {
            return Err(ConfigError::ValidationError(format!(
                "proxy.retry_status_codes contains invalid status {code}"
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/ollama-balancer/balancer.toml` or
/// `~/.config/ollama-balancer/balancer.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("ollama-balancer").join("balancer.toml"))
}

/// Load configuration from the default path, then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the result does not validate. A missing config file is not an error.
pub fn load_config() -> Result<BalancerConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path, then the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the result does not validate.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<BalancerConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<BalancerConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = BalancerConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: BalancerToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut BalancerConfig, toml: &BalancerToml) -> Result<(), ConfigError> {
    // Server
    if let Some(ref bind) = toml.server.bind_address {
        config.bind_address = bind.parse().map_err(|e| {
            ConfigError::ValidationError(format!("server.bind_address '{bind}': {e}"))
        })?;
    }
    if let Some(bytes) = toml.server.max_request_bytes {
        config.max_request_bytes = bytes;
    }

    // Registry
    if let Some(ref path) = toml.registry.path {
        config.registry_path = path.clone();
    }
    if let Some(secs) = toml.registry.refresh_interval_secs {
        config.refresh_interval = Duration::from_secs(secs);
    }

    // Health
    if let Some(ref path) = toml.health.probe_path {
        config.health.probe_path = path.clone();
    }
    if let Some(ms) = toml.health.timeout_ms {
        config.health.timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.health.cooldown_secs {
        config.health.cooldown = Duration::from_secs(secs);
    }
    if let Some(concurrent) = toml.health.concurrent_probes {
        config.health.concurrent_probes = concurrent;
    }

    // Monitor
    if let Some(port) = toml.monitor.cpu_port {
        config.monitor.cpu_port = port;
    }
    if let Some(port) = toml.monitor.gpu_port {
        config.monitor.gpu_port = port;
    }
    if let Some(ms) = toml.monitor.timeout_ms {
        config.monitor.timeout = Duration::from_millis(ms);
    }
    if let Some(fail_closed) = toml.monitor.fail_closed {
        config.scheduler.fail_closed = fail_closed;
    }

    // Resource cache
    if let Some(secs) = toml.resource_cache.base_ttl_secs {
        config.resource_cache.base_ttl = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.resource_cache.max_ttl_secs {
        config.resource_cache.max_ttl = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.resource_cache.insufficient_ttl_secs {
        config.resource_cache.insufficient_ttl = Duration::from_secs(secs);
    }

    // Concurrency
    if let Some(secs) = toml.concurrency.grace_period_secs {
        config.concurrency.grace_period = Duration::from_secs(secs);
    }

    // Scheduler
    if let Some(count) = toml.scheduler.max_retry_count {
        config.scheduler.max_retry_count = count;
    }

    // Proxy
    if let Some(ms) = toml.proxy.connect_timeout_ms {
        config.proxy.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.proxy.header_timeout_secs {
        config.proxy.header_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.proxy.stream_idle_timeout_secs {
        config.proxy.stream_idle_timeout = Duration::from_secs(secs);
    }
    if let Some(ref codes) = toml.proxy.retry_status_codes {
        config.scheduler.retry_status_codes = codes.clone();
    }

    Ok(())
}

/// Parse an environment value, logging and ignoring garbage
fn parse_env<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    let parsed = raw.trim().parse().ok();
    if parsed.is_none() {
        tracing::warn!(key, value = raw, "Ignoring unparseable environment override");
    }
    parsed
}

fn parse_bool(raw: &str) -> bool {
    let raw = raw.trim();
    raw != "0" && !raw.eq_ignore_ascii_case("false") && !raw.eq_ignore_ascii_case("no")
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut BalancerConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut touched = false;

    if let Some(raw) = env("BALANCER_BIND") {
        if let Some(addr) = parse_env::<SocketAddr>("BALANCER_BIND", &raw) {
            config.bind_address = addr;
            touched = true;
        }
    }
    if let Some(path) = env("BALANCER_REGISTRY_PATH") {
        config.registry_path = PathBuf::from(path);
        touched = true;
    }
    if let Some(raw) = env("BALANCER_REFRESH_INTERVAL") {
        if let Some(secs) = parse_env::<u64>("BALANCER_REFRESH_INTERVAL", &raw) {
            config.refresh_interval = Duration::from_secs(secs);
            touched = true;
        }
    }
    if let Some(raw) = env("BALANCER_HEALTH_TIMEOUT_MS") {
        if let Some(ms) = parse_env::<u64>("BALANCER_HEALTH_TIMEOUT_MS", &raw) {
            config.health.timeout = Duration::from_millis(ms);
            touched = true;
        }
    }
    if let Some(raw) = env("BALANCER_HEALTH_COOLDOWN") {
        if let Some(secs) = parse_env::<u64>("BALANCER_HEALTH_COOLDOWN", &raw) {
            config.health.cooldown = Duration::from_secs(secs);
            touched = true;
        }
    }
    if let Some(raw) = env("RESOURCE_MONITOR_CPU_PORT") {
        if let Some(port) = parse_env::<u16>("RESOURCE_MONITOR_CPU_PORT", &raw) {
            config.monitor.cpu_port = port;
            touched = true;
        }
    }
    if let Some(raw) = env("RESOURCE_MONITOR_GPU_PORT") {
        if let Some(port) = parse_env::<u16>("RESOURCE_MONITOR_GPU_PORT", &raw) {
            config.monitor.gpu_port = port;
            touched = true;
        }
    }
    if let Some(raw) = env("BALANCER_MONITOR_TIMEOUT_MS") {
        if let Some(ms) = parse_env::<u64>("BALANCER_MONITOR_TIMEOUT_MS", &raw) {
            config.monitor.timeout = Duration::from_millis(ms);
            touched = true;
        }
    }
    if let Some(raw) = env("BALANCER_FAIL_CLOSED") {
        config.scheduler.fail_closed = parse_bool(&raw);
        touched = true;
    }
    if let Some(raw) = env("BALANCER_MAX_RETRY") {
        if let Some(count) = parse_env::<u32>("BALANCER_MAX_RETRY", &raw) {
            config.scheduler.max_retry_count = count;
            touched = true;
        }
    }
    if let Some(raw) = env("BALANCER_GRACE_PERIOD") {
        if let Some(secs) = parse_env::<u64>("BALANCER_GRACE_PERIOD", &raw) {
            config.concurrency.grace_period = Duration::from_secs(secs);
            touched = true;
        }
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line overrides, applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub bind_address: Option<SocketAddr>,

    /// Registry file override
    pub registry_path: Option<PathBuf>,

    /// Attempt budget override
    pub max_retry_count: Option<u32>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = Some(addr);
        self
    }

    /// Set registry file override
    #[must_use]
    pub fn with_registry_path(mut self, path: PathBuf) -> Self {
        self.registry_path = Some(path);
        self
    }

    /// Set attempt budget override
    #[must_use]
    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = Some(count);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut BalancerConfig) {
        if self.bind_address.is_some()
            || self.registry_path.is_some()
            || self.max_retry_count.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(addr) = self.bind_address {
            config.bind_address = addr;
        }
        if let Some(ref path) = self.registry_path {
            config.registry_path = path.clone();
        }
        if let Some(count) = self.max_retry_count {
            config.scheduler.max_retry_count = count;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Defaults
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = BalancerConfig::default();

        assert_eq!(config.bind_address.port(), 8080);
        assert_eq!(config.refresh_interval, Duration::from_secs(30));
        assert_eq!(config.health.timeout, Duration::from_secs(1));
        assert_eq!(config.monitor.cpu_port, 8005);
        assert_eq!(config.monitor.gpu_port, 8006);
        assert_eq!(config.scheduler.max_retry_count, 3);
        assert!(config.scheduler.fail_closed);
        assert_eq!(config.concurrency.grace_period, Duration::from_secs(10));
        assert!(config.concurrency.grace_period <= config.resource_cache.base_ttl);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.ends_with("ollama-balancer/balancer.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing
    // =========================================================================

    #[test]
    fn test_parse_full_toml() {
        let file = write_toml(
            r#"
[server]
bind_address = "127.0.0.1:9000"
max_request_bytes = 2048

[registry]
path = "/etc/balancer/servers.toml"
refresh_interval_secs = 5

[health]
probe_path = "/api/version"
timeout_ms = 250
cooldown_secs = 60
concurrent_probes = false

[monitor]
cpu_port = 9005
gpu_port = 9006
timeout_ms = 800
fail_closed = false

[resource_cache]
base_ttl_secs = 2
max_ttl_secs = 64
insufficient_ttl_secs = 1

[concurrency]
grace_period_secs = 12

[scheduler]
max_retry_count = 5

[proxy]
connect_timeout_ms = 700
header_timeout_secs = 90
stream_idle_timeout_secs = 45
retry_status_codes = [429]
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.bind_address, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.max_request_bytes, 2048);
        assert_eq!(config.registry_path, PathBuf::from("/etc/balancer/servers.toml"));
        assert_eq!(config.refresh_interval, Duration::from_secs(5));
        assert_eq!(config.health.probe_path, "/api/version");
        assert_eq!(config.health.timeout, Duration::from_millis(250));
        assert!(!config.health.concurrent_probes);
        assert_eq!(config.monitor.gpu_port, 9006);
        assert!(!config.scheduler.fail_closed);
        assert_eq!(config.resource_cache.max_ttl, Duration::from_secs(64));
        assert_eq!(config.concurrency.grace_period, Duration::from_secs(12));
        assert_eq!(config.scheduler.max_retry_count, 5);
        assert_eq!(config.scheduler.retry_status_codes, vec![429]);
        assert_eq!(config.proxy.stream_idle_timeout, Duration::from_secs(45));
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));
    }

    #[test]
    fn test_parse_partial_toml() {
        let file = write_toml("[scheduler]\nmax_retry_count = 7\n");
        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.scheduler.max_retry_count, 7);
        assert_eq!(config.monitor.cpu_port, 8005);
        assert_eq!(config.resource_cache.base_ttl, Duration::from_secs(10));
    }

    #[test]
    fn test_missing_file_graceful() {
        let path = PathBuf::from("/nonexistent/ollama-balancer/balancer.toml");
        let config = load_config_with_env(Some(path), no_env).unwrap();

        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_toml("[scheduler\nmax_retry_count = ");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_bad_bind_address() {
        let file = write_toml("[server]\nbind_address = \"not-an-address\"\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    // =========================================================================
    // Validation
    // =========================================================================

    #[test]
    fn test_validation_rejects_nonsense() {
        let mut config = BalancerConfig::default();
        config.scheduler.max_retry_count = 0;
        assert!(config.validate().is_err());

        let mut config = BalancerConfig::default();
        config.resource_cache.base_ttl = Duration::from_secs(600);
        assert!(config.validate().is_err());

        let mut config = BalancerConfig::default();
        config.monitor.gpu_port = 0;
        assert!(config.validate().is_err());

        let mut config = BalancerConfig::default();
        config.scheduler.retry_status_codes = vec![429, 1000];
        assert!(config.validate().is_err());
    }

    // =========================================================================
    // Priority Ordering
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = write_toml(
            "[scheduler]\nmax_retry_count = 5\n\n[monitor]\ngpu_port = 9006\nfail_closed = true\n",
        );
        let env: HashMap<&str, &str> = HashMap::from([
            ("BALANCER_MAX_RETRY", "2"),
            ("RESOURCE_MONITOR_GPU_PORT", "7006"),
            ("BALANCER_FAIL_CLOSED", "false"),
            ("BALANCER_GRACE_PERIOD", "3"),
        ]);

        let config = load_config_with_env(Some(file.path().to_path_buf()), |key| {
            env.get(key).map(ToString::to_string)
        })
        .unwrap();

        assert_eq!(config.scheduler.max_retry_count, 2);
        assert_eq!(config.monitor.gpu_port, 7006);
        assert!(!config.scheduler.fail_closed);
        assert_eq!(config.concurrency.grace_period, Duration::from_secs(3));
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_unparseable_env_ignored() {
        let config = load_config_with_env(None, |key| {
            (key == "BALANCER_MAX_RETRY").then(|| "lots".to_string())
        })
        .unwrap();

        assert_eq!(config.scheduler.max_retry_count, 3);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = load_config_with_env(None, |key| {
            (key == "BALANCER_MAX_RETRY").then(|| "2".to_string())
        })
        .unwrap();
        assert_eq!(config.source(), ConfigSource::Env);

        ConfigOverrides::new()
            .with_max_retry_count(9)
            .with_bind_address("127.0.0.1:1234".parse().unwrap())
            .apply(&mut config);

        assert_eq!(config.scheduler.max_retry_count, 9);
        assert_eq!(config.bind_address.port(), 1234);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_no_change() {
        let mut config = BalancerConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }
}
