//! Shared handler state

use std::sync::Arc;

use anyhow::{Context, Result};

use balancer_core::{
    BalancerConfig, RegistryCache, ResourceMonitorClient, Scheduler, SchedulerComponents,
    TomlFileStore,
};

/// Everything a handler needs, cheap to clone
#[derive(Clone, Debug)]
pub struct AppState {
    /// Request pipeline and the tables it owns
    pub scheduler: Arc<Scheduler>,

    /// Monitor client for the informational admin calls
    pub monitor: Arc<ResourceMonitorClient>,

    /// Resolved configuration
    pub config: Arc<BalancerConfig>,
}

impl AppState {
    /// Assemble state from already built parts
    #[must_use]
    pub fn new(
        scheduler: Arc<Scheduler>,
        monitor: Arc<ResourceMonitorClient>,
        config: Arc<BalancerConfig>,
    ) -> Self {
        Self {
            scheduler,
            monitor,
            config,
        }
    }

    /// Load the registry file and build the HTTP-backed scheduler
    ///
    /// # Errors
    ///
    /// Fails if the registry cannot be read on first load or an HTTP client
    /// cannot be built.
    pub async fn from_config(config: BalancerConfig) -> Result<Self> {
        let store = Arc::new(TomlFileStore::new(&config.registry_path));
        let registry = RegistryCache::load(store).await.with_context(|| {
            format!(
                "Failed to load server registry from {}",
                config.registry_path.display()
            )
        })?;

        let components = SchedulerComponents::http(&config, Arc::new(registry))
            .context("Failed to build scheduler HTTP clients")?;
        let monitor = ResourceMonitorClient::new(config.monitor.clone())
            .context("Failed to build resource monitor client")?;
        let scheduler = Scheduler::new(config.scheduler.clone(), components);

        Ok(Self::new(
            Arc::new(scheduler),
            Arc::new(monitor),
            Arc::new(config),
        ))
    }
}
