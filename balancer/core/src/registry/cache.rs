//! Registry snapshot cache
//!
//! The hot path never talks to the store. It reads an immutable
//! [`RegistrySnapshot`] behind an `Arc`; a background task rebuilds the
//! snapshot on an interval and swaps the pointer in one step, so readers
//! see either the old rows or the new rows, never a mix.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ServerConfig, ServerStore, ServerType, StoreError, Tier};

// ============================================================================
// Snapshot
// ============================================================================

/// Immutable view of the registry at one refresh
#[derive(Debug)]
pub struct RegistrySnapshot {
    tiers: HashMap<String, Vec<Tier>>,
    servers: HashMap<u64, Arc<ServerConfig>>,
    total_rows: usize,
    loaded_at: DateTime<Utc>,
}

impl RegistrySnapshot {
    /// Build tiers from raw rows
    ///
    /// Inactive and zero-weight rows are counted but never enter a tier.
    #[must_use]
    pub fn from_rows(rows: Vec<ServerConfig>) -> Self {
        let total_rows = rows.len();
        let mut grouped: HashMap<String, BTreeMap<u32, Vec<Arc<ServerConfig>>>> = HashMap::new();
        let mut servers = HashMap::with_capacity(rows.len());

        for row in rows {
            let row = Arc::new(row);
            servers.insert(row.id, Arc::clone(&row));
            if !row.is_routable() {
                continue;
            }
            grouped
                .entry(row.virtual_model_name.clone())
                .or_default()
                .entry(row.priority)
                .or_default()
                .push(row);
        }

        let tiers = grouped
            .into_iter()
            .map(|(model, by_priority)| {
                let tiers = by_priority
                    .into_iter()
                    .map(|(priority, servers)| Tier { priority, servers })
                    .collect();
                (model, tiers)
            })
            .collect();

        Self {
            tiers,
            servers,
            total_rows,
            loaded_at: Utc::now(),
        }
    }

    /// Tiers for a virtual model, ascending priority
    #[must_use]
    pub fn tiers(&self, virtual_model: &str) -> Option<&[Tier]> {
        self.tiers
            .get(virtual_model)
            .map(Vec::as_slice)
            .filter(|tiers| !tiers.is_empty())
    }

    /// Any row by id, routable or not
    #[must_use]
    pub fn server(&self, id: u64) -> Option<&Arc<ServerConfig>> {
        self.servers.get(&id)
    }

    /// Virtual models with at least one routable row, sorted
    #[must_use]
    pub fn virtual_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.tiers.keys().cloned().collect();
        models.sort();
        models
    }

    /// When this snapshot was built
    #[must_use]
    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Row counts
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let active = self.servers.values().filter(|s| s.is_active).count();
        RegistryStats {
            total: self.total_rows,
            active,
            inactive: self.total_rows - active,
            virtual_models: self.tiers.len(),
            loaded_at: self.loaded_at,
        }
    }

    /// Priority distribution per virtual model
    #[must_use]
    pub fn priority_overview(&self) -> Vec<ModelPriorityOverview> {
        let mut overview: Vec<ModelPriorityOverview> = self
            .tiers
            .iter()
            .map(|(model, tiers)| ModelPriorityOverview {
                virtual_model: model.clone(),
                preferred_priority: tiers.first().map(|t| t.priority),
                active_servers: tiers.iter().map(|t| t.servers.len()).sum(),
                priorities: tiers
                    .iter()
                    .map(|t| (t.priority, t.servers.len()))
                    .collect(),
            })
            .collect();
        overview.sort_by(|a, b| a.virtual_model.cmp(&b.virtual_model));
        overview
    }

    /// CPU/GPU distribution per virtual model
    ///
    /// A model's primary type is the one with more routable rows; ties go to
    /// GPU. The summary counts each model once, under its primary type.
    #[must_use]
    pub fn type_overview(&self) -> ModelTypeOverview {
        let mut type_summary: BTreeMap<&'static str, TypeSummary> = [ServerType::Cpu, ServerType::Gpu]
            .into_iter()
            .map(|kind| (kind.as_str(), TypeSummary::default()))
            .collect();
        let mut models = BTreeMap::new();

        for (model, tiers) in &self.tiers {
            let mut types: BTreeMap<&'static str, usize> = BTreeMap::new();
            let mut cpu = 0;
            let mut gpu = 0;
            for server in tiers.iter().flat_map(|t| &t.servers) {
                *types.entry(server.server_type.as_str()).or_default() += 1;
                match server.server_type {
                    ServerType::Cpu => cpu += 1,
                    ServerType::Gpu => gpu += 1,
                }
            }

            let primary_type = match (cpu, gpu) {
                (0, 0) => None,
                (cpu, gpu) if cpu > gpu => Some(ServerType::Cpu),
                _ => Some(ServerType::Gpu),
            };
            if let Some(primary) = primary_type {
                let summary = type_summary.entry(primary.as_str()).or_default();
                summary.models += 1;
                summary.servers += types.get(primary.as_str()).copied().unwrap_or(0);
            }

            models.insert(
                model.clone(),
                ModelTypes {
                    total_servers: cpu + gpu,
                    types,
                    primary_type,
                },
            );
        }

        ModelTypeOverview {
            total_models: models.len(),
            models,
            type_summary,
        }
    }
}

/// Row counts of a snapshot
#[derive(Clone, Debug, Serialize)]
pub struct RegistryStats {
    /// All rows
    pub total: usize,
    /// Rows with `is_active`
    pub active: usize,
    /// Rows without `is_active`
    pub inactive: usize,
    /// Virtual models with a routable row
    pub virtual_models: usize,
    /// Snapshot build time
    pub loaded_at: DateTime<Utc>,
}

/// Priority distribution of one virtual model
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelPriorityOverview {
    /// Virtual model name
    pub virtual_model: String,
    /// Lowest priority value present
    pub preferred_priority: Option<u32>,
    /// Routable rows across all tiers
    pub active_servers: usize,
    /// Routable rows per priority
    pub priorities: BTreeMap<u32, usize>,
}

/// Server type distribution across every virtual model
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelTypeOverview {
    /// Number of virtual models
    pub total_models: usize,
    /// Per-model server type breakdown
    pub models: BTreeMap<String, ModelTypes>,
    /// Models and their primary-type rows, keyed by type
    pub type_summary: BTreeMap<&'static str, TypeSummary>,
}

/// Server types behind one virtual model
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ModelTypes {
    /// Number of servers behind the model
    pub total_servers: usize,
    /// Server count per type
    pub types: BTreeMap<&'static str, usize>,
    /// Primary server type, if any
    pub primary_type: Option<ServerType>,
}

/// Per-type summary counts
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TypeSummary {
    /// Number of models
    pub models: usize,
    /// Number of servers
    pub servers: usize,
}

// ============================================================================
// Registry Cache
// ============================================================================

/// Shared owner of the current snapshot
pub struct RegistryCache {
    store: Arc<dyn ServerStore>,
    current: RwLock<Arc<RegistrySnapshot>>,
    refreshes: AtomicU64,
    refresh_failures: AtomicU64,
}

impl RegistryCache {
    /// Load the first snapshot from `store`
    ///
    /// # Errors
    ///
    /// Returns the store error; there is no previous snapshot to fall back to.
    pub async fn load(store: Arc<dyn ServerStore>) -> Result<Self, StoreError> {
        let rows = store.load_servers().await?;
        let snapshot = RegistrySnapshot::from_rows(rows);
        tracing::info!(
            store = %store.describe(),
            servers = snapshot.total_rows,
            virtual_models = snapshot.tiers.len(),
            "Registry loaded"
        );
        Ok(Self {
            store,
            current: RwLock::new(Arc::new(snapshot)),
            refreshes: AtomicU64::new(1),
            refresh_failures: AtomicU64::new(0),
        })
    }

    /// Current snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Tiers for a virtual model, or `None` when nothing is routable
    #[must_use]
    pub fn resolve(&self, virtual_model: &str) -> Option<Vec<Tier>> {
        self.snapshot().tiers(virtual_model).map(<[Tier]>::to_vec)
    }

    /// Row counts of the current snapshot
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        self.snapshot().stats()
    }

    /// Successful loads so far, including the first
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    /// Failed refreshes so far
    #[must_use]
    pub fn refresh_failures(&self) -> u64 {
        self.refresh_failures.load(Ordering::Relaxed)
    }

    /// Reload from the store and swap the snapshot
    ///
    /// On failure the previous snapshot stays in place.
    ///
    /// # Errors
    ///
    /// Returns the store error.
    pub async fn refresh_now(&self) -> Result<RegistryStats, StoreError> {
        match self.store.load_servers().await {
            Ok(rows) => {
                let snapshot = Arc::new(RegistrySnapshot::from_rows(rows));
                let stats = snapshot.stats();
                *self.current.write() = snapshot;
                self.refreshes.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    servers = stats.total,
                    active = stats.active,
                    virtual_models = stats.virtual_models,
                    "Registry refreshed"
                );
                Ok(stats)
            }
            Err(e) => {
                self.refresh_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    store = %self.store.describe(),
                    error = %e,
                    "Registry refresh failed, keeping previous snapshot"
                );
                Err(e)
            }
        }
    }

    /// Spawn the periodic refresh task
    ///
    /// The task exits when `shutdown` flips to `true` or its sender is dropped.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately and the initial load already happened
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        // Failure is logged inside and the old snapshot is kept
                        let _ = cache.refresh_now().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("Registry refresh task stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}

impl std::fmt::Debug for RegistryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCache")
            .field("store", &self.store.describe())
            .field("refreshes", &self.refresh_count())
            .field("refresh_failures", &self.refresh_failures())
            .finish_non_exhaustive()
    }
}
