//! Server Registry
//!
//! Backend rows as the scheduler sees them, the stores they are loaded
//! from, and the in-memory snapshot cache read on the hot path.
//!
//! A row maps one *virtual* model name (what clients ask for) onto one
//! concrete `(server_url, actual_model_name)` pair. Rows sharing a virtual
//! model and a priority form a [`Tier`]; lower priority values are
//! preferred.
//!
//! ```text
//!  virtual model "chat"
//!    ├── tier p=1:  gpu-a (w=30)   gpu-b (w=70)
//!    └── tier p=2:  cpu-a (w=100, skip_resource_check)
//! ```

mod cache;
mod store;

pub use cache::{
    ModelPriorityOverview, ModelTypeOverview, ModelTypes, RegistryCache, RegistrySnapshot,
    RegistryStats, TypeSummary,
};
pub use store::{MemoryStore, ServerStore, StoreError, TomlFileStore};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Server Type
// ============================================================================

/// Hardware class of a backend, which also selects the monitor port
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerType {
    /// CPU-only inference host
    #[serde(rename = "CPU", alias = "cpu")]
    Cpu,

    /// GPU inference host
    #[default]
    #[serde(rename = "GPU", alias = "gpu")]
    Gpu,
}

impl ServerType {
    /// Wire name used by the resource monitor service
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Gpu => "GPU",
        }
    }
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Server Config
// ============================================================================

fn default_weight() -> u32 {
    100
}

fn default_priority() -> u32 {
    1
}

fn default_performance() -> u32 {
    8
}

fn default_active() -> bool {
    true
}

/// One backend row
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique row identifier
    pub id: u64,

    /// Client-facing model name
    pub virtual_model_name: String,

    /// Base URL of the backend, e.g. `http://10.0.0.5:11434`
    pub server_url: String,

    /// Model name the backend actually serves
    pub actual_model_name: String,

    /// Relative share of traffic within the tier
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Tier ordering, ascending = more preferred
    #[serde(default = "default_priority")]
    pub priority: u32,

    /// Hardware class
    #[serde(rename = "type", default)]
    pub server_type: ServerType,

    /// Memory the model needs, in GB
    #[serde(default = "default_performance")]
    pub performance: u32,

    /// Inactive rows are never routed to
    #[serde(default = "default_active")]
    pub is_active: bool,

    /// Forward without asking the resource monitor
    #[serde(default)]
    pub skip_resource_check: bool,

    /// Free-form operator note
    #[serde(default)]
    pub description: Option<String>,

    /// Row creation time
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    /// Last row update time
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ServerConfig {
    /// Create an active row with default weight, priority and type
    pub fn new(
        id: u64,
        virtual_model_name: impl Into<String>,
        server_url: impl Into<String>,
        actual_model_name: impl Into<String>,
    ) -> Self {
        Self {
            id,
            virtual_model_name: virtual_model_name.into(),
            server_url: server_url.into(),
            actual_model_name: actual_model_name.into(),
            weight: default_weight(),
            priority: default_priority(),
            server_type: ServerType::default(),
            performance: default_performance(),
            is_active: true,
            skip_resource_check: false,
            description: None,
            created_at: None,
            updated_at: None,
        }
    }

    /// Set the weight
    #[must_use]
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the hardware class
    #[must_use]
    pub fn with_type(mut self, server_type: ServerType) -> Self {
        self.server_type = server_type;
        self
    }

    /// Set the required memory in GB
    #[must_use]
    pub fn with_performance(mut self, performance: u32) -> Self {
        self.performance = performance;
        self
    }

    /// Bypass the resource monitor for this row
    #[must_use]
    pub fn skipping_resource_check(mut self) -> Self {
        self.skip_resource_check = true;
        self
    }

    /// Mark the row inactive
    #[must_use]
    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }

    /// Whether the row can enter a tier
    #[must_use]
    pub fn is_routable(&self) -> bool {
        self.is_active && self.weight > 0
    }

    /// Server URL without a trailing slash
    #[must_use]
    pub fn base_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// Check the fields the scheduler depends on
    ///
    /// # Errors
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.virtual_model_name.trim().is_empty() {
            return Err(format!("server {}: virtual_model_name is empty", self.id));
        }
        if self.actual_model_name.trim().is_empty() {
            return Err(format!("server {}: actual_model_name is empty", self.id));
        }
        let url = reqwest::Url::parse(&self.server_url)
            .map_err(|e| format!("server {}: invalid server_url: {e}", self.id))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(format!(
                "server {}: server_url must be an http(s) URL with a host",
                self.id
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tier
// ============================================================================

/// Routable rows of one virtual model sharing a priority
#[derive(Clone, Debug)]
pub struct Tier {
    /// Shared priority value
    pub priority: u32,

    /// Members, in registry order
    pub servers: Vec<Arc<ServerConfig>>,
}

impl Tier {
    /// Sum of member weights
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.servers.iter().map(|s| u64::from(s.weight)).sum()
    }
}
