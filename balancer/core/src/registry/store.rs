//! Registry stores
//!
//! The registry rows live outside the balancer; a store only has to hand
//! back the full row set on every refresh.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;

use super::ServerConfig;

/// Errors raised while loading rows
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be read
    #[error("Failed to read registry at {path}: {source}")]
    Read {
        /// Path that was read
        path: PathBuf,
        /// Underlying IO error
        source: std::io::Error,
    },

    /// The backing file is not valid TOML
    #[error("Failed to parse registry: {0}")]
    Parse(#[from] toml::de::Error),

    /// A row is unusable
    #[error("Invalid registry row: {0}")]
    Validation(String),
}

/// Source of server rows
#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Load every row, active or not
    async fn load_servers(&self) -> Result<Vec<ServerConfig>, StoreError>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

fn validate_rows(rows: &[ServerConfig]) -> Result<(), StoreError> {
    let mut seen = HashSet::new();
    for row in rows {
        row.validate().map_err(StoreError::Validation)?;
        if !seen.insert(row.id) {
            return Err(StoreError::Validation(format!(
                "duplicate server id {}",
                row.id
            )));
        }
    }
    Ok(())
}

// ============================================================================
// TOML File Store
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct ServersFile {
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

/// Rows kept in a TOML file of `[[servers]]` tables
///
/// The file is re-read on every load, so edits show up on the next refresh.
///
/// ```toml
/// [[servers]]
/// id = 1
/// virtual_model_name = "chat"
/// server_url = "http://10.0.0.5:11434"
/// actual_model_name = "llama3:8b"
/// weight = 70
/// priority = 1
/// type = "GPU"
/// performance = 8
/// ```
#[derive(Clone, Debug)]
pub struct TomlFileStore {
    path: PathBuf,
}

impl TomlFileStore {
    /// Create a store over `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ServerStore for TomlFileStore {
    async fn load_servers(&self) -> Result<Vec<ServerConfig>, StoreError> {
        let content =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|source| StoreError::Read {
                    path: self.path.clone(),
                    source,
                })?;
        let file: ServersFile = toml::from_str(&content)?;
        validate_rows(&file.servers)?;
        Ok(file.servers)
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

// ============================================================================
// Memory Store
// ============================================================================

/// In-process rows, replaced wholesale or row by row
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<Vec<ServerConfig>>,
}

impl MemoryStore {
    /// Create a store holding `rows`
    #[must_use]
    pub fn new(rows: Vec<ServerConfig>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    /// Replace every row
    pub fn replace(&self, rows: Vec<ServerConfig>) {
        *self.rows.write() = rows;
    }

    /// Insert or update a row by id
    pub fn upsert(&self, row: ServerConfig) {
        let mut rows = self.rows.write();
        match rows.iter_mut().find(|r| r.id == row.id) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
    }

    /// Remove a row by id, returning whether it existed
    pub fn remove(&self, id: u64) -> bool {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|r| r.id != id);
        rows.len() != before
    }
}

#[async_trait]
impl ServerStore for MemoryStore {
    async fn load_servers(&self) -> Result<Vec<ServerConfig>, StoreError> {
        let rows = self.rows.read().clone();
        validate_rows(&rows)?;
        Ok(rows)
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
