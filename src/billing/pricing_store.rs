//! Pricing table storage.
//!
//! Persists the price tables to disk at `{data_dir}/pricing.json`.
//! Request paths only read snapshots; admin updates go through `replace`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::pricing::PricingTable;

/// In-memory pricing tables with disk persistence.
#[derive(Debug)]
pub struct PricingStore {
    table: RwLock<PricingTable>,
    storage_path: PathBuf,
}

impl PricingStore {
    /// Create a new pricing store, loading from disk if available.
    ///
    /// A missing or unreadable file yields empty tables; built-in model prices
    /// and the fallback price still apply.
    pub async fn new(storage_path: PathBuf) -> Self {
        let table = if storage_path.exists() {
            match Self::load_from_path(&storage_path) {
                Ok(t) => {
                    tracing::info!("Loaded pricing from {}", storage_path.display());
                    t
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to load pricing from {}: {}, using built-in prices",
                        storage_path.display(),
                        e
                    );
                    PricingTable::default()
                }
            }
        } else {
            tracing::info!(
                "No pricing file found at {}, using built-in prices",
                storage_path.display()
            );
            PricingTable::default()
        };

        Self {
            table: RwLock::new(table),
            storage_path,
        }
    }

    /// Store that never touches disk. Used by tests.
    pub fn in_memory(table: PricingTable) -> Self {
        Self {
            table: RwLock::new(table),
            storage_path: PathBuf::new(),
        }
    }

    fn load_from_path(path: &Path) -> Result<PricingTable, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    async fn save_to_disk(&self) -> Result<(), std::io::Error> {
        if self.storage_path.as_os_str().is_empty() {
            return Ok(());
        }
        let table = self.table.read().await;

        if let Some(parent) = self.storage_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(&*table)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        std::fs::write(&self.storage_path, contents)?;
        tracing::debug!("Saved pricing to {}", self.storage_path.display());
        Ok(())
    }

    /// Clone of the current tables.
    pub async fn snapshot(&self) -> PricingTable {
        self.table.read().await.clone()
    }

    /// Replace all tables at once and persist them.
    pub async fn replace(&self, new_table: PricingTable) -> Result<(), std::io::Error> {
        let mut table = self.table.write().await;
        *table = new_table;
        drop(table);
        self.save_to_disk().await?;
        tracing::info!("Pricing tables updated");
        Ok(())
    }
}

/// Shared pricing store wrapped in Arc for concurrent access.
pub type SharedPricingStore = Arc<PricingStore>;
