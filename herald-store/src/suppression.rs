use std::{sync::Arc, time::SystemTime};

use herald_common::audit;

use crate::{Result, r#trait::BackingStore, types::SuppressionEntry};

/// Canonical form used for every suppression comparison
#[must_use]
pub fn normalize_address(address: &str) -> String {
    address.trim().to_ascii_lowercase()
}

/// Addresses that must never be delivered to
///
/// Append-only: entries never expire and cannot be removed through this API.
#[derive(Debug, Clone)]
pub struct SuppressionList {
    store: Arc<dyn BackingStore>,
}

impl SuppressionList {
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    /// Suppress `address`; returns `false` if it was already suppressed
    ///
    /// # Errors
    /// Returns an error if the entry cannot be stored.
    pub async fn add(&self, address: &str) -> Result<bool> {
        let entry = SuppressionEntry {
            address: normalize_address(address),
            added_at: SystemTime::now(),
        };

        let added = self.store.add_suppression(&entry).await?;
        if added {
            audit::log_suppressed(&entry.address);
        }

        Ok(added)
    }

    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn contains(&self, address: &str) -> Result<bool> {
        self.store.is_suppressed(&normalize_address(address)).await
    }

    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn list(&self) -> Result<Vec<SuppressionEntry>> {
        self.store.list_suppressions().await
    }
}
