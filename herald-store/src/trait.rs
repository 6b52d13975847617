use std::collections::HashSet;

use async_trait::async_trait;

use crate::{
    Result,
    types::{DeliveryLogEntry, ItemId, NoticeBatch, Priority, QueuedMessage, SuppressionEntry},
};

/// Persistence seam for every record herald keeps
///
/// Implementations only need single-record atomicity: at most one drain
/// worker mutates a queue at a time, guaranteed by the drain lock.
///
/// Listing methods return records in scheduling order, `(timestamp, id)`
/// ascending.
#[async_trait]
pub trait BackingStore: Send + Sync + std::fmt::Debug {
    /// Store a new mail item
    ///
    /// # Errors
    /// `AlreadyExists` if an item with the same id is stored, or a backend failure.
    async fn insert_message(&self, message: &QueuedMessage) -> Result<()>;

    /// # Errors
    /// `NotFound` if no item has this id.
    async fn read_message(&self, id: &ItemId) -> Result<QueuedMessage>;

    /// List stored mail items, optionally restricted to one tier
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read.
    async fn list_messages(&self, priority: Option<Priority>) -> Result<Vec<QueuedMessage>>;

    /// The oldest item of `priority` whose id is not in `skip`
    ///
    /// Drain cycles ask for this once per processed item. Backends that can
    /// answer without loading the whole tier should override it.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read.
    async fn next_message(
        &self,
        priority: Priority,
        skip: &HashSet<ItemId>,
    ) -> Result<Option<QueuedMessage>> {
        Ok(self
            .list_messages(Some(priority))
            .await?
            .into_iter()
            .find(|message| !skip.contains(&message.id)))
    }

    /// Replace a stored item with `message`, matched by id
    ///
    /// # Errors
    /// `NotFound` if no item has this id.
    async fn update_message(&self, message: &QueuedMessage) -> Result<()>;

    /// # Errors
    /// `NotFound` if no item has this id.
    async fn delete_message(&self, id: &ItemId) -> Result<()>;

    /// # Errors
    /// Returns an error if the backend cannot be read.
    async fn count_messages(&self, priority: Option<Priority>) -> Result<usize> {
        Ok(self.list_messages(priority).await?.len())
    }

    /// # Errors
    /// `AlreadyExists` if a batch with the same id is stored, or a backend failure.
    async fn insert_batch(&self, batch: &NoticeBatch) -> Result<()>;

    /// # Errors
    /// Returns an error if the backend cannot be read.
    async fn list_batches(&self) -> Result<Vec<NoticeBatch>>;

    /// # Errors
    /// `NotFound` if no batch has this id.
    async fn delete_batch(&self, id: &ItemId) -> Result<()>;

    /// Add an already normalized address; returns `false` if it was present
    ///
    /// # Errors
    /// Returns an error if the entry cannot be persisted.
    async fn add_suppression(&self, entry: &SuppressionEntry) -> Result<bool>;

    /// # Errors
    /// Returns an error if the backend cannot be read.
    async fn is_suppressed(&self, address: &str) -> Result<bool>;

    /// # Errors
    /// Returns an error if the backend cannot be read.
    async fn list_suppressions(&self) -> Result<Vec<SuppressionEntry>>;

    /// # Errors
    /// Returns an error if the entry cannot be persisted.
    async fn append_log(&self, entry: &DeliveryLogEntry) -> Result<()>;

    /// Every log entry in insertion order
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read.
    async fn read_log(&self) -> Result<Vec<DeliveryLogEntry>>;
}
