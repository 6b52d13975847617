//! Priority mail queue over a [`BackingStore`]

use std::{collections::HashSet, sync::Arc, time::SystemTime};

use herald_common::{audit, internal};

use crate::{
    Result, StoreError,
    r#trait::BackingStore,
    types::{ItemId, OutgoingMessage, Priority, QueuedMessage},
};

/// Producer and operator view of the mail queue
///
/// Cheap to clone; every clone shares the same store.
#[derive(Debug, Clone)]
pub struct MessageQueue {
    store: Arc<dyn BackingStore>,
}

impl MessageQueue {
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    /// Store a message in `priority` with `enqueued_at = now`
    ///
    /// No deduplication: enqueueing the same message twice stores two items.
    ///
    /// # Errors
    /// `InvalidState` when asked to enqueue straight into `Deferred`, or a
    /// store failure.
    pub async fn enqueue(&self, message: OutgoingMessage, priority: Priority) -> Result<ItemId> {
        self.enqueue_at(message, priority, SystemTime::now()).await
    }

    /// Store a message with an explicit enqueue time, e.g. when importing
    ///
    /// # Errors
    /// See [`MessageQueue::enqueue`].
    pub async fn enqueue_at(
        &self,
        message: OutgoingMessage,
        priority: Priority,
        enqueued_at: SystemTime,
    ) -> Result<ItemId> {
        if !priority.is_scheduled() {
            return Err(StoreError::InvalidState(
                "messages cannot be enqueued as deferred".to_string(),
            ));
        }

        let item = QueuedMessage::new(message, priority, enqueued_at);
        self.store.insert_message(&item).await?;

        audit::log_enqueued(
            &item.id.to_string(),
            &item.from_address,
            &item.to_address,
            priority.as_str(),
        );

        Ok(item.id)
    }

    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn count(&self, priority: Priority) -> Result<usize> {
        self.store.count_messages(Some(priority)).await
    }

    /// Items the scheduler may still yield (every tier but `Deferred`)
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn eligible(&self) -> Result<usize> {
        let mut total = 0;
        for priority in Priority::SCHEDULED {
            total += self.count(priority).await?;
        }
        Ok(total)
    }

    /// Items of one tier, oldest first
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn iterate(&self, priority: Priority) -> Result<Vec<QueuedMessage>> {
        self.store.list_messages(Some(priority)).await
    }

    /// Oldest item of one tier that is not in `skip`
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn next_in(
        &self,
        priority: Priority,
        skip: &HashSet<ItemId>,
    ) -> Result<Option<QueuedMessage>> {
        self.store.next_message(priority, skip).await
    }

    /// Every stored item regardless of tier
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn all(&self) -> Result<Vec<QueuedMessage>> {
        self.store.list_messages(None).await
    }

    /// # Errors
    /// `NotFound` if the item does not exist.
    pub async fn get(&self, id: &ItemId) -> Result<QueuedMessage> {
        self.store.read_message(id).await
    }

    /// Remove an item after it was delivered or suppressed
    ///
    /// # Errors
    /// `NotFound` if the item does not exist.
    pub async fn delete(&self, id: &ItemId) -> Result<()> {
        self.store.delete_message(id).await
    }

    /// Move an item to `Deferred`, leaving every other field untouched
    ///
    /// Returns the item as stored afterwards.
    ///
    /// # Errors
    /// `NotFound` if the item does not exist.
    pub async fn demote(&self, id: &ItemId) -> Result<QueuedMessage> {
        let mut item = self.store.read_message(id).await?;
        item.priority = Priority::Deferred;
        self.store.update_message(&item).await?;

        internal!(level = DEBUG, "Deferred message {id}");

        Ok(item)
    }

    /// Move a deferred item back into `priority`
    ///
    /// Returns `false` without touching the item if it is not deferred.
    ///
    /// # Errors
    /// `InvalidState` if `priority` is `Deferred`, `NotFound` if the item does
    /// not exist.
    pub async fn promote(&self, id: &ItemId, priority: Priority) -> Result<bool> {
        if !priority.is_scheduled() {
            return Err(StoreError::InvalidState(
                "cannot promote into the deferred tier".to_string(),
            ));
        }

        let mut item = self.store.read_message(id).await?;
        if item.priority != Priority::Deferred {
            return Ok(false);
        }

        item.priority = priority;
        self.store.update_message(&item).await?;

        audit::log_promoted(&id.to_string(), priority.as_str());

        Ok(true)
    }

    /// Promote every deferred item into `priority`; returns how many moved
    ///
    /// Running it again with nothing deferred is a no-op.
    ///
    /// # Errors
    /// `InvalidState` if `priority` is `Deferred`, or a store failure.
    pub async fn retry_deferred(&self, priority: Priority) -> Result<usize> {
        let mut promoted = 0;

        for item in self.iterate(Priority::Deferred).await? {
            match self.promote(&item.id, priority).await {
                Ok(true) => promoted += 1,
                Ok(false) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        internal!(
            level = INFO,
            "Promoted {promoted} deferred messages to {priority}"
        );

        Ok(promoted)
    }
}
