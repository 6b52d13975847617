use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::{
    StoreError,
    r#trait::BackingStore,
    types::{DeliveryLogEntry, ItemId, NoticeBatch, Priority, QueuedMessage, SuppressionEntry},
};

#[derive(Debug, Default)]
struct MemoryState {
    messages: HashMap<ItemId, QueuedMessage>,
    batches: HashMap<ItemId, NoticeBatch>,
    suppressions: Vec<SuppressionEntry>,
    log: Vec<DeliveryLogEntry>,
}

/// In-memory backing store implementation
///
/// Records live in `HashMap`s behind a single `RwLock`. Intended for tests
/// and for deployments where losing pending work on restart is acceptable.
///
/// # Capacity Management
/// An optional capacity bounds the number of pending mail items; inserts
/// beyond it fail. Batches, suppressions and log entries are not counted.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackingStore {
    state: Arc<RwLock<MemoryState>>,
    capacity: Option<usize>,
}

impl MemoryBackingStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::default(),
            capacity: Some(capacity),
        }
    }

    /// Number of stored mail items, in any tier
    ///
    /// Recovers gracefully if the lock is poisoned.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .messages
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[async_trait]
impl BackingStore for MemoryBackingStore {
    async fn insert_message(&self, message: &QueuedMessage) -> crate::Result<()> {
        let mut state = self.state.write()?;

        if state.messages.contains_key(&message.id) {
            return Err(StoreError::AlreadyExists(message.id.clone()));
        }

        if let Some(cap) = self.capacity
            && state.messages.len() >= cap
        {
            return Err(StoreError::Internal(format!(
                "Memory store capacity exceeded: {}/{cap} messages",
                state.messages.len()
            )));
        }

        state.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn read_message(&self, id: &ItemId) -> crate::Result<QueuedMessage> {
        self.state
            .read()?
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list_messages(&self, priority: Option<Priority>) -> crate::Result<Vec<QueuedMessage>> {
        let mut messages: Vec<_> = self
            .state
            .read()?
            .messages
            .values()
            .filter(|message| priority.is_none_or(|p| message.priority == p))
            .cloned()
            .collect();

        messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(messages)
    }

    async fn next_message(
        &self,
        priority: Priority,
        skip: &HashSet<ItemId>,
    ) -> crate::Result<Option<QueuedMessage>> {
        Ok(self
            .state
            .read()?
            .messages
            .values()
            .filter(|message| message.priority == priority && !skip.contains(&message.id))
            .min_by(|a, b| a.order_key().cmp(&b.order_key()))
            .cloned())
    }

    async fn update_message(&self, message: &QueuedMessage) -> crate::Result<()> {
        let mut state = self.state.write()?;
        let stored = state
            .messages
            .get_mut(&message.id)
            .ok_or_else(|| StoreError::NotFound(message.id.clone()))?;
        *stored = message.clone();
        Ok(())
    }

    async fn delete_message(&self, id: &ItemId) -> crate::Result<()> {
        self.state
            .write()?
            .messages
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(())
    }

    async fn count_messages(&self, priority: Option<Priority>) -> crate::Result<usize> {
        Ok(self
            .state
            .read()?
            .messages
            .values()
            .filter(|message| priority.is_none_or(|p| message.priority == p))
            .count())
    }

    async fn insert_batch(&self, batch: &NoticeBatch) -> crate::Result<()> {
        let mut state = self.state.write()?;
        if state.batches.contains_key(&batch.id) {
            return Err(StoreError::AlreadyExists(batch.id.clone()));
        }
        state.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn list_batches(&self) -> crate::Result<Vec<NoticeBatch>> {
        let mut batches: Vec<_> = self.state.read()?.batches.values().cloned().collect();
        batches.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(batches)
    }

    async fn delete_batch(&self, id: &ItemId) -> crate::Result<()> {
        self.state
            .write()?
            .batches
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        Ok(())
    }

    async fn add_suppression(&self, entry: &SuppressionEntry) -> crate::Result<bool> {
        let mut state = self.state.write()?;
        if state
            .suppressions
            .iter()
            .any(|existing| existing.address == entry.address)
        {
            return Ok(false);
        }
        state.suppressions.push(entry.clone());
        Ok(true)
    }

    async fn is_suppressed(&self, address: &str) -> crate::Result<bool> {
        Ok(self
            .state
            .read()?
            .suppressions
            .iter()
            .any(|entry| entry.address == address))
    }

    async fn list_suppressions(&self) -> crate::Result<Vec<SuppressionEntry>> {
        Ok(self.state.read()?.suppressions.clone())
    }

    async fn append_log(&self, entry: &DeliveryLogEntry) -> crate::Result<()> {
        self.state.write()?.log.push(entry.clone());
        Ok(())
    }

    async fn read_log(&self) -> crate::Result<Vec<DeliveryLogEntry>> {
        Ok(self.state.read()?.log.clone())
    }
}
