//! Per-cycle ordering over pending work
//!
//! A scheduler is built fresh for every drain cycle and asks the store for
//! the next item each time, so work enqueued mid-cycle is seen at the next
//! step. It remembers what it already handed out and never yields an item
//! twice in one cycle.

use std::collections::HashSet;

use herald_store::{ItemId, MessageQueue, NoticeBatch, NoticeQueue, Priority, QueuedMessage};

/// Interleaved High / Medium / Low ordering for the mail queue
///
/// Every step re-checks the tiers from the top: all High items go first, then
/// a single Medium item before High is looked at again, and Low items only
/// while High and Medium are both empty. `Deferred` items are never yielded.
#[derive(Debug, Default)]
pub struct PriorityScheduler {
    yielded: HashSet<ItemId>,
}

impl PriorityScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The next item to process, or `None` when every tier is exhausted
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn next(&mut self, queue: &MessageQueue) -> herald_store::Result<Option<QueuedMessage>> {
        for priority in Priority::SCHEDULED {
            if let Some(message) = queue.next_in(priority, &self.yielded).await? {
                self.yielded.insert(message.id.clone());
                return Ok(Some(message));
            }
        }

        Ok(None)
    }

    /// Number of items handed out so far this cycle
    #[must_use]
    pub fn yielded(&self) -> usize {
        self.yielded.len()
    }
}

/// Oldest-first ordering for notice batches
#[derive(Debug, Default)]
pub struct FifoScheduler {
    yielded: HashSet<ItemId>,
}

impl FifoScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn next(&mut self, queue: &NoticeQueue) -> herald_store::Result<Option<NoticeBatch>> {
        let next = queue
            .batches()
            .await?
            .into_iter()
            .find(|batch| !self.yielded.contains(&batch.id));

        if let Some(batch) = &next {
            self.yielded.insert(batch.id.clone());
        }

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use std::{
        sync::Arc,
        time::{Duration, UNIX_EPOCH},
    };

    use herald_store::{MemoryBackingStore, OutgoingMessage};
    use pretty_assertions::assert_eq;

    use super::*;

    fn queue() -> MessageQueue {
        MessageQueue::new(Arc::new(MemoryBackingStore::new()))
    }

    async fn add(queue: &MessageQueue, subject: &str, priority: Priority, secs: u64) -> ItemId {
        queue
            .enqueue_at(
                OutgoingMessage::new("to@example.com", "from@example.com", subject, ""),
                priority,
                UNIX_EPOCH + Duration::from_secs(secs),
            )
            .await
            .unwrap()
    }

    /// Drain as a worker would: every yielded item leaves the queue
    async fn drain_order(queue: &MessageQueue) -> Vec<String> {
        let mut scheduler = PriorityScheduler::new();
        let mut order = Vec::new();
        while let Some(message) = scheduler.next(queue).await.unwrap() {
            queue.delete(&message.id).await.unwrap();
            order.push(message.subject);
        }
        order
    }

    #[tokio::test]
    async fn test_high_before_older_medium() {
        let queue = queue();
        add(&queue, "A", Priority::High, 1).await;
        add(&queue, "B", Priority::Medium, 0).await;
        add(&queue, "C", Priority::High, 2).await;

        assert_eq!(drain_order(&queue).await, vec!["A", "C", "B"]);
    }

    #[tokio::test]
    async fn test_low_only_after_medium() {
        let queue = queue();
        add(&queue, "low-old", Priority::Low, 0).await;
        add(&queue, "med-1", Priority::Medium, 5).await;
        add(&queue, "med-2", Priority::Medium, 6).await;
        add(&queue, "low-new", Priority::Low, 1).await;

        assert_eq!(
            drain_order(&queue).await,
            vec!["med-1", "med-2", "low-old", "low-new"]
        );
    }

    #[tokio::test]
    async fn test_late_high_preempts_after_current_item() {
        let queue = queue();
        add(&queue, "med-1", Priority::Medium, 0).await;
        add(&queue, "med-2", Priority::Medium, 1).await;

        let mut scheduler = PriorityScheduler::new();
        let first = scheduler.next(&queue).await.unwrap().unwrap();
        assert_eq!(first.subject, "med-1");
        queue.delete(&first.id).await.unwrap();

        add(&queue, "urgent", Priority::High, 99).await;

        let second = scheduler.next(&queue).await.unwrap().unwrap();
        assert_eq!(second.subject, "urgent");
    }

    #[tokio::test]
    async fn test_deferred_never_yielded() {
        let queue = queue();
        let id = add(&queue, "D", Priority::Medium, 0).await;
        queue.demote(&id).await.unwrap();

        let mut scheduler = PriorityScheduler::new();
        assert!(scheduler.next(&queue).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_item_yielded_twice() {
        let queue = queue();
        add(&queue, "stays", Priority::Low, 0).await;

        let mut scheduler = PriorityScheduler::new();
        assert!(scheduler.next(&queue).await.unwrap().is_some());
        // Not removed from the store, but already handed out this cycle
        assert!(scheduler.next(&queue).await.unwrap().is_none());
        assert_eq!(scheduler.yielded(), 1);
    }
}
