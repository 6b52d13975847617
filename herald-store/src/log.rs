use std::{sync::Arc, time::SystemTime};

use crate::{
    Result,
    r#trait::BackingStore,
    types::{AttemptResult, DeliveryLogEntry, QueuedMessage},
};

/// Append-only record of every delivery attempt
#[derive(Debug, Clone)]
pub struct DeliveryLog {
    store: Arc<dyn BackingStore>,
}

impl DeliveryLog {
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    /// Record one attempt against a snapshot of `message`
    ///
    /// # Errors
    /// Returns an error if the entry cannot be stored.
    pub async fn record(
        &self,
        message: &QueuedMessage,
        result: AttemptResult,
        detail: impl Into<String> + Send,
    ) -> Result<DeliveryLogEntry> {
        let entry = DeliveryLogEntry {
            message: message.clone(),
            attempted_at: SystemTime::now(),
            result,
            detail: detail.into(),
        };
        self.store.append_log(&entry).await?;
        Ok(entry)
    }

    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn entries(&self) -> Result<Vec<DeliveryLogEntry>> {
        self.store.read_log().await
    }

    /// Entries with the given result, oldest first
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn entries_with(&self, result: AttemptResult) -> Result<Vec<DeliveryLogEntry>> {
        let mut entries = self.entries().await?;
        entries.retain(|entry| entry.result == result);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;
    use crate::{
        backends::MemoryBackingStore,
        types::{OutgoingMessage, Priority},
    };

    #[tokio::test]
    async fn test_entries_keep_insertion_order() {
        let log = DeliveryLog::new(Arc::new(MemoryBackingStore::new()));
        let message = QueuedMessage::new(
            OutgoingMessage::new("a@example.com", "b@example.com", "s", "b"),
            Priority::Medium,
            SystemTime::now(),
        );

        log.record(&message, AttemptResult::Failure, "timeout")
            .await
            .unwrap();
        log.record(&message, AttemptResult::Success, "").await.unwrap();

        let results: Vec<_> = log.entries().await.unwrap().iter().map(|e| e.result).collect();
        assert_eq!(results, vec![AttemptResult::Failure, AttemptResult::Success]);
        assert_eq!(
            log.entries_with(AttemptResult::Failure).await.unwrap()[0].detail,
            "timeout"
        );
    }
}
