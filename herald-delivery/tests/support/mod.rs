//! Scripted transports and dispatchers for drain-cycle tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use herald_delivery::{
    DeliveryOutcome, DrainLock, MailWorker, NoticeDispatcher, NoticeOutcome, NoticeWorker,
    QueueKind, Transport,
};
use herald_store::{
    BackingStore, ItemId, MemoryBackingStore, MessageQueue, Notice, OutgoingMessage, Priority,
    QueuedMessage,
};
use tempfile::TempDir;

/// Transport whose outcome is chosen per recipient; everything else succeeds
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    outcomes: Mutex<HashMap<String, DeliveryOutcome>>,
    calls: Mutex<Vec<QueuedMessage>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, recipient: &str, outcome: DeliveryOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(recipient.to_string(), outcome);
    }

    pub fn clear(&self, recipient: &str) {
        self.outcomes.lock().unwrap().remove(recipient);
    }

    pub fn calls(&self) -> Vec<QueuedMessage> {
        self.calls.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.calls().into_iter().map(|m| m.subject).collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn deliver(&self, message: &QueuedMessage) -> DeliveryOutcome {
        self.calls.lock().unwrap().push(message.clone());
        self.outcomes
            .lock()
            .unwrap()
            .get(&message.to_address)
            .cloned()
            .unwrap_or(DeliveryOutcome::Delivered)
    }
}

/// Dispatcher that records notices and fails on scripted labels
#[derive(Debug, Default)]
pub struct RecordingDispatcher {
    outcomes: Mutex<HashMap<String, NoticeOutcome>>,
    seen: Mutex<Vec<Notice>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, label: &str, outcome: NoticeOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(label.to_string(), outcome);
    }

    pub fn clear(&self, label: &str) {
        self.outcomes.lock().unwrap().remove(label);
    }

    pub fn labels(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.label.clone())
            .collect()
    }
}

#[async_trait]
impl NoticeDispatcher for RecordingDispatcher {
    async fn dispatch(&self, notice: &Notice) -> NoticeOutcome {
        self.seen.lock().unwrap().push(notice.clone());
        self.outcomes
            .lock()
            .unwrap()
            .get(&notice.label)
            .cloned()
            .unwrap_or(NoticeOutcome::Sent)
    }
}

/// In-memory store plus a private lock directory
pub struct Harness {
    pub store: Arc<dyn BackingStore>,
    pub queue: MessageQueue,
    pub locks: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        let store: Arc<dyn BackingStore> = Arc::new(MemoryBackingStore::new());
        Self {
            queue: MessageQueue::new(store.clone()),
            store,
            locks: tempfile::tempdir().unwrap(),
        }
    }

    pub fn lock(&self, name: &str) -> DrainLock {
        DrainLock::new(self.locks.path(), name)
    }

    pub fn mail_worker(&self, transport: Arc<dyn Transport>) -> MailWorker {
        MailWorker::new(self.store.clone(), transport, self.lock(QueueKind::Mail.lock_name()))
    }

    pub fn notice_worker(&self, dispatcher: Arc<dyn NoticeDispatcher>) -> NoticeWorker {
        NoticeWorker::new(
            self.store.clone(),
            dispatcher,
            self.lock(QueueKind::Notices.lock_name()),
        )
    }

    /// Enqueue a message whose subject names it, at `UNIX_EPOCH + secs`
    pub async fn add(&self, subject: &str, to: &str, priority: Priority, secs: u64) -> ItemId {
        self.queue
            .enqueue_at(
                OutgoingMessage::new(to, "herald@example.com", subject, "body"),
                priority,
                at(secs),
            )
            .await
            .unwrap()
    }
}

pub fn at(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}
