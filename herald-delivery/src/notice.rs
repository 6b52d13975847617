//! Notice-batch drain worker and notice dispatch

use std::{collections::HashMap, fmt::Write as _, sync::Arc, time::Duration};

use async_trait::async_trait;
use herald_common::{internal, outgoing};
use herald_store::{
    BackingStore, MessageQueue, Notice, NoticeQueue, OutgoingMessage, Priority, UserId,
    decode_notices,
};
use tokio::time::Instant;

use crate::{
    error::DeliveryError,
    lock::DrainLock,
    scheduler::FifoScheduler,
    summary::{CycleOutcome, DrainSummary, QueueKind},
    worker::{begin_cycle, finish_cycle},
};

/// Result of dispatching one notice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeOutcome {
    Sent,
    /// Nothing to do for this recipient, e.g. no address on file
    Skipped,
    /// Retry the whole batch on a later cycle
    Transient(String),
    /// Abort the cycle
    Permanent(String),
}

#[async_trait]
pub trait NoticeDispatcher: Send + Sync + std::fmt::Debug {
    async fn dispatch(&self, notice: &Notice) -> NoticeOutcome;
}

/// Resolves a user to the address notices are mailed to
pub trait RecipientDirectory: Send + Sync + std::fmt::Debug {
    fn email_for(&self, user: UserId) -> Option<String>;
}

/// Fixed user-to-address table, typically loaded from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    addresses: HashMap<UserId, String>,
}

impl StaticDirectory {
    pub fn new(addresses: impl IntoIterator<Item = (UserId, String)>) -> Self {
        Self {
            addresses: addresses.into_iter().collect(),
        }
    }
}

impl RecipientDirectory for StaticDirectory {
    fn email_for(&self, user: UserId) -> Option<String> {
        self.addresses
            .get(&user)
            .filter(|address| !address.trim().is_empty())
            .cloned()
    }
}

/// Subject and body for a notice mail
///
/// `subject` and `body` context keys win; otherwise the label names the
/// notice and the remaining context becomes `key: value` lines.
#[must_use]
pub fn render_notice(notice: &Notice) -> (String, String) {
    let subject = notice
        .context
        .get("subject")
        .cloned()
        .unwrap_or_else(|| notice.label.replace('_', " "));

    let body = notice.context.get("body").cloned().unwrap_or_else(|| {
        let mut body = format!("{}\n", notice.label);
        for (key, value) in notice.context.iter().filter(|(key, _)| *key != "subject") {
            let _ = writeln!(body, "{key}: {value}");
        }
        body
    });

    (subject, body)
}

/// Turns each notice into a mail item on the mail queue
#[derive(Debug, Clone)]
pub struct MailNoticeDispatcher {
    directory: Arc<dyn RecipientDirectory>,
    mail: MessageQueue,
    from_address: String,
    priority: Priority,
}

impl MailNoticeDispatcher {
    pub fn new(
        directory: Arc<dyn RecipientDirectory>,
        mail: MessageQueue,
        from_address: impl Into<String>,
    ) -> Self {
        Self {
            directory,
            mail,
            from_address: from_address.into(),
            priority: Priority::Medium,
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl NoticeDispatcher for MailNoticeDispatcher {
    async fn dispatch(&self, notice: &Notice) -> NoticeOutcome {
        let Some(address) = self.directory.email_for(notice.recipient) else {
            internal!(
                level = DEBUG,
                "No address for user {}, skipping {}",
                notice.recipient,
                notice.label
            );
            return NoticeOutcome::Skipped;
        };

        let (subject, body) = render_notice(notice);
        let message = OutgoingMessage::new(address, self.from_address.clone(), subject, body);

        match self.mail.enqueue(message, self.priority).await {
            Ok(id) => {
                outgoing!(
                    "Notice {} for user {} queued as {id} (on_site={})",
                    notice.label,
                    notice.recipient,
                    notice.on_site
                );
                NoticeOutcome::Sent
            }
            Err(e) => NoticeOutcome::Permanent(format!("cannot queue notice mail: {e}")),
        }
    }
}

/// Drains notice batches oldest first under the `send_notices` lock
///
/// A batch is deleted only after every notice in it was dispatched. A
/// transient failure leaves the batch in place for a later cycle, so notices
/// dispatched before the failure are dispatched again then.
#[derive(Debug)]
pub struct NoticeWorker {
    queue: NoticeQueue,
    dispatcher: Arc<dyn NoticeDispatcher>,
    lock: DrainLock,
    lock_wait: Duration,
}

impl NoticeWorker {
    pub fn new(
        store: Arc<dyn BackingStore>,
        dispatcher: Arc<dyn NoticeDispatcher>,
        lock: DrainLock,
    ) -> Self {
        Self {
            queue: NoticeQueue::new(store),
            dispatcher,
            lock,
            lock_wait: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    #[must_use]
    pub const fn queue(&self) -> &NoticeQueue {
        &self.queue
    }

    /// Run one drain cycle over every pending batch
    ///
    /// # Errors
    /// An undecodable batch, a permanent dispatch failure or a store failure
    /// aborts the cycle; the offending batch stays stored.
    #[tracing::instrument(level = "debug", skip_all, fields(queue = "notices"))]
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, DeliveryError> {
        if !begin_cycle(&mut self.lock, self.lock_wait, QueueKind::Notices).await? {
            return Ok(CycleOutcome::Skipped);
        }

        let started = Instant::now();
        let mut summary = DrainSummary::new(QueueKind::Notices);
        let result = self.drain(&mut summary).await;

        finish_cycle(&mut self.lock, summary, started, result)
    }

    async fn drain(&self, summary: &mut DrainSummary) -> Result<(), DeliveryError> {
        if let Some(metrics) = herald_metrics::metrics() {
            metrics
                .queue
                .set_pending(QueueKind::Notices.as_str(), self.queue.count().await? as u64);
        }

        let mut scheduler = FifoScheduler::new();

        'batches: while let Some(batch) = scheduler.next(&self.queue).await? {
            let notices = decode_notices(&batch.payload).map_err(|source| DeliveryError::Codec {
                id: batch.id.clone(),
                source,
            })?;

            for notice in &notices {
                match self.dispatcher.dispatch(notice).await {
                    NoticeOutcome::Sent => summary.delivered += 1,
                    NoticeOutcome::Skipped => summary.skipped += 1,
                    NoticeOutcome::Transient(detail) => {
                        internal!(
                            level = WARN,
                            "Leaving notice batch {} for a later cycle: {detail}",
                            batch.id
                        );
                        summary.deferred += 1;
                        continue 'batches;
                    }
                    NoticeOutcome::Permanent(detail) => {
                        return Err(DeliveryError::Permanent {
                            id: batch.id,
                            detail,
                        });
                    }
                }
            }

            self.queue.delete(&batch.id).await?;
            summary.batches += 1;
        }

        Ok(())
    }
}
