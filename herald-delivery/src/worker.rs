//! Mail queue drain worker

use std::{sync::Arc, time::Duration};

use herald_common::{audit, internal};
use herald_store::{
    AttemptResult, BackingStore, DeliveryLog, MessageQueue, QueuedMessage, SuppressionList,
};
use tokio::time::Instant;
use tracing::{error, info};

use crate::{
    error::DeliveryError,
    lock::DrainLock,
    scheduler::PriorityScheduler,
    summary::{CycleOutcome, DrainSummary, QueueKind},
    transport::{DeliveryOutcome, Transport},
};

/// Take the drain lock for a cycle; `Ok(false)` means another holder won
pub(crate) async fn begin_cycle(
    lock: &mut DrainLock,
    wait: Duration,
    queue: QueueKind,
) -> Result<bool, DeliveryError> {
    match lock.acquire(wait).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_contended() => {
            internal!(level = DEBUG, "Skipping {queue} cycle: {e}");
            if let Some(metrics) = herald_metrics::metrics() {
                metrics.queue.record_skipped(queue.as_str());
            }
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Release the lock and report the cycle, whatever its result
pub(crate) fn finish_cycle(
    lock: &mut DrainLock,
    mut summary: DrainSummary,
    started: Instant,
    result: Result<(), DeliveryError>,
) -> Result<CycleOutcome, DeliveryError> {
    lock.release();
    summary.elapsed = started.elapsed();

    let queue = summary.queue.as_str();
    if let Some(metrics) = herald_metrics::metrics() {
        let metrics = &metrics.queue;
        metrics.record_delivered(queue, summary.delivered as u64);
        metrics.record_suppressed(queue, summary.suppressed as u64);
        metrics.record_deferred(queue, summary.deferred as u64);
        if result.is_ok() {
            metrics.record_cycle(queue, summary.elapsed.as_secs_f64());
        } else {
            metrics.record_aborted(queue);
        }
    }

    match result {
        Ok(()) => {
            info!(
                queue,
                delivered = summary.delivered,
                suppressed = summary.suppressed,
                deferred = summary.deferred,
                batches = summary.batches,
                elapsed_ms = summary.elapsed.as_millis(),
                "{summary}"
            );
            Ok(CycleOutcome::Completed(summary))
        }
        Err(e) => {
            error!(
                queue,
                delivered = summary.delivered,
                suppressed = summary.suppressed,
                deferred = summary.deferred,
                error = %e,
                "Aborted {queue} cycle: {summary}"
            );
            Err(e)
        }
    }
}

/// Drains the mail queue in priority order under the `send_mail` lock
#[derive(Debug)]
pub struct MailWorker {
    queue: MessageQueue,
    suppression: SuppressionList,
    log: DeliveryLog,
    transport: Arc<dyn Transport>,
    lock: DrainLock,
    lock_wait: Duration,
}

impl MailWorker {
    pub fn new(store: Arc<dyn BackingStore>, transport: Arc<dyn Transport>, lock: DrainLock) -> Self {
        Self {
            queue: MessageQueue::new(store.clone()),
            suppression: SuppressionList::new(store.clone()),
            log: DeliveryLog::new(store),
            transport,
            lock,
            lock_wait: Duration::ZERO,
        }
    }

    /// How long `run_cycle` waits for a contended lock (default: not at all)
    #[must_use]
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    #[must_use]
    pub const fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Run one drain cycle
    ///
    /// Returns `Skipped` when another process holds the lock. The lock is
    /// released before this returns, on success and on error alike.
    ///
    /// # Errors
    /// A permanent transport failure or a store failure aborts the cycle.
    /// Items processed before the failure keep their outcomes.
    #[tracing::instrument(level = "debug", skip_all, fields(queue = "mail"))]
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, DeliveryError> {
        if !begin_cycle(&mut self.lock, self.lock_wait, QueueKind::Mail).await? {
            return Ok(CycleOutcome::Skipped);
        }

        let started = Instant::now();
        let mut summary = DrainSummary::new(QueueKind::Mail);
        let result = self.drain(&mut summary).await;

        finish_cycle(&mut self.lock, summary, started, result)
    }

    async fn drain(&self, summary: &mut DrainSummary) -> Result<(), DeliveryError> {
        if let Some(metrics) = herald_metrics::metrics() {
            metrics
                .queue
                .set_pending(QueueKind::Mail.as_str(), self.queue.eligible().await? as u64);
        }

        let mut scheduler = PriorityScheduler::new();
        while let Some(message) = scheduler.next(&self.queue).await? {
            self.process(message, summary).await?;
        }

        Ok(())
    }

    async fn process(
        &self,
        message: QueuedMessage,
        summary: &mut DrainSummary,
    ) -> Result<(), DeliveryError> {
        let id = message.id.to_string();

        if self.suppression.contains(&message.to_address).await? {
            internal!(
                level = DEBUG,
                "Not sending {id}: {} is suppressed",
                message.to_address
            );
            self.log
                .record(&message, AttemptResult::Suppressed, "recipient is suppressed")
                .await?;
            self.queue.delete(&message.id).await?;
            audit::log_attempt(&id, &message.to_address, AttemptResult::Suppressed.as_str(), "");
            summary.suppressed += 1;
            return Ok(());
        }

        match self.transport.deliver(&message).await {
            DeliveryOutcome::Delivered => {
                self.log.record(&message, AttemptResult::Success, "").await?;
                self.queue.delete(&message.id).await?;
                audit::log_attempt(&id, &message.to_address, AttemptResult::Success.as_str(), "");
                summary.delivered += 1;
            }
            DeliveryOutcome::Transient(detail) => {
                internal!(level = INFO, "Deferring {id}: {detail}");
                let deferred = self.queue.demote(&message.id).await?;
                self.log
                    .record(&deferred, AttemptResult::Failure, detail.as_str())
                    .await?;
                audit::log_attempt(&id, &message.to_address, AttemptResult::Failure.as_str(), &detail);
                summary.deferred += 1;
            }
            DeliveryOutcome::Permanent(detail) => {
                return Err(DeliveryError::Permanent {
                    id: message.id,
                    detail,
                });
            }
        }

        Ok(())
    }
}
