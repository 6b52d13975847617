//! Long-running `Idle -> Draining -> Idle` loop around a drain worker

use std::time::Duration;

use async_trait::async_trait;
use herald_common::{Signal, internal};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::{
    error::DeliveryError,
    notice::NoticeWorker,
    summary::{CycleOutcome, QueueKind},
    worker::MailWorker,
};

/// A queue that can be polled for work and drained one cycle at a time
#[async_trait]
pub trait DrainQueue: Send {
    fn kind(&self) -> QueueKind;

    /// Entries a cycle started now would process
    async fn eligible(&self) -> Result<usize, DeliveryError>;

    async fn run_cycle(&mut self) -> Result<CycleOutcome, DeliveryError>;
}

#[async_trait]
impl DrainQueue for MailWorker {
    fn kind(&self) -> QueueKind {
        QueueKind::Mail
    }

    async fn eligible(&self) -> Result<usize, DeliveryError> {
        Ok(self.queue().eligible().await?)
    }

    async fn run_cycle(&mut self) -> Result<CycleOutcome, DeliveryError> {
        Self::run_cycle(self).await
    }
}

#[async_trait]
impl DrainQueue for NoticeWorker {
    fn kind(&self) -> QueueKind {
        QueueKind::Notices
    }

    async fn eligible(&self) -> Result<usize, DeliveryError> {
        Ok(self.queue().count().await?)
    }

    async fn run_cycle(&mut self) -> Result<CycleOutcome, DeliveryError> {
        Self::run_cycle(self).await
    }
}

/// Drives a [`DrainQueue`] until shutdown
///
/// While work is eligible, cycles run back to back. After a cycle that
/// retired nothing, or when the queue is empty, the loop sleeps for `idle`
/// before looking again. Cycle errors are logged and never end the loop.
#[derive(Debug)]
pub struct PollLoop<Q> {
    queue: Q,
    idle: Duration,
}

impl<Q: DrainQueue> PollLoop<Q> {
    pub const fn new(queue: Q, idle: Duration) -> Self {
        Self { queue, idle }
    }

    pub const fn queue(&self) -> &Q {
        &self.queue
    }

    /// Check for work and drain one cycle if there is any
    ///
    /// Returns whether the cycle retired anything, i.e. whether looking again
    /// straight away could find different work.
    pub async fn tick(&mut self) -> bool {
        let kind = self.queue.kind();

        match self.queue.eligible().await {
            Ok(0) => {
                internal!(level = TRACE, "{kind} queue is empty");
                false
            }
            Ok(pending) => {
                internal!(level = DEBUG, "{pending} {kind} entries pending, draining");
                match self.queue.run_cycle().await {
                    Ok(CycleOutcome::Completed(summary)) => summary.retired() > 0,
                    Ok(CycleOutcome::Skipped) => false,
                    Err(e) => {
                        tracing::error!(queue = kind.as_str(), "Drain cycle failed: {e}");
                        false
                    }
                }
            }
            Err(e) => {
                tracing::error!(queue = kind.as_str(), "Cannot inspect queue: {e}");
                false
            }
        }
    }

    /// Run until a shutdown signal arrives
    ///
    /// A cycle in progress always finishes; the signal is only observed
    /// between cycles and during the idle sleep.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn serve(mut self, mut shutdown: broadcast::Receiver<Signal>) {
        let kind = self.queue.kind();
        internal!("{kind} poll loop starting, idle interval {:?}", self.idle);

        loop {
            if self.tick().await {
                match shutdown.try_recv() {
                    Err(TryRecvError::Empty) => continue,
                    Ok(sig) => {
                        internal!("{kind} poll loop received {sig:?}");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("{kind} poll loop shutdown channel error: {e}");
                        break;
                    }
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.idle) => {}
                sig = shutdown.recv() => {
                    match sig {
                        Ok(sig) => internal!("{kind} poll loop received {sig:?}"),
                        Err(e) => tracing::error!("{kind} poll loop shutdown channel error: {e}"),
                    }
                    break;
                }
            }
        }

        internal!("{kind} poll loop stopped");
    }
}
