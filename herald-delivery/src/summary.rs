use std::{fmt, time::Duration};

/// Which queue a worker drains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Mail,
    Notices,
}

impl QueueKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mail => "mail",
            Self::Notices => "notices",
        }
    }

    /// Name of the drain lock guarding this queue
    #[must_use]
    pub const fn lock_name(self) -> &'static str {
        match self {
            Self::Mail => crate::lock::SEND_MAIL,
            Self::Notices => crate::lock::SEND_NOTICES,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counts reported at the end of a drain cycle
///
/// For the mail queue the counters are items. For the notice queue
/// `delivered` and `skipped` count notices while `batches` and `deferred`
/// count batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainSummary {
    pub queue: QueueKind,
    pub delivered: usize,
    pub suppressed: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub batches: usize,
    pub elapsed: Duration,
}

impl DrainSummary {
    #[must_use]
    pub const fn new(queue: QueueKind) -> Self {
        Self {
            queue,
            delivered: 0,
            suppressed: 0,
            deferred: 0,
            skipped: 0,
            batches: 0,
            elapsed: Duration::ZERO,
        }
    }

    /// How many entries left the eligible set during the cycle
    ///
    /// Zero means another cycle right away would find the same work.
    #[must_use]
    pub const fn retired(&self) -> usize {
        match self.queue {
            QueueKind::Mail => self.delivered + self.suppressed + self.deferred,
            QueueKind::Notices => self.batches,
        }
    }
}

impl fmt::Display for DrainSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.queue {
            QueueKind::Mail => write!(
                f,
                "{} sent; {} deferred; {} don't send",
                self.delivered, self.deferred, self.suppressed
            )?,
            QueueKind::Notices => write!(
                f,
                "{} batches, {} sent; {} batches deferred; {} without address",
                self.batches, self.delivered, self.deferred, self.skipped
            )?,
        }

        write!(f, "; done in {:.2} seconds", self.elapsed.as_secs_f64())
    }
}

/// What a call to `run_cycle` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another process holds the drain lock
    Skipped,
    Completed(DrainSummary),
}
