//! Drain workers for herald's outbound queues
//!
//! This crate provides:
//! - The per-queue exclusive drain lock
//! - Priority and FIFO scheduling over pending work
//! - Mail and notice workers that run one drain cycle at a time
//! - Transports the mail worker hands items to
//! - Producer helpers and the long-running poll loop

mod error;
pub mod lock;
mod mailer;
mod notice;
mod poll;
pub mod scheduler;
mod summary;
pub mod transport;
mod worker;

// Re-export error types
pub use error::{DeliveryError, LockError};
// Re-export core types
pub use lock::DrainLock;
pub use mailer::{Mailer, MailerConfig, Notifier, SendMode};
pub use notice::{
    MailNoticeDispatcher, NoticeDispatcher, NoticeOutcome, NoticeWorker, RecipientDirectory,
    StaticDirectory, render_notice,
};
pub use poll::{DrainQueue, PollLoop};
pub use scheduler::{FifoScheduler, PriorityScheduler};
pub use summary::{CycleOutcome, DrainSummary, QueueKind};
pub use transport::{DeliveryOutcome, Transport, TransportConfig};
pub use worker::MailWorker;
