//! Typed error handling for drain cycles.
//!
//! Transient delivery failures never surface here: they are recorded and the
//! item is deferred. What remains aborts the current cycle.

use std::{io, time::Duration};

use herald_store::{ItemId, StoreError, UserId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The work item store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The drain lock could not be taken for a reason other than contention.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// The transport reported a failure retrying cannot fix.
    #[error("Permanent failure delivering {id}: {detail}")]
    Permanent { id: ItemId, detail: String },

    /// A stored notice batch could not be decoded.
    #[error("Notice batch {id} could not be decoded: {source}")]
    Codec {
        id: ItemId,
        #[source]
        source: StoreError,
    },

    /// A notice sent outside the batch queue failed permanently.
    #[error("Notice {label} for user {user} failed: {detail}")]
    Dispatch {
        label: String,
        user: UserId,
        detail: String,
    },
}

impl DeliveryError {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. } | Self::Dispatch { .. })
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Another holder has the lock and the caller asked not to wait.
    #[error("Lock '{name}' is held by another process")]
    AlreadyLocked { name: String },

    /// The lock stayed held for the whole wait.
    #[error("Timed out after {waited:?} waiting for lock '{name}'")]
    Timeout { name: String, waited: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl LockError {
    /// Losing the race for the lock, as opposed to failing to lock at all
    #[must_use]
    pub const fn is_contended(&self) -> bool {
        matches!(self, Self::AlreadyLocked { .. } | Self::Timeout { .. })
    }
}
