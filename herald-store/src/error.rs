//! Error types for the herald-store crate.

use std::io;

use thiserror::Error;

use crate::ItemId;

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed (file read/write/rename/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Work item or notice batch not found.
    #[error("Item not found: {0}")]
    NotFound(ItemId),

    #[error("Item already exists: {0}")]
    AlreadyExists(ItemId),

    /// Store directory or configuration failed validation.
    #[error("Store validation error: {0}")]
    Validation(#[from] ValidationError),

    /// The requested change is not allowed for the item's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Internal error (lock poisoning, capacity, etc.).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// Notice payload is not valid JSON or does not match the document shape.
    #[error("Notice payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Unsupported notice payload version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },

    /// Append-only record file is corrupted or truncated.
    #[error("Corrupted record data: {0}")]
    Corrupted(String),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Store path is not a directory: {0}")]
    NotDirectory(String),

    #[error("Invalid store path: {0}")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl<T> From<std::sync::PoisonError<T>> for StoreError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}
