pub mod backends;
pub mod config;
pub mod error;
pub mod log;
pub mod notice;
pub mod queue;
pub mod suppression;
pub mod r#trait;
pub mod types;

pub use backends::{FileBackingStore, MemoryBackingStore};
pub use config::StoreConfig;
pub use error::{Result, SerializationError, StoreError, ValidationError};
pub use log::DeliveryLog;
pub use notice::{NoticeQueue, decode_notices, encode_notices};
pub use queue::MessageQueue;
pub use suppression::{SuppressionList, normalize_address};
pub use r#trait::BackingStore;
pub use types::{
    AttemptResult, DeliveryLogEntry, ItemId, Notice, NoticeBatch, OutgoingMessage, Priority,
    QueuedMessage, SuppressionEntry, UserId,
};
