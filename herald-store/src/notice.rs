//! Notice-batch digest queue and its payload encoding
//!
//! A batch payload is a versioned JSON document:
//!
//! ```json
//! {"version": 1, "notices": [{"recipient": 7, "label": "friend_request",
//!   "context": {"from": "alice"}, "on_site": true}]}
//! ```

use std::{sync::Arc, time::SystemTime};

use herald_common::internal;
use serde::{Deserialize, Serialize};

use crate::{
    Result, SerializationError,
    r#trait::BackingStore,
    types::{ItemId, Notice, NoticeBatch},
};

pub const PAYLOAD_VERSION: u32 = 1;

#[derive(Serialize)]
struct PayloadRef<'a> {
    version: u32,
    notices: &'a [Notice],
}

#[derive(Deserialize)]
struct Payload {
    version: u32,
    #[serde(default)]
    notices: Vec<Notice>,
}

/// Encode a notice list as a batch payload
///
/// # Errors
/// Returns an error if a notice cannot be represented as JSON.
pub fn encode_notices(notices: &[Notice]) -> Result<Vec<u8>> {
    serde_json::to_vec(&PayloadRef {
        version: PAYLOAD_VERSION,
        notices,
    })
    .map_err(|e| SerializationError::from(e).into())
}

/// Decode a batch payload
///
/// # Errors
/// Returns an error for malformed JSON or a version this build does not read.
pub fn decode_notices(payload: &[u8]) -> Result<Vec<Notice>> {
    let payload: Payload = serde_json::from_slice(payload).map_err(SerializationError::from)?;

    if payload.version != PAYLOAD_VERSION {
        return Err(SerializationError::UnsupportedVersion {
            found: payload.version,
            expected: PAYLOAD_VERSION,
        }
        .into());
    }

    Ok(payload.notices)
}

/// Producer and worker view of the notice-batch queue
#[derive(Debug, Clone)]
pub struct NoticeQueue {
    store: Arc<dyn BackingStore>,
}

impl NoticeQueue {
    pub fn new(store: Arc<dyn BackingStore>) -> Self {
        Self { store }
    }

    /// Store `notices` as one batch; an empty list stores nothing
    ///
    /// # Errors
    /// Returns an error if the payload cannot be encoded or stored.
    pub async fn enqueue(&self, notices: &[Notice]) -> Result<Option<ItemId>> {
        if notices.is_empty() {
            return Ok(None);
        }

        let batch = NoticeBatch {
            id: ItemId::generate(),
            created_at: SystemTime::now(),
            payload: encode_notices(notices)?,
        };
        self.store.insert_batch(&batch).await?;

        internal!(
            level = DEBUG,
            "Queued notice batch {} with {} notices",
            batch.id,
            notices.len()
        );

        Ok(Some(batch.id))
    }

    /// Pending batches in FIFO order
    ///
    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn batches(&self) -> Result<Vec<NoticeBatch>> {
        self.store.list_batches().await
    }

    /// # Errors
    /// Returns an error if the store cannot be read.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.store.list_batches().await?.len())
    }

    /// Remove a batch once every notice in it was dispatched
    ///
    /// # Errors
    /// `NotFound` if the batch does not exist.
    pub async fn delete(&self, id: &ItemId) -> Result<()> {
        self.store.delete_batch(id).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use std::collections::BTreeMap;

    use super::*;
    use crate::{StoreError, backends::MemoryBackingStore, types::UserId};

    fn notice(user: u64, label: &str) -> Notice {
        Notice {
            recipient: UserId(user),
            label: label.to_string(),
            context: BTreeMap::from([("from".to_string(), "alice".to_string())]),
            on_site: true,
        }
    }

    #[test]
    fn test_payload_is_versioned_json() {
        let payload = encode_notices(&[notice(7, "friend_request")]).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();

        assert_eq!(value["version"], 1);
        assert_eq!(value["notices"][0]["recipient"], 7);
        assert_eq!(value["notices"][0]["context"]["from"], "alice");
        assert_eq!(decode_notices(&payload).unwrap(), vec![notice(7, "friend_request")]);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let err = decode_notices(br#"{"version": 2, "notices": []}"#).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Serialization(SerializationError::UnsupportedVersion { found: 2, .. })
        ));
        assert!(decode_notices(b"\x80\x04pickle").is_err());
    }

    #[test]
    fn test_optional_fields_default() {
        let notices =
            decode_notices(br#"{"version": 1, "notices": [{"recipient": 3, "label": "x"}]}"#)
                .unwrap();
        assert!(notices[0].context.is_empty());
        assert!(!notices[0].on_site);
    }

    #[tokio::test]
    async fn test_batches_are_fifo() {
        let queue = NoticeQueue::new(Arc::new(MemoryBackingStore::new()));

        assert_eq!(queue.enqueue(&[]).await.unwrap(), None);

        let first = queue.enqueue(&[notice(1, "a")]).await.unwrap().unwrap();
        let second = queue.enqueue(&[notice(2, "b")]).await.unwrap().unwrap();

        let ids: Vec<_> = queue.batches().await.unwrap().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![first.clone(), second]);

        queue.delete(&first).await.unwrap();
        assert_eq!(queue.count().await.unwrap(), 1);
    }
}
