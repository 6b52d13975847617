use std::{
    collections::{HashMap, HashSet},
    io::SeekFrom,
    path::{Component, Path, PathBuf},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use async_trait::async_trait;
use herald_common::internal;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};

use crate::{
    SerializationError, StoreError, ValidationError,
    r#trait::BackingStore,
    types::{DeliveryLogEntry, ItemId, NoticeBatch, Priority, QueuedMessage, SuppressionEntry},
};

const MESSAGES_DIR: &str = "messages";
const NOTICES_DIR: &str = "notices";
const SUPPRESSION_FILE: &str = "suppression.log";
const DELIVERY_LOG_FILE: &str = "delivery.log";

const TEMP_PREFIX: &str = ".tmp_";
const DELETED_SUFFIX: &str = ".deleted";

/// Length prefix of an appended record
const FRAME_HEADER: usize = 4;

/// Scheduling fields of one stored mail item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexEntry {
    priority: Priority,
    enqueued_at: SystemTime,
}

impl IndexEntry {
    const fn of(message: &QueuedMessage) -> Self {
        Self {
            priority: message.priority,
            enqueued_at: message.enqueued_at,
        }
    }
}

/// What this handle knows about the files under `messages/`
#[derive(Debug, Default)]
struct MessageIndex {
    entries: HashMap<ItemId, IndexEntry>,
}

impl MessageIndex {
    fn oldest(&self, priority: Priority, skip: &HashSet<ItemId>) -> Option<(ItemId, IndexEntry)> {
        self.entries
            .iter()
            .filter(|(id, entry)| entry.priority == priority && !skip.contains(*id))
            .min_by_key(|(id, entry)| (entry.enqueued_at, *id))
            .map(|(id, entry)| (id.clone(), *entry))
    }
}

/// Addresses read so far from `suppression.log`, and how far
#[derive(Debug, Default)]
struct SuppressionCache {
    addresses: HashSet<String>,
    offset: u64,
}

/// File-based backing store implementation
///
/// Layout under the configured root:
/// - `messages/{ulid}.bin`: one bincode-encoded mail item per file
/// - `notices/{ulid}.bin`: one bincode-encoded notice batch per file
/// - `suppression.log`, `delivery.log`: append-only, length-prefixed bincode records
///
/// # Atomicity
/// Item files are written to `.tmp_{ulid}.bin` and renamed into place, so a
/// reader never sees a partial record. Deletes rename to `{ulid}.bin.deleted`
/// before unlinking. `init()` removes leftovers of both from a crash.
///
/// Appended records are written with a single `write_all` on an `O_APPEND`
/// handle; a torn final frame is ignored when reading.
///
/// # Caching
/// Each handle keeps the priority and enqueue time of every mail item it has
/// seen, so `next_message` decodes only new files and the one it returns.
/// The chosen file is always re-read and checked against the index, and a
/// full listing rebuilds the index, so changes made through other handles
/// or processes are picked up. Suppression lookups read only the part of
/// `suppression.log` appended since the previous lookup.
#[derive(Debug, Clone)]
pub struct FileBackingStore {
    path: PathBuf,
    index: Arc<Mutex<MessageIndex>>,
    suppressions: Arc<Mutex<SuppressionCache>>,
}

impl Default for FileBackingStore {
    fn default() -> Self {
        Self::at(PathBuf::from("/var/spool/herald"))
    }
}

impl<'de> Deserialize<'de> for FileBackingStore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct FileBackingStoreHelper {
            path: PathBuf,
        }

        let helper = FileBackingStoreHelper::deserialize(deserializer)?;
        Self::new(helper.path).map_err(serde::de::Error::custom)
    }
}

impl FileBackingStore {
    /// Create a store rooted at `path`
    ///
    /// # Errors
    /// Returns a validation error if the path is relative, contains `..`, or
    /// points into a system directory.
    pub fn new(path: impl Into<PathBuf>) -> crate::Result<Self> {
        let path = path.into();
        Self::validate_path(&path)?;
        Ok(Self::at(path))
    }

    fn at(path: PathBuf) -> Self {
        Self {
            path,
            index: Arc::default(),
            suppressions: Arc::default(),
        }
    }

    fn validate_path(path: &Path) -> Result<(), ValidationError> {
        if path.components().any(|c| c == Component::ParentDir) {
            return Err(ValidationError::InvalidPath(format!(
                "store path cannot contain '..' components: {}",
                path.display()
            )));
        }

        if !path.is_absolute() {
            return Err(ValidationError::InvalidPath(format!(
                "store path must be absolute: {}",
                path.display()
            )));
        }

        let sensitive_prefixes = [
            "/etc", "/bin", "/sbin", "/usr/bin", "/usr/sbin", "/boot", "/sys", "/proc", "/dev",
        ];

        if let Some(prefix) = sensitive_prefixes.iter().find(|p| path.starts_with(p)) {
            return Err(ValidationError::InvalidPath(format!(
                "store path cannot be in system directory {prefix}: {}",
                path.display()
            )));
        }

        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory layout and clean up after an interrupted run
    ///
    /// # Errors
    /// - If a directory cannot be created
    /// - If the root exists but is not a directory
    pub fn init(&self) -> crate::Result<()> {
        internal!("Initialising store at {} ...", self.path.display());

        if self.path.try_exists()? && !self.path.is_dir() {
            return Err(ValidationError::NotDirectory(self.path.display().to_string()).into());
        }

        for dir in [MESSAGES_DIR, NOTICES_DIR] {
            let dir = self.path.join(dir);
            std::fs::create_dir_all(&dir)?;
            self.cleanup_orphans(&dir)?;
        }

        Ok(())
    }

    /// Remove `.tmp_` files from interrupted writes and `.deleted` files from
    /// interrupted deletes
    fn cleanup_orphans(&self, dir: &Path) -> crate::Result<()> {
        let mut cleaned = 0;

        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            if filename.starts_with(TEMP_PREFIX) || filename.ends_with(DELETED_SUFFIX) {
                std::fs::remove_file(entry.path())?;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            internal!(
                level = INFO,
                "Cleaned up {cleaned} orphaned files from {}",
                dir.display()
            );
        }

        Ok(())
    }

    fn item_path(&self, dir: &str, id: &ItemId) -> PathBuf {
        self.path.join(dir).join(id.filename())
    }

    async fn write_item<T: Serialize + Sync>(
        &self,
        dir: &str,
        id: &ItemId,
        value: &T,
    ) -> crate::Result<()> {
        let data = encode(value)?;
        let path = self.item_path(dir, id);
        let temp = self.path.join(dir).join(format!("{TEMP_PREFIX}{}", id.filename()));

        fs::write(&temp, &data).await?;
        fs::rename(&temp, &path).await?;

        Ok(())
    }

    async fn read_item<T: DeserializeOwned>(&self, dir: &str, id: &ItemId) -> crate::Result<T> {
        match fs::read(self.item_path(dir, id)).await {
            Ok(data) => decode(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_items<T: DeserializeOwned>(&self, dir: &str) -> crate::Result<Vec<T>> {
        let mut entries = fs::read_dir(self.path.join(dir)).await?;
        let mut items = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let filename = entry.file_name();
            let filename = filename.to_string_lossy();

            let Some(id) = ItemId::from_filename(&filename) else {
                continue;
            };

            match self.read_item(dir, &id).await {
                Ok(item) => items.push(item),
                // Removed between the directory scan and the read
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(items)
    }

    /// Ids of every complete item file in `dir`, without reading them
    async fn scan_ids(&self, dir: &str) -> crate::Result<Vec<ItemId>> {
        let mut entries = fs::read_dir(self.path.join(dir)).await?;
        let mut ids = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if let Some(id) = ItemId::from_filename(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }

        Ok(ids)
    }

    fn index_oldest(
        &self,
        priority: Priority,
        skip: &HashSet<ItemId>,
    ) -> crate::Result<Option<(ItemId, IndexEntry)>> {
        Ok(self.index.lock()?.oldest(priority, skip))
    }

    fn index_record(&self, message: &QueuedMessage) -> crate::Result<()> {
        self.index
            .lock()?
            .entries
            .insert(message.id.clone(), IndexEntry::of(message));
        Ok(())
    }

    fn index_forget(&self, id: &ItemId) -> crate::Result<()> {
        self.index.lock()?.entries.remove(id);
        Ok(())
    }

    fn index_replace(&self, messages: &[QueuedMessage]) -> crate::Result<()> {
        self.index.lock()?.entries = messages
            .iter()
            .map(|message| (message.id.clone(), IndexEntry::of(message)))
            .collect();
        Ok(())
    }

    /// Drop index entries whose file is gone and decode files not seen yet
    async fn sync_index(&self) -> crate::Result<()> {
        let on_disk: HashSet<ItemId> = self.scan_ids(MESSAGES_DIR).await?.into_iter().collect();

        let unseen: Vec<ItemId> = {
            let mut index = self.index.lock()?;
            index.entries.retain(|id, _| on_disk.contains(id));
            on_disk
                .into_iter()
                .filter(|id| !index.entries.contains_key(id))
                .collect()
        };

        for id in unseen {
            match self.read_item::<QueuedMessage>(MESSAGES_DIR, &id).await {
                Ok(message) => self.index_record(&message)?,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// Read whatever was appended to `suppression.log` since the last call
    async fn refresh_suppressions(&self) -> crate::Result<()> {
        let mut file = match fs::File::open(self.path.join(SUPPRESSION_FILE)).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let offset = self.suppressions.lock()?.offset;
        let len = file.metadata().await?.len();
        if len == offset {
            return Ok(());
        }

        // Shorter than what was read before: the file was replaced
        let start = if len < offset { 0 } else { offset };
        file.seek(SeekFrom::Start(start)).await?;
        let mut data = Vec::new();
        file.read_to_end(&mut data).await?;

        // An incomplete last frame may still be being written; read it next time
        let (entries, consumed) = decode_frames::<SuppressionEntry>(&data)?;

        let mut cache = self.suppressions.lock()?;
        if start == 0 {
            cache.addresses.clear();
        }
        cache
            .addresses
            .extend(entries.into_iter().map(|entry| entry.address));
        cache.offset = start + consumed as u64;

        Ok(())
    }

    async fn exists(&self, dir: &str, id: &ItemId) -> crate::Result<bool> {
        Ok(fs::try_exists(self.item_path(dir, id)).await?)
    }

    async fn delete_item(&self, dir: &str, id: &ItemId) -> crate::Result<()> {
        let path = self.item_path(dir, id);
        let deleted = self
            .path
            .join(dir)
            .join(format!("{}{DELETED_SUFFIX}", id.filename()));

        match fs::rename(&path, &deleted).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(e) => return Err(e.into()),
        }

        fs::remove_file(&deleted).await?;
        Ok(())
    }

    async fn append_record<T: Serialize + Sync>(&self, file: &str, value: &T) -> crate::Result<()> {
        let data = encode(value)?;
        let len = u32::try_from(data.len()).map_err(|_| {
            SerializationError::Corrupted(format!("record of {} bytes is too large", data.len()))
        })?;

        let mut frame = Vec::with_capacity(FRAME_HEADER + data.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&data);

        let mut handle = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.join(file))
            .await?;
        handle.write_all(&frame).await?;
        handle.sync_data().await?;

        Ok(())
    }

    async fn read_records<T: DeserializeOwned>(&self, file: &str) -> crate::Result<Vec<T>> {
        let data = match fs::read(self.path.join(file)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let (records, consumed) = decode_frames(&data)?;

        if consumed < data.len() {
            internal!(
                level = WARN,
                "Ignoring {} trailing bytes of a torn record in {file}",
                data.len() - consumed
            );
        }

        Ok(records)
    }
}

/// Decode the complete length-prefixed frames at the start of `data`
///
/// Returns the records and how many bytes they took up.
fn decode_frames<T: DeserializeOwned>(data: &[u8]) -> crate::Result<(Vec<T>, usize)> {
    let mut records = Vec::new();
    let mut rest = data;

    while let Some((header, body)) = rest.split_first_chunk::<FRAME_HEADER>() {
        let len = u32::from_le_bytes(*header) as usize;
        if body.len() < len {
            break;
        }

        records.push(decode(&body[..len])?);
        rest = &body[len..];
    }

    Ok((records, data.len() - rest.len()))
}

fn encode<T: Serialize>(value: &T) -> crate::Result<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| SerializationError::from(e).into())
}

fn decode<T: DeserializeOwned>(data: &[u8]) -> crate::Result<T> {
    bincode::serde::decode_from_slice(data, bincode::config::standard())
        .map(|(value, _)| value)
        .map_err(|e| SerializationError::from(e).into())
}

#[async_trait]
impl BackingStore for FileBackingStore {
    async fn insert_message(&self, message: &QueuedMessage) -> crate::Result<()> {
        if self.exists(MESSAGES_DIR, &message.id).await? {
            return Err(StoreError::AlreadyExists(message.id.clone()));
        }

        self.write_item(MESSAGES_DIR, &message.id, message).await?;
        self.index_record(message)?;

        internal!(
            level = DEBUG,
            "Stored message {} ({})",
            message.id,
            message.priority
        );

        Ok(())
    }

    async fn read_message(&self, id: &ItemId) -> crate::Result<QueuedMessage> {
        self.read_item(MESSAGES_DIR, id).await
    }

    async fn list_messages(&self, priority: Option<Priority>) -> crate::Result<Vec<QueuedMessage>> {
        let mut messages: Vec<QueuedMessage> = self.list_items(MESSAGES_DIR).await?;
        self.index_replace(&messages)?;
        messages.retain(|message| priority.is_none_or(|p| message.priority == p));
        messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(messages)
    }

    async fn update_message(&self, message: &QueuedMessage) -> crate::Result<()> {
        if !self.exists(MESSAGES_DIR, &message.id).await? {
            return Err(StoreError::NotFound(message.id.clone()));
        }

        self.write_item(MESSAGES_DIR, &message.id, message).await?;
        self.index_record(message)
    }

    async fn next_message(
        &self,
        priority: Priority,
        skip: &HashSet<ItemId>,
    ) -> crate::Result<Option<QueuedMessage>> {
        self.sync_index().await?;

        loop {
            let Some((id, indexed)) = self.index_oldest(priority, skip)? else {
                return Ok(None);
            };

            match self.read_item::<QueuedMessage>(MESSAGES_DIR, &id).await {
                Ok(message) if IndexEntry::of(&message) == indexed => return Ok(Some(message)),
                // Rewritten elsewhere since it was indexed
                Ok(message) => self.index_record(&message)?,
                Err(StoreError::NotFound(_)) => self.index_forget(&id)?,
                Err(e) => return Err(e),
            }
        }
    }

    async fn delete_message(&self, id: &ItemId) -> crate::Result<()> {
        let deleted = self.delete_item(MESSAGES_DIR, id).await;
        self.index_forget(id)?;
        deleted
    }

    async fn insert_batch(&self, batch: &NoticeBatch) -> crate::Result<()> {
        if self.exists(NOTICES_DIR, &batch.id).await? {
            return Err(StoreError::AlreadyExists(batch.id.clone()));
        }

        self.write_item(NOTICES_DIR, &batch.id, batch).await
    }

    async fn list_batches(&self) -> crate::Result<Vec<NoticeBatch>> {
        let mut batches: Vec<NoticeBatch> = self.list_items(NOTICES_DIR).await?;
        batches.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(batches)
    }

    async fn delete_batch(&self, id: &ItemId) -> crate::Result<()> {
        self.delete_item(NOTICES_DIR, id).await
    }

    async fn add_suppression(&self, entry: &SuppressionEntry) -> crate::Result<bool> {
        if self.is_suppressed(&entry.address).await? {
            return Ok(false);
        }

        self.append_record(SUPPRESSION_FILE, entry).await?;
        Ok(true)
    }

    async fn is_suppressed(&self, address: &str) -> crate::Result<bool> {
        self.refresh_suppressions().await?;
        Ok(self.suppressions.lock()?.addresses.contains(address))
    }

    async fn list_suppressions(&self) -> crate::Result<Vec<SuppressionEntry>> {
        let mut entries: Vec<SuppressionEntry> = self.read_records(SUPPRESSION_FILE).await?;

        // Two processes may race on the same address; the first record wins
        let mut seen = std::collections::HashSet::new();
        entries.retain(|entry| seen.insert(entry.address.clone()));

        Ok(entries)
    }

    async fn append_log(&self, entry: &DeliveryLogEntry) -> crate::Result<()> {
        self.append_record(DELIVERY_LOG_FILE, entry).await
    }

    async fn read_log(&self) -> crate::Result<Vec<DeliveryLogEntry>> {
        self.read_records(DELIVERY_LOG_FILE).await
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_path_validation() {
        assert!(FileBackingStore::new("/var/spool/herald").is_ok());
        assert!(FileBackingStore::new("relative/path").is_err());
        assert!(FileBackingStore::new("/var/spool/../../etc").is_err());
        assert!(FileBackingStore::new("/etc/herald").is_err());
        assert!(FileBackingStore::new("/proc/self").is_err());
    }

    #[test]
    fn test_deserialize_validates_path() {
        let ok: Result<FileBackingStore, _> = ron::from_str(r#"(path: "/tmp/herald")"#);
        assert_eq!(ok.unwrap().path(), Path::new("/tmp/herald"));

        let bad: Result<FileBackingStore, _> = ron::from_str(r#"(path: "/dev/herald")"#);
        assert!(bad.is_err());
    }
}
