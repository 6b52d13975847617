use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;

use crate::{
    backends::{FileBackingStore, MemoryBackingStore},
    r#trait::BackingStore,
};

/// Configuration for the backing store
///
/// # Examples
///
/// File-backed store in RON config:
/// ```ron
/// Herald (
///     store: File(
///         path: "/var/spool/herald",
///     ),
/// )
/// ```
///
/// Memory-backed store with a capacity limit:
/// ```ron
/// Herald (
///     store: Memory(
///         capacity: Some(1000),
///     ),
/// )
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub enum StoreConfig {
    /// File-based store (production)
    File { path: PathBuf },
    /// Memory-based store (testing/development)
    Memory {
        #[serde(default)]
        capacity: Option<usize>,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::File {
            path: FileBackingStore::default().path().to_path_buf(),
        }
    }
}

impl StoreConfig {
    /// Filesystem root for file-backed stores
    #[must_use]
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::File { path } => Some(path),
            Self::Memory { .. } => None,
        }
    }

    /// Validate, initialise and return the configured store
    ///
    /// # Errors
    /// Returns an error if the file store path is invalid or its directories
    /// cannot be prepared.
    pub fn open(&self) -> crate::Result<Arc<dyn BackingStore>> {
        match self {
            Self::File { path } => {
                let store = FileBackingStore::new(path.clone())?;
                store.init()?;
                Ok(Arc::new(store))
            }
            Self::Memory { capacity } => Ok(capacity.map_or_else(
                || Arc::new(MemoryBackingStore::new()) as Arc<dyn BackingStore>,
                |capacity| Arc::new(MemoryBackingStore::with_capacity(capacity)),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used, clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_parse_file_config() {
        let config: StoreConfig = ron::from_str(r#"File(path: "/var/spool/herald")"#).unwrap();
        assert_eq!(config.path(), Some(std::path::Path::new("/var/spool/herald")));
    }

    #[test]
    fn test_parse_memory_config() {
        let config: StoreConfig = ron::from_str("Memory(capacity: Some(5))").unwrap();
        assert_eq!(config, StoreConfig::Memory { capacity: Some(5) });
        assert!(config.path().is_none());
    }

    #[test]
    fn test_open_rejects_invalid_path() {
        let config = StoreConfig::File {
            path: PathBuf::from("/etc/herald"),
        };
        assert!(config.open().is_err());
    }

    #[test]
    fn test_open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::File {
            path: dir.path().join("store"),
        };

        config.open().unwrap();
        assert!(dir.path().join("store/messages").is_dir());
        assert!(dir.path().join("store/notices").is_dir());
    }
}
