//! In-memory storage area.

use std::sync::RwLock;

use aegis_core::{StorageArea, StorageError, StorageKeys, StorageMap};
use async_trait::async_trait;

use super::{DEFAULT_QUOTA_BYTES, check_quota, select, usage};

/// In-memory storage implementation.
///
/// Useful for tests and single-process hosts.
/// Data is lost on restart.
pub struct MemoryStorage {
    items: RwLock<StorageMap>,
    quota: Option<usize>,
}

impl MemoryStorage {
    /// Storage with the default 10 MiB quota.
    #[must_use]
    pub fn new() -> Self {
        Self::with_quota(Some(DEFAULT_QUOTA_BYTES))
    }

    /// Storage with a custom quota; `None` means unlimited.
    #[must_use]
    pub fn with_quota(quota: Option<usize>) -> Self {
        Self {
            items: RwLock::new(StorageMap::new()),
            quota,
        }
    }

    /// Storage pre-populated with `items`, as if left over from a previous run.
    #[must_use]
    pub fn with_items(items: StorageMap) -> Self {
        Self {
            items: RwLock::new(items),
            quota: Some(DEFAULT_QUOTA_BYTES),
        }
    }

    /// Copy of everything stored.
    ///
    /// # Errors
    /// Returns error if the lock is poisoned.
    pub fn dump(&self) -> Result<StorageMap, StorageError> {
        Ok(self
            .items
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?
            .clone())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageArea for MemoryStorage {
    async fn get(&self, keys: &StorageKeys) -> Result<StorageMap, StorageError> {
        let items = self
            .items
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        Ok(select(&items, keys))
    }

    async fn set(&self, new_items: StorageMap) -> Result<(), StorageError> {
        let mut items = self
            .items
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        check_quota(&items, &new_items, self.quota)?;
        items.extend(new_items);

        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut items = self
            .items
            .write()
            .map_err(|e| StorageError::Internal(e.to_string()))?;

        for key in keys {
            items.remove(key);
        }

        Ok(())
    }

    async fn bytes_in_use(&self) -> Result<usize, StorageError> {
        let items = self
            .items
            .read()
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        usage(&items)
    }
}
