//! JSON file storage area.
//!
//! The whole area is one JSON object on disk. Writes go to a sibling temp
//! file, are synced, then renamed over the original, so a crash mid-write
//! leaves the previous contents intact.

use std::path::{Path, PathBuf};

use aegis_core::{StorageArea, StorageError, StorageKeys, StorageMap};
use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

use super::{DEFAULT_QUOTA_BYTES, check_quota, select, usage};

/// File-backed storage implementation.
pub struct FileStorage {
    path: PathBuf,
    quota: Option<usize>,
    items: Mutex<StorageMap>,
}

impl FileStorage {
    /// Open (or lazily create) the storage file at `path` with the default quota.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Self::open_with_quota(path, Some(DEFAULT_QUOTA_BYTES)).await
    }

    /// Open with a custom quota; `None` means unlimited.
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed.
    pub async fn open_with_quota(
        path: impl Into<PathBuf>,
        quota: Option<usize>,
    ) -> Result<Self, StorageError> {
        let path = path.into();
        let items = match fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => StorageMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StorageMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %path.display(), keys = items.len(), "opened storage file");

        Ok(Self {
            path,
            quota,
            items: Mutex::new(items),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_else(|| "storage.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn write_atomic(&self, items: &StorageMap) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let bytes = serde_json::to_vec_pretty(items)?;
        let tmp_path = self.temp_path();

        let mut tmp_file = fs::File::create(&tmp_path).await?;
        tmp_file.write_all(&bytes).await?;
        tmp_file.sync_all().await?;
        drop(tmp_file);

        fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl StorageArea for FileStorage {
    async fn get(&self, keys: &StorageKeys) -> Result<StorageMap, StorageError> {
        Ok(select(&*self.items.lock().await, keys))
    }

    async fn set(&self, new_items: StorageMap) -> Result<(), StorageError> {
        let mut items = self.items.lock().await;
        check_quota(&items, &new_items, self.quota)?;

        let mut next = items.clone();
        next.extend(new_items);
        self.write_atomic(&next).await?;
        *items = next;

        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), StorageError> {
        let mut items = self.items.lock().await;
        let mut next = items.clone();
        for key in keys {
            next.remove(key);
        }
        if next.len() == items.len() {
            return Ok(());
        }
        self.write_atomic(&next).await?;
        *items = next;

        Ok(())
    }

    async fn bytes_in_use(&self) -> Result<usize, StorageError> {
        usage(&*self.items.lock().await)
    }
}
