//! Collaborator traits: key-value storage and page contexts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// JSON object used for storage reads and writes.
pub type StorageMap = Map<String, Value>;

/// Keys requested from storage.
///
/// Mirrors the browser storage API: a single key, a list, or `null`/absent for
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StorageKeys {
    One(String),
    Many(Vec<String>),
    #[default]
    All,
}

impl StorageKeys {
    #[must_use]
    pub fn many<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self::Many(keys.into_iter().map(Into::into).collect())
    }

    /// Whether `key` is selected.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        match self {
            Self::One(k) => k == key,
            Self::Many(keys) => keys.iter().any(|k| k == key),
            Self::All => true,
        }
    }

    /// `true` for an explicitly empty key list.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Many(keys) if keys.is_empty())
    }
}

impl From<&str> for StorageKeys {
    fn from(key: &str) -> Self {
        Self::One(key.to_owned())
    }
}

impl From<Vec<String>> for StorageKeys {
    fn from(keys: Vec<String>) -> Self {
        Self::Many(keys)
    }
}

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage quota exceeded: write needs {required} bytes, quota is {quota}")]
    QuotaExceeded { required: usize, quota: usize },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Extension-scoped key-value persistence.
///
/// Values are JSON; no schema is enforced at this layer. Each `set` either
/// lands completely or not at all.
#[async_trait]
pub trait StorageArea: Send + Sync {
    /// Read the selected keys. Missing keys are simply absent.
    async fn get(&self, keys: &StorageKeys) -> Result<StorageMap, StorageError>;

    /// Write every item, replacing existing values key by key.
    async fn set(&self, items: StorageMap) -> Result<(), StorageError>;

    /// Delete keys. Unknown keys are ignored.
    async fn remove(&self, keys: &[String]) -> Result<(), StorageError>;

    /// Serialized size of everything stored.
    async fn bytes_in_use(&self) -> Result<usize, StorageError>;
}

/// Page-context error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// The page closed, navigated away, or never had a content script.
    #[error("Context unreachable: {0}")]
    Unreachable(String),
    #[error("Extraction failed: {0}")]
    Extraction(String),
}

/// Capabilities exposed by a content script.
#[async_trait]
pub trait PageContext: Send + Sync {
    /// Visible text of the page.
    async fn extract_text(&self) -> Result<String, ContextError>;

    /// Absolute URLs of every link on the page.
    async fn extract_links(&self) -> Result<Vec<String>, ContextError>;
}
