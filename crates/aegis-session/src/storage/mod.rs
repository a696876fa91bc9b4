//! Storage implementations.

use aegis_core::{StorageError, StorageMap};
use serde_json::Value;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "file")]
pub mod file;

#[cfg(feature = "memory")]
pub use memory::MemoryStorage;

#[cfg(feature = "file")]
pub use file::FileStorage;

/// Default quota: the browser's local storage area allows 10 MiB.
pub const DEFAULT_QUOTA_BYTES: usize = 10 * 1024 * 1024;

/// Bytes charged for one entry: key length plus serialized value length.
fn entry_bytes(key: &str, value: &Value) -> Result<usize, StorageError> {
    Ok(key.len() + serde_json::to_vec(value)?.len())
}

/// Bytes charged for a whole map.
pub(crate) fn usage(items: &StorageMap) -> Result<usize, StorageError> {
    items
        .iter()
        .try_fold(0usize, |total, (k, v)| Ok(total + entry_bytes(k, v)?))
}

/// Usage after `items` is written over `current`, rejecting it if it would
/// exceed `quota`.
pub(crate) fn check_quota(
    current: &StorageMap,
    items: &StorageMap,
    quota: Option<usize>,
) -> Result<usize, StorageError> {
    let mut projected = usage(current)?;
    for (key, value) in items {
        if let Some(old) = current.get(key) {
            projected = projected.saturating_sub(entry_bytes(key, old)?);
        }
        projected += entry_bytes(key, value)?;
    }

    match quota {
        Some(quota) if projected > quota => Err(StorageError::QuotaExceeded {
            required: projected,
            quota,
        }),
        _ => Ok(projected),
    }
}

/// Entries of `items` selected by `keys`.
pub(crate) fn select(items: &StorageMap, keys: &aegis_core::StorageKeys) -> StorageMap {
    items
        .iter()
        .filter(|(k, _)| keys.contains(k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
