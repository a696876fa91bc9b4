//! Install / update lifecycle.
//!
//! Fresh installs get the default settings. Upgrades migrate the persisted
//! schema forward by re-writing settings through the typed model, which fills
//! fields added since the stored version with their defaults.

use aegis_core::{Settings, StorageArea, StorageKeys, StorageMap};
use serde::{Deserialize, Serialize};

use crate::store::{SCHEMA_VERSION, SCHEMA_VERSION_KEY, SessionStore, StoreError};

/// Storage key recording which build last ran against this storage.
pub const INSTALLED_VERSION_KEY: &str = "installedVersion";

/// Why the install hook fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum InstallReason {
    /// First run against empty storage.
    Install,
    /// The extension itself was upgraded.
    Update { previous_version: String },
    /// The browser was upgraded.
    ChromeUpdate,
    /// A shared module was upgraded.
    SharedModuleUpdate,
}

/// What the hook did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    Seeded,
    Migrated { from: u32, to: u32 },
    UpToDate,
    Skipped,
}

/// Work out which lifecycle event applies to this start, if any.
///
/// # Errors
/// Returns error if storage cannot be read.
pub async fn detect_install_reason<S: StorageArea>(
    store: &SessionStore<S>,
    current_version: &str,
) -> Result<Option<InstallReason>, StoreError> {
    let stored = store.get(&StorageKeys::All).await?;
    if stored.is_empty() {
        return Ok(Some(InstallReason::Install));
    }

    match stored.get(INSTALLED_VERSION_KEY).and_then(|v| v.as_str()) {
        Some(previous) if previous == current_version => Ok(None),
        Some(previous) => Ok(Some(InstallReason::Update {
            previous_version: previous.to_owned(),
        })),
        None => Ok(Some(InstallReason::Update {
            previous_version: "unknown".to_owned(),
        })),
    }
}

/// Run the install hook.
///
/// # Errors
/// Returns error if storage cannot be read or written.
pub async fn on_installed<S: StorageArea>(
    store: &SessionStore<S>,
    reason: &InstallReason,
    current_version: &str,
) -> Result<InstallOutcome, StoreError> {
    let outcome = match reason {
        InstallReason::Install => {
            tracing::info!(version = current_version, "first install; seeding default settings");
            store.replace_settings(Settings::default()).await?;
            InstallOutcome::Seeded
        }
        InstallReason::Update { previous_version } => {
            tracing::info!(
                from = %previous_version,
                to = current_version,
                "extension updated"
            );
            migrate(store).await?
        }
        InstallReason::ChromeUpdate | InstallReason::SharedModuleUpdate => {
            return Ok(InstallOutcome::Skipped);
        }
    };

    let mut record = StorageMap::new();
    record.insert(INSTALLED_VERSION_KEY.to_owned(), current_version.into());
    store.set(record).await?;

    Ok(outcome)
}

async fn migrate<S: StorageArea>(store: &SessionStore<S>) -> Result<InstallOutcome, StoreError> {
    let stored = store.get(&StorageKeys::from(SCHEMA_VERSION_KEY)).await?;
    let from = stored
        .get(SCHEMA_VERSION_KEY)
        .and_then(serde_json::Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0);

    if from == SCHEMA_VERSION {
        return Ok(InstallOutcome::UpToDate);
    }
    if from > SCHEMA_VERSION {
        tracing::warn!(
            stored = from,
            supported = SCHEMA_VERSION,
            "storage written by a newer schema; leaving it untouched"
        );
        return Ok(InstallOutcome::UpToDate);
    }

    tracing::info!(from, to = SCHEMA_VERSION, "migrating persisted schema");
    store.replace_settings(store.settings().await).await?;
    Ok(InstallOutcome::Migrated {
        from,
        to: SCHEMA_VERSION,
    })
}
