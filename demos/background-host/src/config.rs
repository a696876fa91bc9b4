//! Host configuration.

use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use serde::Deserialize;

/// Env var naming a JSON config file.
pub const CONFIG_ENV: &str = "AEGIS_CONFIG";
/// Env var overriding the storage path.
pub const STORAGE_PATH_ENV: &str = "AEGIS_STORAGE_PATH";

/// Background host settings. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Storage file; defaults to `<data dir>/aegis/storage.json`.
    pub storage_path: Option<PathBuf>,
    /// Storage quota in bytes; `null` for unlimited.
    pub quota_bytes: Option<usize>,
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_filter: String,
    /// Events replayed to late status subscribers.
    pub status_history: usize,
    /// Placeholder agent thinking time, in milliseconds.
    pub responder_delay_ms: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            storage_path: None,
            quota_bytes: Some(aegis_session::storage::DEFAULT_QUOTA_BYTES),
            log_filter: "info".to_owned(),
            status_history: aegis_core::status_feed::DEFAULT_HISTORY_LEN,
            responder_delay_ms: 1500,
        }
    }
}

impl HostConfig {
    /// Load from `AEGIS_CONFIG` (if set), then apply env overrides.
    ///
    /// # Errors
    /// Returns error if the named config file cannot be read or parsed.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(&PathBuf::from(path))?,
            None => Self::default(),
        };

        if let Some(path) = std::env::var_os(STORAGE_PATH_ENV) {
            config.storage_path = Some(PathBuf::from(path));
        }

        Ok(config)
    }

    fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    fn from_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Resolved storage file path.
    pub fn storage_path(&self) -> PathBuf {
        self.storage_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("aegis")
                .join("storage.json")
        })
    }

    pub const fn responder_delay(&self) -> Duration {
        Duration::from_millis(self.responder_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = HostConfig::from_json(r#"{ "log_filter": "debug" }"#).unwrap();
        assert_eq!(config.log_filter, "debug");
        assert_eq!(config.responder_delay(), Duration::from_millis(1500));
        assert!(config.quota_bytes.is_some());
    }

    #[test]
    fn test_unlimited_quota() {
        let config = HostConfig::from_json(r#"{ "quota_bytes": null }"#).unwrap();
        assert_eq!(config.quota_bytes, None);
    }

    #[test]
    fn test_explicit_storage_path() {
        let config = HostConfig::from_json(r#"{ "storage_path": "/tmp/aegis.json" }"#).unwrap();
        assert_eq!(config.storage_path(), PathBuf::from("/tmp/aegis.json"));
    }

    #[test]
    fn test_default_storage_path_ends_in_aegis() {
        let path = HostConfig::default().storage_path();
        assert!(path.ends_with("aegis/storage.json"));
    }
}
