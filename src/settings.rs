//! File-backed ad-block settings.
//!
//! The file is rewritten in full after every mutation. Writes go to a
//! temporary sibling first and are renamed over the target, so a crash
//! mid-write leaves the previous file intact.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{AdBlockError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSettings {
    pub enabled: bool,
    pub total_blocked_requests: u64,
    pub blocked_requests_this_session: u64,
    pub whitelisted_domains: BTreeSet<String>,
}

impl Default for PersistedSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            total_blocked_requests: 0,
            blocked_requests_this_session: 0,
            whitelisted_domains: BTreeSet::new(),
        }
    }
}

/// How the settings were obtained at start-up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    /// No file existed; defaults were written.
    CreatedDefaults,
    /// The file was unreadable or corrupt; defaults were written over it.
    RecoveredFromCorruption,
}

#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the settings, falling back to defaults on absence or
    /// corruption and persisting them straight away. The session counter
    /// always starts at zero.
    pub async fn load(&self) -> (PersistedSettings, LoadOutcome) {
        let (mut settings, outcome) = match self.read().await {
            Ok(Some(settings)) => {
                info!(
                    "Loaded settings from {}: enabled={}, blocked={}, whitelist={}",
                    self.path.display(),
                    settings.enabled,
                    settings.total_blocked_requests,
                    settings.whitelisted_domains.len()
                );
                (settings, LoadOutcome::Loaded)
            }
            Ok(None) => {
                info!("No settings at {}, using defaults", self.path.display());
                (PersistedSettings::default(), LoadOutcome::CreatedDefaults)
            }
            Err(e) => {
                warn!("{}; using defaults", e);
                (PersistedSettings::default(), LoadOutcome::RecoveredFromCorruption)
            }
        };

        settings.blocked_requests_this_session = 0;

        if let Err(e) = self.save(&settings).await {
            warn!("Failed to persist settings after load: {}", e);
        }
        (settings, outcome)
    }

    async fn read(&self) -> Result<Option<PersistedSettings>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AdBlockError::persistence(&self.path, e)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| AdBlockError::persistence(&self.path, e))
    }

    /// Atomically replaces the settings file.
    pub async fn save(&self, settings: &PersistedSettings) -> Result<()> {
        let data = serde_json::to_vec_pretty(settings)
            .map_err(|e| AdBlockError::persistence(&self.path, e))?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| AdBlockError::persistence(dir, e))?;
        }

        let tmp = self.temp_path();
        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &self.path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(AdBlockError::persistence(&self.path, e));
        }

        debug!("Saved settings to {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let suffix: u32 = rand::thread_rng().r#gen();
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "settings".to_string());
        self.path.with_file_name(format!(".{name}.{suffix:08x}.tmp"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_settings_path(tag: &str) -> PathBuf {
        let suffix: u64 = rand::thread_rng().r#gen();
        std::env::temp_dir()
            .join(format!("ad-blocker-settings-{tag}-{suffix:x}"))
            .join("settings.json")
    }

    #[tokio::test]
    async fn test_missing_file_creates_defaults() {
        let path = temp_settings_path("missing");
        let store = SettingsStore::new(&path);

        let (settings, outcome) = store.load().await;
        assert_eq!(outcome, LoadOutcome::CreatedDefaults);
        assert_eq!(settings, PersistedSettings::default());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_replaced() {
        let path = temp_settings_path("corrupt");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"{ not json").unwrap();

        let store = SettingsStore::new(&path);
        let (settings, outcome) = store.load().await;
        assert_eq!(outcome, LoadOutcome::RecoveredFromCorruption);
        assert!(settings.enabled);

        let (_, outcome) = store.load().await;
        assert_eq!(outcome, LoadOutcome::Loaded);
    }

    #[tokio::test]
    async fn test_round_trip_resets_session_counter() {
        let path = temp_settings_path("roundtrip");
        let store = SettingsStore::new(&path);
        let saved = PersistedSettings {
            enabled: false,
            total_blocked_requests: 12,
            blocked_requests_this_session: 5,
            whitelisted_domains: ["example.com".to_string()].into_iter().collect(),
        };
        store.save(&saved).await.unwrap();

        let (loaded, outcome) = store.load().await;
        assert_eq!(outcome, LoadOutcome::Loaded);
        assert!(!loaded.enabled);
        assert_eq!(loaded.total_blocked_requests, 12);
        assert_eq!(loaded.blocked_requests_this_session, 0);
        assert!(loaded.whitelisted_domains.contains("example.com"));

        // no temp files left behind
        let entries = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(entries, 1);
    }
}
