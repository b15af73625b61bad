//! Configuration management for winecellar
//!
//! Application-wide settings live in `<root>/config.json`. They are loaded
//! through the `config` crate so that `WINECELLAR_*` environment variables can
//! override individual keys, and written back as pretty JSON on every change.

use crate::dxvk::{DxvkHudElement, DxvkLogLevel};
use crate::error::Result;
use crate::storage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

pub const DEFAULT_STEAM_INSTALLER_URL: &str =
    "https://cdn.cloudflare.steamstatic.com/client/installer/SteamSetup.exe";
pub const DEFAULT_WINETRICKS_URL: &str =
    "https://raw.githubusercontent.com/Winetricks/winetricks/master/src/winetricks";
pub const DEFAULT_DXVK_URL_TEMPLATE: &str =
    "https://github.com/doitsujin/dxvk/releases/download/v{version}/dxvk-{version}.tar.gz";

/// WineCellar settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Value exported as WINEDEBUG for every Wine invocation
    pub wine_debug: String,

    /// Id or version string of the configured default Wine toolchain
    pub default_wine: Option<String>,

    /// DXVK release installed by default
    pub dxvk_version: String,

    /// DXVK_LOG_LEVEL for prefixes with DXVK enabled
    pub dxvk_log_level: DxvkLogLevel,

    /// DXVK_HUD elements for prefixes with DXVK enabled
    pub dxvk_hud: Vec<DxvkHudElement>,

    /// Most recently used prefixes, newest first
    pub recent_prefixes: Vec<Uuid>,

    /// Maximum length of `recent_prefixes`
    pub recent_limit: usize,

    /// Opt-in deadline for external processes (none by default)
    pub process_timeout_secs: Option<u64>,

    pub steam_installer_url: String,
    pub winetricks_url: String,

    /// Download URL with `{version}` placeholders
    pub dxvk_url_template: String,

    /// Time given to the Steam installer's background work after it exits
    pub steam_install_grace_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            wine_debug: "-all".to_string(),
            default_wine: None,
            dxvk_version: "2.3".to_string(),
            dxvk_log_level: DxvkLogLevel::Off,
            dxvk_hud: Vec::new(),
            recent_prefixes: Vec::new(),
            recent_limit: 10,
            process_timeout_secs: None,
            steam_installer_url: DEFAULT_STEAM_INSTALLER_URL.to_string(),
            winetricks_url: DEFAULT_WINETRICKS_URL.to_string(),
            dxvk_url_template: DEFAULT_DXVK_URL_TEMPLATE.to_string(),
            steam_install_grace_secs: 5,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, layered under `WINECELLAR_*` variables.
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let loaded = config::Config::builder()
            .add_source(
                config::File::from(path)
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(config::Environment::with_prefix("WINECELLAR"))
            .build()?;

        let settings: Settings = loaded.try_deserialize()?;
        debug!("Loaded settings from {:?}", path);
        Ok(settings)
    }

    /// Download URL for a DXVK release
    pub fn dxvk_url(&self, version: &str) -> String {
        self.dxvk_url_template.replace("{version}", version)
    }

    pub fn process_timeout(&self) -> Option<Duration> {
        self.process_timeout_secs.map(Duration::from_secs)
    }

    /// Move `id` to the front of the recent list, keeping it bounded
    pub fn push_recent(&mut self, id: Uuid) {
        self.recent_prefixes.retain(|existing| *existing != id);
        self.recent_prefixes.insert(0, id);
        self.recent_prefixes.truncate(self.recent_limit.max(1));
    }

    pub fn forget_recent(&mut self, id: Uuid) {
        self.recent_prefixes.retain(|existing| *existing != id);
    }
}

/// Shared, persisted settings.
///
/// Readers take snapshots; every update is written through to disk.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>, settings: Settings) -> Self {
        Self {
            path: path.into(),
            current: RwLock::new(settings),
        }
    }

    /// Open the store backed by `path`
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = Settings::load(&path)?;
        Ok(Self::new(path, settings))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a change and persist the result
    pub async fn update<F>(&self, apply: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let updated = {
            let mut guard = self
                .current
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            apply(&mut guard);
            guard.clone()
        };

        storage::write_json(&self.path, &updated).await?;
        info!("Settings saved to {:?}", self.path);
        Ok(updated)
    }

    pub async fn record_recent_prefix(&self, id: Uuid) -> Result<()> {
        self.update(|settings| settings.push_recent(id)).await?;
        Ok(())
    }

    pub async fn forget_recent_prefix(&self, id: Uuid) -> Result<()> {
        self.update(|settings| settings.forget_recent(id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = Settings::load(&dir.path().join("config.json")).unwrap();
        assert_eq!(settings.wine_debug, "-all");
        assert_eq!(settings.recent_limit, 10);
        assert!(settings.process_timeout().is_none());
    }

    #[test]
    fn recent_list_is_bounded_and_deduplicated() {
        let mut settings = Settings {
            recent_limit: 3,
            ..Settings::default()
        };
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            settings.push_recent(*id);
        }
        assert_eq!(settings.recent_prefixes, vec![ids[3], ids[2], ids[1]]);

        settings.push_recent(ids[1]);
        assert_eq!(settings.recent_prefixes, vec![ids[1], ids[3], ids[2]]);

        settings.forget_recent(ids[3]);
        assert_eq!(settings.recent_prefixes, vec![ids[1], ids[2]]);
    }

    #[test]
    fn dxvk_url_substitutes_version() {
        let settings = Settings::default();
        assert_eq!(
            settings.dxvk_url("2.3"),
            "https://github.com/doitsujin/dxvk/releases/download/v2.3/dxvk-2.3.tar.gz"
        );
    }

    #[tokio::test]
    async fn updates_are_persisted_and_reloaded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let store = SettingsStore::load(&path).unwrap();
        let id = Uuid::new_v4();

        store.record_recent_prefix(id).await.unwrap();
        store
            .update(|settings| {
                settings.dxvk_version = "2.4".to_string();
                settings.dxvk_hud = vec![DxvkHudElement::Fps];
            })
            .await
            .unwrap();

        let reloaded = SettingsStore::load(&path).unwrap().snapshot();
        assert_eq!(reloaded.recent_prefixes, vec![id]);
        assert_eq!(reloaded.dxvk_version, "2.4");
        assert_eq!(reloaded.dxvk_hud, vec![DxvkHudElement::Fps]);
    }
}
