//! Composition root tying the services together
//!
//! [`WineCellar`] builds every component once, wires their shared pieces
//! (settings, runner, downloads, Wine registry) explicitly and exposes the
//! user-level operations. Each operation updates the single current-error
//! value shown by the frontend.

use crate::config::{Settings, SettingsStore};
use crate::download::DownloadManager;
use crate::dxvk::DxvkInstaller;
use crate::error::{CellarError, Result};
use crate::manager::{NewPrefix, PrefixManager};
use crate::prefix::{InstalledApp, WinePrefix, WindowsVersion};
use crate::process::{OutputSink, ProcessOutput, ProcessRunner};
use crate::steam::{SteamLibrary, SteamManager};
use crate::storage::{ProgressSink, Storage};
use crate::wine::{SearchPaths, WineRegistry, WineTool, WineVersion};
use crate::winetricks::{InstallReport, Winetricks};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Named winetricks bundles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bundle {
    Steam,
    Games,
    DotNet,
}

pub struct WineCellar {
    storage: Storage,
    settings: Arc<SettingsStore>,
    wine: Arc<WineRegistry>,
    winetricks: Arc<Winetricks>,
    dxvk: DxvkInstaller,
    prefixes: PrefixManager,
    steam: SteamManager,
    current_error: Option<String>,
}

impl WineCellar {
    /// Open the cellar rooted at `root`, scanning the standard Wine locations
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::open_storage(Storage::new(root)).await
    }

    /// Open the cellar laid out by `storage`, scanning the standard Wine locations
    pub async fn open_storage(storage: Storage) -> Result<Self> {
        let search = SearchPaths::standard(&storage);
        Self::with_search_paths(storage, search).await
    }

    pub async fn with_search_paths(storage: Storage, search: SearchPaths) -> Result<Self> {
        storage.ensure_directories().await?;
        let settings = Arc::new(SettingsStore::load(storage.config_file())?);
        let runner = ProcessRunner::with_timeout(settings.snapshot().process_timeout());
        let downloader = Arc::new(DownloadManager::new(storage.downloads_dir())?);

        let wine = Arc::new(WineRegistry::new(runner.clone(), settings.clone(), search));
        let winetricks = Arc::new(Winetricks::new(
            runner.clone(),
            downloader.clone(),
            storage.clone(),
            settings.clone(),
        ));
        let dxvk = DxvkInstaller::new(
            runner,
            downloader.clone(),
            storage.clone(),
            settings.clone(),
            wine.clone(),
        );
        let prefixes = PrefixManager::new(storage.clone(), settings.clone(), wine.clone());
        let steam = SteamManager::new(
            downloader,
            winetricks.clone(),
            wine.clone(),
            settings.clone(),
            storage.clone(),
        );

        info!("WineCellar opened at {:?}", storage.root());
        Ok(Self {
            storage,
            settings,
            wine,
            winetricks,
            dxvk,
            prefixes,
            steam,
            current_error: None,
        })
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn settings(&self) -> Settings {
        self.settings.snapshot()
    }

    pub fn settings_store(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn wine(&self) -> &WineRegistry {
        &self.wine
    }

    pub fn prefixes(&self) -> &PrefixManager {
        &self.prefixes
    }

    pub fn steam_library(&self) -> &SteamLibrary {
        self.steam.library()
    }

    pub fn current_error(&self) -> Option<&str> {
        self.current_error.as_deref()
    }

    pub fn acknowledge_error(&mut self) {
        self.current_error = None;
    }

    /// Remember the outcome: failures become the current error, success clears it
    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.current_error = None,
            Err(e) => {
                error!("{}", e);
                self.current_error = Some(e.to_string());
            }
        }
        result
    }

    /// Rescan Wine installations and reload prefixes from disk
    pub async fn refresh(&mut self) -> Result<()> {
        let result = async {
            self.wine.detect().await?;
            self.prefixes.load_prefixes().await?;
            Ok::<(), CellarError>(())
        }
        .await;
        self.record(result)
    }

    pub async fn detect_wine(&mut self) -> Result<Vec<WineVersion>> {
        let result = self.wine.detect().await;
        self.record(result)
    }

    pub async fn set_default_wine(&mut self, id: &str) -> Result<()> {
        let result = self.wine.set_default(id).await;
        self.record(result)
    }

    pub async fn create_prefix(&mut self, request: NewPrefix) -> Result<WinePrefix> {
        let result = self.prefixes.create_prefix(request).await;
        self.record(result)
    }

    pub async fn delete_prefix(&mut self, id: Uuid) -> Result<()> {
        let result = self.prefixes.delete_prefix(id).await;
        self.record(result)
    }

    pub async fn duplicate_prefix(
        &mut self,
        id: Uuid,
        name: &str,
        progress: Option<ProgressSink>,
    ) -> Result<WinePrefix> {
        let result = self.prefixes.duplicate_prefix(id, name, progress).await;
        self.record(result)
    }

    pub async fn rename_prefix(&mut self, id: Uuid, name: &str) -> Result<WinePrefix> {
        let result = self.prefixes.rename_prefix(id, name).await;
        self.record(result)
    }

    pub async fn set_windows_version(&mut self, id: Uuid, windows: WindowsVersion) -> Result<WinePrefix> {
        let result = self.prefixes.set_windows_version(id, windows).await;
        self.record(result)
    }

    pub async fn set_dxvk_enabled(&mut self, id: Uuid, enabled: bool) -> Result<WinePrefix> {
        let result = self.prefixes.set_dxvk_enabled(id, enabled).await;
        self.record(result)
    }

    pub async fn prefix_size(&mut self, id: Uuid) -> Result<u64> {
        let result = self.prefixes.prefix_size(id).await;
        self.record(result)
    }

    pub async fn run_program(
        &mut self,
        id: Uuid,
        executable: &Path,
        args: &[String],
        output: Option<OutputSink>,
    ) -> Result<ProcessOutput> {
        let result = self.prefixes.run_program(id, executable, args, output).await;
        self.record(result)
    }

    pub async fn run_installer(
        &mut self,
        id: Uuid,
        installer: &Path,
        unattended: bool,
        output: Option<OutputSink>,
    ) -> Result<ProcessOutput> {
        let result = self
            .prefixes
            .run_installer(id, installer, unattended, output)
            .await;
        self.record(result)
    }

    pub async fn open_tool(&mut self, id: Uuid, tool: WineTool, output: Option<OutputSink>) -> Result<ProcessOutput> {
        let result = match self.prefixes.prefix(id).cloned() {
            Some(prefix) => self.wine.open_tool(&prefix, tool, output).await,
            None => Err(CellarError::PrefixNotFound(id)),
        };
        self.record(result)
    }

    pub async fn add_app(&mut self, id: Uuid, app: InstalledApp) -> Result<InstalledApp> {
        let result = self.prefixes.add_app(id, app).await;
        self.record(result)
    }

    pub async fn remove_app(&mut self, id: Uuid, app_id: Uuid) -> Result<()> {
        let result = self.prefixes.remove_app(id, app_id).await;
        self.record(result)
    }

    pub async fn launch_app(&mut self, id: Uuid, app_id: Uuid, output: Option<OutputSink>) -> Result<ProcessOutput> {
        let result = self.prefixes.launch_app(id, app_id, output).await;
        self.record(result)
    }

    pub async fn install_verbs(
        &mut self,
        id: Uuid,
        verbs: &[&str],
        output: Option<OutputSink>,
    ) -> Result<InstallReport> {
        let result = match self.prefixes.prefix(id).cloned() {
            Some(prefix) => {
                let version = self.wine.version_for(&prefix);
                self.winetricks
                    .install(verbs, &prefix, version.as_ref(), output)
                    .await
            }
            None => Err(CellarError::PrefixNotFound(id)),
        };
        self.record(result)
    }

    pub async fn install_bundle(
        &mut self,
        id: Uuid,
        bundle: Bundle,
        output: Option<OutputSink>,
    ) -> Result<InstallReport> {
        let result = match self.prefixes.prefix(id).cloned() {
            Some(prefix) => {
                let version = self.wine.version_for(&prefix);
                match bundle {
                    Bundle::Steam => {
                        self.winetricks
                            .install_steam_essentials(&prefix, version.as_ref(), output)
                            .await
                    }
                    Bundle::Games => {
                        self.winetricks
                            .install_game_essentials(&prefix, version.as_ref(), output)
                            .await
                    }
                    Bundle::DotNet => {
                        self.winetricks
                            .install_dotnet(&prefix, version.as_ref(), output)
                            .await
                    }
                }
            }
            None => Err(CellarError::PrefixNotFound(id)),
        };
        self.record(result)
    }

    pub async fn installed_verbs(&mut self, id: Uuid) -> Result<Vec<String>> {
        let result = match self.prefixes.prefix(id).cloned() {
            Some(prefix) => self.winetricks.installed_verbs(&prefix).await,
            None => Err(CellarError::PrefixNotFound(id)),
        };
        self.record(result)
    }

    /// Install DXVK (the configured release unless `version` is given) and
    /// enable it for the prefix
    pub async fn install_dxvk(
        &mut self,
        id: Uuid,
        version: Option<&str>,
        progress: Option<ProgressSink>,
    ) -> Result<WinePrefix> {
        let version = version
            .map(str::to_string)
            .unwrap_or_else(|| self.settings.snapshot().dxvk_version);
        let result = match self.prefixes.prefix(id).cloned() {
            Some(prefix) => match self.dxvk.install(&version, &prefix, progress).await {
                Ok(()) => self.prefixes.set_dxvk_enabled(id, true).await,
                Err(e) => Err(e),
            },
            None => Err(CellarError::PrefixNotFound(id)),
        };
        self.record(result)
    }

    pub async fn uninstall_dxvk(&mut self, id: Uuid) -> Result<WinePrefix> {
        let result = match self.prefixes.prefix(id).cloned() {
            Some(prefix) => match self.dxvk.uninstall(&prefix).await {
                Ok(()) => self.prefixes.set_dxvk_enabled(id, false).await,
                Err(e) => Err(e),
            },
            None => Err(CellarError::PrefixNotFound(id)),
        };
        self.record(result)
    }

    pub async fn dxvk_installed(&mut self, id: Uuid) -> Result<bool> {
        let result = match self.prefixes.prefix(id) {
            Some(prefix) => Ok(self.dxvk.is_installed(prefix).await),
            None => Err(CellarError::PrefixNotFound(id)),
        };
        self.record(result)
    }

    pub fn find_steam_prefix(&mut self) -> Option<WinePrefix> {
        self.steam.find_steam_prefix(&self.prefixes)
    }

    pub async fn install_steam(&mut self, progress: Option<ProgressSink>) -> Result<WinePrefix> {
        let result = self.steam.install_steam(&mut self.prefixes, progress).await;
        self.record(result)
    }

    pub async fn launch_steam(&mut self, big_picture: bool, output: Option<OutputSink>) -> Result<ProcessOutput> {
        let result = if big_picture {
            self.steam
                .launch_big_picture(&mut self.prefixes, None, output)
                .await
        } else {
            self.steam.launch_steam(&mut self.prefixes, None, output).await
        };
        self.record(result)
    }

    pub async fn launch_game(&mut self, app_id: u32, output: Option<OutputSink>) -> Result<ProcessOutput> {
        let result = self
            .steam
            .launch_game(&mut self.prefixes, app_id, None, output)
            .await;
        self.record(result)
    }

    pub async fn scan_steam_library(&mut self) -> Result<SteamLibrary> {
        let result = self
            .steam
            .scan_library(&self.prefixes, None)
            .await
            .cloned();
        self.record(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::fake_wine;
    use tempfile::TempDir;

    async fn cellar(dir: &TempDir) -> WineCellar {
        let storage = Storage::new(dir.path());
        let search = SearchPaths::managed_only(storage.wine_dir());
        WineCellar::with_search_paths(storage, search).await.unwrap()
    }

    #[tokio::test]
    async fn failures_become_current_error_until_success_or_acknowledged() {
        let dir = TempDir::new().unwrap();
        let mut cellar = cellar(&dir).await;
        cellar.refresh().await.unwrap();
        assert!(cellar.current_error().is_none());

        let missing = Uuid::new_v4();
        assert!(cellar.delete_prefix(missing).await.is_err());
        assert!(cellar.current_error().unwrap().contains(&missing.to_string()));

        cellar.acknowledge_error();
        assert!(cellar.current_error().is_none());

        assert!(matches!(
            cellar.launch_game(730, None).await,
            Err(CellarError::SteamNotInstalled)
        ));
        assert_eq!(cellar.current_error(), Some("Steam is not installed"));

        cellar.detect_wine().await.unwrap();
        assert!(cellar.current_error().is_none());
    }

    #[tokio::test]
    async fn refresh_sees_prefixes_created_by_another_instance() {
        let dir = TempDir::new().unwrap();
        fake_wine(&dir.path().join("wine").join("stable"), "wine-9.0");

        let mut first = cellar(&dir).await;
        first.refresh().await.unwrap();
        let created = first.create_prefix(NewPrefix::new("Shared")).await.unwrap();

        let mut second = cellar(&dir).await;
        assert!(second.prefixes().prefix(created.id).is_none());
        second.refresh().await.unwrap();
        assert_eq!(second.prefixes().prefix(created.id), Some(&created));
        assert_eq!(second.wine().versions().len(), 1);
    }
}
