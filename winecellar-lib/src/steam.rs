//! Steam installation, launching and library scanning

use crate::config::SettingsStore;
use crate::download::DownloadManager;
use crate::error::{CellarError, Result};
use crate::manager::{NewPrefix, PrefixManager};
use crate::prefix::{InstalledApp, WineArch, WinePrefix, WindowsVersion};
use crate::process::{OutputSink, ProcessOutput};
use crate::storage::{ProgressSink, Storage};
use crate::winetricks::Winetricks;
use crate::wine::WineRegistry;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Steam client location relative to `drive_c` (32-bit install)
pub const STEAM_EXE_X86: &str = "Program Files (x86)/Steam/steam.exe";
/// Steam client location relative to `drive_c` (64-bit install)
pub const STEAM_EXE_64: &str = "Program Files/Steam/steam.exe";

pub const STEAM_PREFIX_NAME: &str = "Steam";
const STEAM_INSTALLER_FILE: &str = "SteamSetup.exe";

/// A game found in a Steam library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SteamGame {
    pub id: u32,
    pub name: String,
    /// Folder name below `steamapps/common`
    pub install_path: Option<String>,
    pub executable: Option<String>,
    pub is_installed: bool,
    pub last_played: Option<DateTime<Utc>>,
    /// Seconds
    pub play_time: u64,
}

impl SteamGame {
    pub fn store_url(&self) -> String {
        format!("https://store.steampowered.com/app/{}", self.id)
    }

    /// ProtonDB compatibility reports
    pub fn compatibility_url(&self) -> String {
        format!("https://www.protondb.com/app/{}", self.id)
    }

    pub fn launch_url(&self) -> String {
        format!("steam://rungameid/{}", self.id)
    }
}

/// Result of the most recent library scan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SteamLibrary {
    /// The `steamapps` folder that was scanned
    pub path: PathBuf,
    pub games: Vec<SteamGame>,
}

impl SteamLibrary {
    pub fn game(&self, id: u32) -> Option<&SteamGame> {
        self.games.iter().find(|game| game.id == id)
    }
}

/// Extract a game record from an `appmanifest_<id>.acf` file.
///
/// Only flat `"key" "value"` pairs are read; the first occurrence of a key
/// wins and keys are case-insensitive. `appid` and `name` are required.
pub fn parse_manifest(text: &str) -> Option<SteamGame> {
    static PAIR: OnceLock<Regex> = OnceLock::new();
    let pair = PAIR.get_or_init(|| Regex::new(r#""([^"]+)"\s+"([^"]*)""#).expect("valid manifest pattern"));

    let mut values: HashMap<String, String> = HashMap::new();
    for captures in pair.captures_iter(text) {
        values
            .entry(captures[1].to_lowercase())
            .or_insert_with(|| captures[2].to_string());
    }

    let id = values.get("appid")?.parse::<u32>().ok()?;
    let name = values.get("name").filter(|name| !name.is_empty())?.clone();
    let install_path = values.get("installdir").filter(|dir| !dir.is_empty()).cloned();

    // Bit 4 of StateFlags marks a fully installed game
    let is_installed = match values.get("stateflags").and_then(|f| f.parse::<u32>().ok()) {
        Some(flags) => flags & 4 != 0,
        None => true,
    };
    let last_played = values
        .get("lastplayed")
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|ts| *ts > 0)
        .and_then(|ts| DateTime::from_timestamp(ts, 0));

    Some(SteamGame {
        id,
        name,
        install_path,
        executable: None,
        is_installed,
        last_played,
        play_time: 0,
    })
}

/// Path of the Steam client inside `prefix`, if installed
pub fn steam_executable(prefix: &WinePrefix) -> Option<PathBuf> {
    [STEAM_EXE_X86, STEAM_EXE_64]
        .iter()
        .map(|relative| prefix.drive_c().join(relative))
        .find(|path| path.is_file())
}

/// Installs and drives the Steam client in its own prefix
pub struct SteamManager {
    downloader: Arc<DownloadManager>,
    winetricks: Arc<Winetricks>,
    wine: Arc<WineRegistry>,
    settings: Arc<SettingsStore>,
    storage: Storage,
    cached_prefix: Option<Uuid>,
    library: SteamLibrary,
}

impl SteamManager {
    pub fn new(
        downloader: Arc<DownloadManager>,
        winetricks: Arc<Winetricks>,
        wine: Arc<WineRegistry>,
        settings: Arc<SettingsStore>,
        storage: Storage,
    ) -> Self {
        Self {
            downloader,
            winetricks,
            wine,
            settings,
            storage,
            cached_prefix: None,
            library: SteamLibrary::default(),
        }
    }

    pub fn library(&self) -> &SteamLibrary {
        &self.library
    }

    /// The prefix holding the Steam client: one with `steam.exe` in either
    /// Program Files folder, else one named "Steam"
    pub fn find_steam_prefix(&mut self, prefixes: &PrefixManager) -> Option<WinePrefix> {
        let found = prefixes
            .prefixes()
            .iter()
            .find(|prefix| steam_executable(prefix).is_some())
            .or_else(|| prefixes.find_by_name(STEAM_PREFIX_NAME))
            .cloned();

        if let Some(prefix) = &found {
            debug!("Steam prefix is '{}'", prefix.name);
            self.cached_prefix = Some(prefix.id);
        }
        found
    }

    /// Explicit, then cached, then rediscovered
    fn active_prefix(&mut self, prefixes: &PrefixManager, explicit: Option<Uuid>) -> Result<WinePrefix> {
        if let Some(id) = explicit {
            return prefixes
                .prefix(id)
                .cloned()
                .ok_or(CellarError::PrefixNotFound(id));
        }
        if let Some(prefix) = self.cached_prefix.and_then(|id| prefixes.prefix(id)) {
            return Ok(prefix.clone());
        }
        self.find_steam_prefix(prefixes)
            .ok_or(CellarError::SteamNotInstalled)
    }

    /// Create a dedicated prefix and install the Steam client into it
    pub async fn install_steam(
        &mut self,
        prefixes: &mut PrefixManager,
        progress: Option<ProgressSink>,
    ) -> Result<WinePrefix> {
        let report = |fraction: f64| {
            if let Some(progress) = &progress {
                progress(fraction);
            }
        };
        let settings = self.settings.snapshot();
        info!("Installing Steam");
        report(0.0);

        let prefix = prefixes
            .create_prefix(NewPrefix {
                name: STEAM_PREFIX_NAME.to_string(),
                architecture: WineArch::Win64,
                windows_version: WindowsVersion::Win10,
                dxvk_enabled: true,
                wine_version: None,
            })
            .await?;
        report(0.2);

        let version = self.wine.version_for(&prefix);
        let dependencies = self
            .winetricks
            .install_steam_essentials(&prefix, version.as_ref(), None)
            .await?;
        if !dependencies.all_succeeded() {
            warn!("Some Steam dependencies failed: {:?}", dependencies.failed);
        }
        report(0.5);

        let installer = self.storage.downloads_dir().join(STEAM_INSTALLER_FILE);
        let scaled: Option<ProgressSink> = progress
            .clone()
            .map(|sink| Arc::new(move |f: f64| sink(0.5 + f * 0.2)) as ProgressSink);
        self.downloader
            .download(&settings.steam_installer_url, &installer, scaled)
            .await?;
        report(0.7);

        let output = prefixes
            .run_program(prefix.id, &installer, &["/S".to_string()], None)
            .await?;
        if !output.success() {
            return Err(CellarError::SteamInstallation(format!(
                "installer exited with code {}",
                output.exit_code
            )));
        }

        // The installer returns before its background work is done
        tokio::time::sleep(Duration::from_secs(settings.steam_install_grace_secs)).await;
        report(0.9);

        prefixes
            .add_app(prefix.id, InstalledApp::new("Steam", STEAM_EXE_X86))
            .await?;
        self.cached_prefix = Some(prefix.id);
        report(1.0);

        info!("Steam installed into prefix '{}'", prefix.name);
        prefixes
            .prefix(prefix.id)
            .cloned()
            .ok_or(CellarError::PrefixNotFound(prefix.id))
    }

    async fn run_steam(
        &mut self,
        prefixes: &mut PrefixManager,
        explicit: Option<Uuid>,
        extra: &[String],
        output: Option<OutputSink>,
    ) -> Result<ProcessOutput> {
        let prefix = self.active_prefix(prefixes, explicit)?;
        let executable =
            steam_executable(&prefix).unwrap_or_else(|| prefix.drive_c().join(STEAM_EXE_X86));

        let mut args = vec!["-no-cef-sandbox".to_string()];
        args.extend(extra.iter().cloned());
        prefixes
            .run_program(prefix.id, &executable, &args, output)
            .await
    }

    pub async fn launch_steam(
        &mut self,
        prefixes: &mut PrefixManager,
        prefix: Option<Uuid>,
        output: Option<OutputSink>,
    ) -> Result<ProcessOutput> {
        self.run_steam(prefixes, prefix, &[], output).await
    }

    pub async fn launch_big_picture(
        &mut self,
        prefixes: &mut PrefixManager,
        prefix: Option<Uuid>,
        output: Option<OutputSink>,
    ) -> Result<ProcessOutput> {
        self.run_steam(prefixes, prefix, &["-bigpicture".to_string()], output)
            .await
    }

    pub async fn launch_game(
        &mut self,
        prefixes: &mut PrefixManager,
        app_id: u32,
        prefix: Option<Uuid>,
        output: Option<OutputSink>,
    ) -> Result<ProcessOutput> {
        info!("Launching Steam game {}", app_id);
        let args = ["-applaunch".to_string(), app_id.to_string()];
        self.run_steam(prefixes, prefix, &args, output).await
    }

    /// Rescan the primary `steamapps` folder and replace the library.
    ///
    /// Additional library folders listed in `libraryfolders.vdf` are not read.
    pub async fn scan_library(&mut self, prefixes: &PrefixManager, prefix: Option<Uuid>) -> Result<&SteamLibrary> {
        let prefix = self.active_prefix(prefixes, prefix)?;
        let steam_dir = steam_executable(&prefix)
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .ok_or(CellarError::SteamNotInstalled)?;
        let steamapps = steam_dir.join("steamapps");

        let pattern = format!(
            "{}/appmanifest_*.acf",
            glob::Pattern::escape(&steamapps.to_string_lossy())
        );
        let manifests = glob::glob(&pattern).map_err(|e| CellarError::Config(e.to_string()))?;

        let mut games = Vec::new();
        for manifest in manifests {
            let manifest = match manifest {
                Ok(path) => path,
                Err(e) => {
                    warn!("Unreadable library entry: {}", e);
                    continue;
                }
            };
            let text = match tokio::fs::read_to_string(&manifest).await {
                Ok(text) => text,
                Err(e) => {
                    warn!("Skipping unreadable manifest {:?}: {}", manifest, e);
                    continue;
                }
            };
            match parse_manifest(&text) {
                Some(game) => games.push(game),
                None => debug!("Ignoring incomplete manifest {:?}", manifest),
            }
        }
        games.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));

        info!("Found {} Steam game(s) in {:?}", games.len(), steamapps);
        self.library = SteamLibrary {
            path: steamapps,
            games,
        };
        Ok(&self.library)
    }
}
