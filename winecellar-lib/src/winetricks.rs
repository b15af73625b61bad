//! winetricks helper resolution and verb installation

use crate::config::SettingsStore;
use crate::download::DownloadManager;
use crate::error::{CellarError, Result};
use crate::prefix::WinePrefix;
use crate::process::{OutputSink, ProcessRunner};
use crate::storage::{self, Storage};
use crate::wine::WineVersion;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Verb categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerbCategory {
    Fonts,
    #[serde(rename = "vcrun")]
    VisualCpp,
    #[serde(rename = "dotnet")]
    DotNet,
    DirectX,
    Other,
}

impl VerbCategory {
    pub const ALL: [VerbCategory; 5] = [
        VerbCategory::Fonts,
        VerbCategory::VisualCpp,
        VerbCategory::DotNet,
        VerbCategory::DirectX,
        VerbCategory::Other,
    ];

    pub fn display_name(&self) -> &'static str {
        match self {
            VerbCategory::Fonts => "Fonts",
            VerbCategory::VisualCpp => "Visual C++ Runtimes",
            VerbCategory::DotNet => ".NET Framework",
            VerbCategory::DirectX => "DirectX",
            VerbCategory::Other => "Other",
        }
    }
}

/// Curated winetricks verbs offered in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WinetricksVerb {
    Corefonts,
    Tahoma,
    Liberation,
    Vcrun2010,
    Vcrun2013,
    Vcrun2015,
    Vcrun2019,
    Vcrun2022,
    Dotnet40,
    Dotnet48,
    Dotnetdesktop6,
    D3dx9,
    D3dx10,
    D3dx11_43,
    D3dcompiler47,
    Dxvk,
    Xact,
    Xinput,
    Physx,
    Faudio,
    Gdiplus,
    Mfc42,
}

impl WinetricksVerb {
    pub const ALL: [WinetricksVerb; 22] = [
        WinetricksVerb::Corefonts,
        WinetricksVerb::Tahoma,
        WinetricksVerb::Liberation,
        WinetricksVerb::Vcrun2010,
        WinetricksVerb::Vcrun2013,
        WinetricksVerb::Vcrun2015,
        WinetricksVerb::Vcrun2019,
        WinetricksVerb::Vcrun2022,
        WinetricksVerb::Dotnet40,
        WinetricksVerb::Dotnet48,
        WinetricksVerb::Dotnetdesktop6,
        WinetricksVerb::D3dx9,
        WinetricksVerb::D3dx10,
        WinetricksVerb::D3dx11_43,
        WinetricksVerb::D3dcompiler47,
        WinetricksVerb::Dxvk,
        WinetricksVerb::Xact,
        WinetricksVerb::Xinput,
        WinetricksVerb::Physx,
        WinetricksVerb::Faudio,
        WinetricksVerb::Gdiplus,
        WinetricksVerb::Mfc42,
    ];

    /// Name understood by winetricks
    pub fn as_str(&self) -> &'static str {
        match self {
            WinetricksVerb::Corefonts => "corefonts",
            WinetricksVerb::Tahoma => "tahoma",
            WinetricksVerb::Liberation => "liberation",
            WinetricksVerb::Vcrun2010 => "vcrun2010",
            WinetricksVerb::Vcrun2013 => "vcrun2013",
            WinetricksVerb::Vcrun2015 => "vcrun2015",
            WinetricksVerb::Vcrun2019 => "vcrun2019",
            WinetricksVerb::Vcrun2022 => "vcrun2022",
            WinetricksVerb::Dotnet40 => "dotnet40",
            WinetricksVerb::Dotnet48 => "dotnet48",
            WinetricksVerb::Dotnetdesktop6 => "dotnetdesktop6",
            WinetricksVerb::D3dx9 => "d3dx9",
            WinetricksVerb::D3dx10 => "d3dx10",
            WinetricksVerb::D3dx11_43 => "d3dx11_43",
            WinetricksVerb::D3dcompiler47 => "d3dcompiler_47",
            WinetricksVerb::Dxvk => "dxvk",
            WinetricksVerb::Xact => "xact",
            WinetricksVerb::Xinput => "xinput",
            WinetricksVerb::Physx => "physx",
            WinetricksVerb::Faudio => "faudio",
            WinetricksVerb::Gdiplus => "gdiplus",
            WinetricksVerb::Mfc42 => "mfc42",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            WinetricksVerb::Corefonts => "Microsoft Core Fonts",
            WinetricksVerb::Tahoma => "Tahoma",
            WinetricksVerb::Liberation => "Liberation Fonts",
            WinetricksVerb::Vcrun2010 => "Visual C++ 2010",
            WinetricksVerb::Vcrun2013 => "Visual C++ 2013",
            WinetricksVerb::Vcrun2015 => "Visual C++ 2015",
            WinetricksVerb::Vcrun2019 => "Visual C++ 2015-2019",
            WinetricksVerb::Vcrun2022 => "Visual C++ 2015-2022",
            WinetricksVerb::Dotnet40 => ".NET Framework 4.0",
            WinetricksVerb::Dotnet48 => ".NET Framework 4.8",
            WinetricksVerb::Dotnetdesktop6 => ".NET Desktop Runtime 6",
            WinetricksVerb::D3dx9 => "DirectX 9 (d3dx9)",
            WinetricksVerb::D3dx10 => "DirectX 10 (d3dx10)",
            WinetricksVerb::D3dx11_43 => "DirectX 11 (d3dx11_43)",
            WinetricksVerb::D3dcompiler47 => "D3D Compiler 47",
            WinetricksVerb::Dxvk => "DXVK",
            WinetricksVerb::Xact => "XACT Audio",
            WinetricksVerb::Xinput => "XInput",
            WinetricksVerb::Physx => "PhysX",
            WinetricksVerb::Faudio => "FAudio",
            WinetricksVerb::Gdiplus => "GDI+",
            WinetricksVerb::Mfc42 => "MFC 4.2",
        }
    }

    pub fn category(&self) -> VerbCategory {
        match self {
            WinetricksVerb::Corefonts | WinetricksVerb::Tahoma | WinetricksVerb::Liberation => {
                VerbCategory::Fonts
            }
            WinetricksVerb::Vcrun2010
            | WinetricksVerb::Vcrun2013
            | WinetricksVerb::Vcrun2015
            | WinetricksVerb::Vcrun2019
            | WinetricksVerb::Vcrun2022 => VerbCategory::VisualCpp,
            WinetricksVerb::Dotnet40 | WinetricksVerb::Dotnet48 | WinetricksVerb::Dotnetdesktop6 => {
                VerbCategory::DotNet
            }
            WinetricksVerb::D3dx9
            | WinetricksVerb::D3dx10
            | WinetricksVerb::D3dx11_43
            | WinetricksVerb::D3dcompiler47
            | WinetricksVerb::Dxvk => VerbCategory::DirectX,
            WinetricksVerb::Xact
            | WinetricksVerb::Xinput
            | WinetricksVerb::Physx
            | WinetricksVerb::Faudio
            | WinetricksVerb::Gdiplus
            | WinetricksVerb::Mfc42 => VerbCategory::Other,
        }
    }
}

impl FromStr for WinetricksVerb {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        WinetricksVerb::ALL
            .iter()
            .find(|verb| verb.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown verb: {}", s))
    }
}

/// Minimal set for running the Steam client
pub const STEAM_ESSENTIALS: [WinetricksVerb; 3] = [
    WinetricksVerb::Corefonts,
    WinetricksVerb::Vcrun2022,
    WinetricksVerb::D3dx9,
];

/// Broader runtime set for games, including physics and audio middleware
pub const GAME_ESSENTIALS: [WinetricksVerb; 8] = [
    WinetricksVerb::Corefonts,
    WinetricksVerb::Vcrun2022,
    WinetricksVerb::D3dx9,
    WinetricksVerb::D3dx11_43,
    WinetricksVerb::D3dcompiler47,
    WinetricksVerb::Physx,
    WinetricksVerb::Xact,
    WinetricksVerb::Faudio,
];

pub const DOTNET: [WinetricksVerb; 1] = [WinetricksVerb::Dotnet48];

/// Outcome of a best-effort verb batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    pub succeeded: Vec<String>,
    /// Verb and its exit code
    pub failed: Vec<(String, i32)>,
}

impl InstallReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Resolves the winetricks helper and runs verbs with it
pub struct Winetricks {
    runner: ProcessRunner,
    downloader: Arc<DownloadManager>,
    storage: Storage,
    settings: Arc<SettingsStore>,
    /// Directories searched for a system winetricks, in `PATH` syntax
    search_path: Option<OsString>,
    resolved: Mutex<Option<PathBuf>>,
}

impl Winetricks {
    pub fn new(
        runner: ProcessRunner,
        downloader: Arc<DownloadManager>,
        storage: Storage,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            runner,
            downloader,
            storage,
            settings,
            search_path: std::env::var_os("PATH"),
            resolved: Mutex::new(None),
        }
    }

    /// Look for a system winetricks in `search_path` instead of `$PATH`
    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    /// Path of a usable winetricks: the cached copy, one on `PATH`, or a
    /// fresh download. The answer is remembered for the life of `self`.
    pub async fn ensure_available(&self) -> Result<PathBuf> {
        let mut resolved = self.resolved.lock().await;
        if let Some(path) = resolved.as_ref() {
            return Ok(path.clone());
        }

        let cached = self.storage.winetricks_path();
        let path = if is_usable(&cached).await {
            debug!("Using cached winetricks at {:?}", cached);
            cached
        } else if let Ok(system) =
            which::which_in("winetricks", self.search_path.as_ref(), self.storage.root())
        {
            debug!("Using system winetricks at {:?}", system);
            system
        } else {
            self.download(&cached).await?
        };

        *resolved = Some(path.clone());
        Ok(path)
    }

    async fn download(&self, destination: &Path) -> Result<PathBuf> {
        let url = self.settings.snapshot().winetricks_url;
        info!("Downloading winetricks from {}", url);
        self.downloader
            .download(&url, destination, None)
            .await
            .map_err(|e| CellarError::Winetricks(e.to_string()))?;
        make_executable(destination).await?;

        if !is_usable(destination).await {
            return Err(CellarError::Winetricks(format!(
                "downloaded helper at {:?} is not usable",
                destination
            )));
        }
        Ok(destination.to_path_buf())
    }

    /// Install `verbs` one at a time.
    ///
    /// A failing verb is logged and skipped; the rest still run. Only a
    /// missing helper or a failure to start it aborts the batch.
    pub async fn install(
        &self,
        verbs: &[&str],
        prefix: &WinePrefix,
        version: Option<&WineVersion>,
        output: Option<OutputSink>,
    ) -> Result<InstallReport> {
        let winetricks = self.ensure_available().await?;

        let mut env = HashMap::new();
        env.insert("WINEDEBUG".to_string(), "-all".to_string());
        if let Some(version) = version {
            if let Some(wine) = version.wine_binary() {
                env.insert("WINE".to_string(), wine.to_string_lossy().into_owned());
            }
            env.insert(
                "WINESERVER".to_string(),
                version.wineserver_binary().to_string_lossy().into_owned(),
            );
        }

        let mut report = InstallReport::default();
        for verb in verbs {
            info!("Installing {} into prefix '{}'", verb, prefix.name);
            let args = vec!["-q".to_string(), verb.to_string()];
            let result = self
                .runner
                .run_wine(
                    &winetricks,
                    &args,
                    &prefix.wine_path(),
                    prefix.architecture,
                    &env,
                    None,
                    output.clone(),
                )
                .await?;

            if result.success() {
                report.succeeded.push(verb.to_string());
            } else {
                warn!(
                    "winetricks {} failed with exit code {}: {}",
                    verb,
                    result.exit_code,
                    result.stderr.trim()
                );
                report.failed.push((verb.to_string(), result.exit_code));
            }
        }
        Ok(report)
    }

    async fn install_set(
        &self,
        verbs: &[WinetricksVerb],
        prefix: &WinePrefix,
        version: Option<&WineVersion>,
        output: Option<OutputSink>,
    ) -> Result<InstallReport> {
        let names: Vec<&str> = verbs.iter().map(|v| v.as_str()).collect();
        self.install(&names, prefix, version, output).await
    }

    pub async fn install_steam_essentials(
        &self,
        prefix: &WinePrefix,
        version: Option<&WineVersion>,
        output: Option<OutputSink>,
    ) -> Result<InstallReport> {
        self.install_set(&STEAM_ESSENTIALS, prefix, version, output).await
    }

    pub async fn install_game_essentials(
        &self,
        prefix: &WinePrefix,
        version: Option<&WineVersion>,
        output: Option<OutputSink>,
    ) -> Result<InstallReport> {
        self.install_set(&GAME_ESSENTIALS, prefix, version, output).await
    }

    pub async fn install_dotnet(
        &self,
        prefix: &WinePrefix,
        version: Option<&WineVersion>,
        output: Option<OutputSink>,
    ) -> Result<InstallReport> {
        self.install_set(&DOTNET, prefix, version, output).await
    }

    /// Catalog grouped by category, in display order
    pub fn catalog() -> Vec<(VerbCategory, Vec<WinetricksVerb>)> {
        VerbCategory::ALL
            .iter()
            .map(|category| {
                let verbs = WinetricksVerb::ALL
                    .iter()
                    .filter(|verb| verb.category() == *category)
                    .copied()
                    .collect();
                (*category, verbs)
            })
            .collect()
    }

    /// Verbs winetricks has recorded in the prefix's `winetricks.log`
    pub async fn installed_verbs(&self, prefix: &WinePrefix) -> Result<Vec<String>> {
        let log = prefix.wine_path().join("winetricks.log");
        let content = match tokio::fs::read_to_string(&log).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut verbs: Vec<String> = Vec::new();
        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !verbs.iter().any(|v| v == line) {
                verbs.push(line.to_string());
            }
        }
        Ok(verbs)
    }
}

async fn is_usable(path: &Path) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_file() && metadata.len() > 0 && storage::is_executable(path),
        Err(_) => false,
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
