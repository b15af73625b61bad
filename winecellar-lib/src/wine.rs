//! Wine interface for detecting installations and running programs in prefixes

use crate::config::{Settings, SettingsStore};
use crate::error::{ignore_failure, CellarError, Result};
use crate::prefix::{WinePrefix, WindowsVersion};
use crate::process::{OutputSink, ProcessOutput, ProcessRunner};
use crate::registry::{dos_path, RegistryScript};
use crate::storage::{self, is_executable, Storage};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Fixed install locations probed on every scan
pub const COMMON_WINE_PATHS: &[(&str, WineSource)] = &[
    ("/Applications/Wine Stable.app/Contents/Resources/wine", WineSource::Official),
    ("/Applications/Wine Devel.app/Contents/Resources/wine", WineSource::Official),
    ("/Applications/Wine Staging.app/Contents/Resources/wine", WineSource::Official),
    ("/Applications/CrossOver.app/Contents/SharedSupport/CrossOver", WineSource::Commercial),
    ("/opt/wine-stable", WineSource::Official),
    ("/opt/wine-staging", WineSource::Official),
    ("/usr/local", WineSource::Official),
    ("/usr", WineSource::Official),
];

const WINE_BINARIES: &[&str] = &["wine64", "wine"];

/// Where a toolchain came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WineSource {
    Homebrew,
    Official,
    Commercial,
    Custom,
}

impl WineSource {
    pub fn display_name(&self) -> &'static str {
        match self {
            WineSource::Homebrew => "Homebrew",
            WineSource::Official => "Official",
            WineSource::Commercial => "CrossOver",
            WineSource::Custom => "Custom",
        }
    }
}

/// A Wine toolchain found on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WineVersion {
    /// Stable across scans: derived from the root path
    pub id: String,

    /// Version token, e.g. "9.0"
    pub version: String,

    /// Toolchain root containing `bin/`
    pub path: PathBuf,

    pub source: WineSource,
    pub is_default: bool,
}

impl WineVersion {
    pub fn bin_dir(&self) -> PathBuf {
        self.path.join("bin")
    }

    /// `bin/wine64`, else `bin/wine`, if executable
    pub fn wine_binary(&self) -> Option<PathBuf> {
        wine_binary_in(&self.path)
    }

    pub fn wineserver_binary(&self) -> PathBuf {
        self.bin_dir().join("wineserver")
    }

    pub fn is_valid(&self) -> bool {
        self.wine_binary().is_some()
    }
}

fn wine_binary_in(root: &Path) -> Option<PathBuf> {
    WINE_BINARIES
        .iter()
        .map(|name| root.join("bin").join(name))
        .find(|path| is_executable(path))
}

/// Extract the version token from `wine --version` output.
///
/// `wine-9.0` gives "9.0", `wine-8.0.1 (Staging)` gives "8.0.1".
pub fn parse_version_output(output: &str) -> Option<String> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| Regex::new(r"wine-([0-9][^\s()]*)").expect("valid version pattern"));

    if let Some(captures) = pattern.captures(output) {
        return Some(captures[1].to_string());
    }

    output
        .split_whitespace()
        .next()
        .filter(|token| token.starts_with(|c: char| c.is_ascii_digit()))
        .map(str::to_string)
}

/// Built-in Wine programs that can be opened in a prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WineTool {
    Winecfg,
    Regedit,
    Taskmgr,
    Explorer,
    Control,
    Uninstaller,
}

impl WineTool {
    pub fn program(&self) -> &'static str {
        match self {
            WineTool::Winecfg => "winecfg",
            WineTool::Regedit => "regedit",
            WineTool::Taskmgr => "taskmgr",
            WineTool::Explorer => "explorer",
            WineTool::Control => "control",
            WineTool::Uninstaller => "uninstaller",
        }
    }
}

impl std::str::FromStr for WineTool {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "winecfg" => Ok(WineTool::Winecfg),
            "regedit" => Ok(WineTool::Regedit),
            "taskmgr" => Ok(WineTool::Taskmgr),
            "explorer" => Ok(WineTool::Explorer),
            "control" => Ok(WineTool::Control),
            "uninstaller" => Ok(WineTool::Uninstaller),
            _ => Err(format!("Unknown Wine tool: {}", s)),
        }
    }
}

/// Locations scanned by [`WineRegistry::detect`]
#[derive(Debug, Clone)]
pub struct SearchPaths {
    pub homebrew: Option<PathBuf>,
    pub system: Vec<(PathBuf, WineSource)>,
    /// Directory of downloaded toolchains, one per subdirectory
    pub managed: PathBuf,
}

impl SearchPaths {
    pub fn standard(storage: &Storage) -> Self {
        Self {
            homebrew: storage::homebrew_prefix(),
            system: COMMON_WINE_PATHS
                .iter()
                .map(|(path, source)| (PathBuf::from(path), *source))
                .collect(),
            managed: storage.wine_dir(),
        }
    }

    pub fn managed_only(managed: impl Into<PathBuf>) -> Self {
        Self {
            homebrew: None,
            system: Vec::new(),
            managed: managed.into(),
        }
    }
}

/// Options for a single Wine invocation
#[derive(Clone, Default)]
pub struct WineInvocation {
    /// Explicit toolchain; the configured default otherwise
    pub version: Option<WineVersion>,
    /// Layered over the prefix environment
    pub environment: HashMap<String, String>,
    pub working_directory: Option<PathBuf>,
    /// Stream output here instead of capturing it
    pub output: Option<OutputSink>,
}

impl WineInvocation {
    pub fn with_version(version: Option<WineVersion>) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }
}

/// Environment every Wine process in `prefix` runs with
pub fn wine_environment(prefix: &WinePrefix, settings: &Settings) -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(
        "WINEPREFIX".to_string(),
        prefix.wine_path().to_string_lossy().into_owned(),
    );
    env.insert("WINEARCH".to_string(), prefix.architecture.as_str().to_string());
    env.insert("WINEDEBUG".to_string(), settings.wine_debug.clone());
    env.insert("WINEDLLOVERRIDES".to_string(), "winemenubuilder.exe=d".to_string());

    if prefix.dxvk_enabled {
        env.insert(
            "DXVK_LOG_LEVEL".to_string(),
            settings.dxvk_log_level.as_str().to_string(),
        );
        if !settings.dxvk_hud.is_empty() {
            let hud: Vec<&str> = settings.dxvk_hud.iter().map(|e| e.as_str()).collect();
            env.insert("DXVK_HUD".to_string(), hud.join(","));
        }
    }

    env.extend(prefix.environment.clone());
    env
}

/// Registry script selecting the emulated Windows release
pub fn windows_version_script(version: WindowsVersion) -> RegistryScript {
    const CURRENT_VERSION: &str = r"HKEY_LOCAL_MACHINE\Software\Microsoft\Windows NT\CurrentVersion";
    let info = version.registry_info();

    let mut script = RegistryScript::new();
    script
        .set_string(r"HKEY_CURRENT_USER\Software\Wine", "Version", version.as_str())
        .set_string(CURRENT_VERSION, "CurrentVersion", info.current_version)
        .set_string(CURRENT_VERSION, "CurrentBuild", info.build_number)
        .set_string(CURRENT_VERSION, "CurrentBuildNumber", info.build_number)
        .set_string(CURRENT_VERSION, "ProductName", info.product_name)
        .set_string(CURRENT_VERSION, "CSDVersion", info.csd_version);

    if let Some(major) = info.major_version {
        script
            .set_dword(CURRENT_VERSION, "CurrentMajorVersionNumber", major)
            .set_dword(CURRENT_VERSION, "CurrentMinorVersionNumber", 0);
    }
    script
}

/// Discovered Wine toolchains and the single entry point for running Wine
pub struct WineRegistry {
    runner: ProcessRunner,
    settings: Arc<SettingsStore>,
    search: SearchPaths,
    versions: RwLock<Vec<WineVersion>>,
}

impl WineRegistry {
    pub fn new(runner: ProcessRunner, settings: Arc<SettingsStore>, search: SearchPaths) -> Self {
        Self {
            runner,
            settings,
            search,
            versions: RwLock::new(Vec::new()),
        }
    }

    /// Rescan every known location and replace the version list
    pub async fn detect(&self) -> Result<Vec<WineVersion>> {
        let mut found = Vec::new();
        let mut seen = HashSet::new();

        for (root, source) in self.candidates().await? {
            let key = tokio::fs::canonicalize(&root)
                .await
                .unwrap_or_else(|_| root.clone());
            if !seen.insert(key) {
                continue;
            }
            if let Some(version) = self.probe(root, source).await {
                found.push(version);
            }
        }

        let preferred = self.settings.snapshot().default_wine;
        let default_index = preferred
            .and_then(|wanted| {
                found
                    .iter()
                    .position(|v| v.id == wanted || v.version == wanted)
            })
            .or(if found.is_empty() { None } else { Some(0) });
        if let Some(index) = default_index {
            found[index].is_default = true;
        }

        info!("Detected {} Wine installation(s)", found.len());
        *self.versions.write().unwrap_or_else(PoisonError::into_inner) = found.clone();
        Ok(found)
    }

    async fn candidates(&self) -> Result<Vec<(PathBuf, WineSource)>> {
        let mut candidates = Vec::new();

        if let Some(brew) = &self.search.homebrew {
            candidates.push((brew.join("opt").join("wine"), WineSource::Homebrew));
            candidates.push((brew.clone(), WineSource::Homebrew));
        }
        candidates.extend(self.search.system.iter().cloned());

        if storage::is_dir(&self.search.managed).await {
            let mut managed = Vec::new();
            let mut entries = tokio::fs::read_dir(&self.search.managed).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                // Downloaded app bundles keep the toolchain below Contents/
                let bundled = path.join("Contents").join("Resources").join("wine");
                managed.push(if bundled.join("bin").is_dir() { bundled } else { path });
            }
            managed.sort();
            candidates.extend(managed.into_iter().map(|p| (p, WineSource::Custom)));
        }

        Ok(candidates)
    }

    async fn probe(&self, root: PathBuf, source: WineSource) -> Option<WineVersion> {
        let binary = wine_binary_in(&root)?;
        let output = match self
            .runner
            .run(&binary, &["--version".to_string()], &HashMap::new(), None)
            .await
        {
            Ok(output) if output.success() => output,
            Ok(output) => {
                warn!("{:?} --version exited with {}", binary, output.exit_code);
                return None;
            }
            Err(e) => {
                warn!("Could not query {:?}: {}", binary, e);
                return None;
            }
        };

        let Some(version) = parse_version_output(&output.stdout) else {
            warn!("Unrecognized version output from {:?}: {:?}", binary, output.stdout.trim());
            return None;
        };

        debug!("Found Wine {} at {:?} ({:?})", version, root, source);
        Some(WineVersion {
            id: root.to_string_lossy().into_owned(),
            version,
            path: root,
            source,
            is_default: false,
        })
    }

    pub fn versions(&self) -> Vec<WineVersion> {
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn default_version(&self) -> Option<WineVersion> {
        let versions = self.versions.read().unwrap_or_else(PoisonError::into_inner);
        versions
            .iter()
            .find(|v| v.is_default)
            .or_else(|| versions.first())
            .cloned()
    }

    /// Look a version up by id or version string
    pub fn find(&self, query: &str) -> Option<WineVersion> {
        self.versions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|v| v.id == query || v.version == query)
            .cloned()
    }

    /// The version a prefix is pinned to, or `None` for the configured default
    pub fn version_for(&self, prefix: &WinePrefix) -> Option<WineVersion> {
        if prefix.wine_version.is_empty() {
            return None;
        }
        let found = self.find(&prefix.wine_version);
        if found.is_none() {
            warn!(
                "Prefix '{}' wants Wine {} which is not installed, using the default",
                prefix.name, prefix.wine_version
            );
        }
        found
    }

    /// Make `id` the default toolchain and remember the choice
    pub async fn set_default(&self, id: &str) -> Result<()> {
        {
            let mut versions = self.versions.write().unwrap_or_else(PoisonError::into_inner);
            if !versions.iter().any(|v| v.id == id) {
                return Err(CellarError::WineVersionNotFound(id.to_string()));
            }
            for version in versions.iter_mut() {
                version.is_default = version.id == id;
            }
        }
        let id = id.to_string();
        self.settings
            .update(move |settings| settings.default_wine = Some(id))
            .await?;
        Ok(())
    }

    fn resolve(&self, explicit: Option<WineVersion>) -> Result<(WineVersion, PathBuf)> {
        let version = explicit
            .or_else(|| self.default_version())
            .ok_or(CellarError::WineNotInstalled)?;
        let binary = version
            .wine_binary()
            .ok_or_else(|| CellarError::WineBinaryMissing(version.bin_dir()))?;
        Ok((version, binary))
    }

    /// Run `executable` under Wine in `prefix`
    pub async fn run_executable(
        &self,
        executable: &Path,
        args: &[String],
        prefix: &WinePrefix,
        invocation: WineInvocation,
    ) -> Result<ProcessOutput> {
        let (version, binary) = self.resolve(invocation.version)?;
        let settings = self.settings.snapshot();

        let mut env = wine_environment(prefix, &settings);
        env.extend(invocation.environment);

        let mut wine_args = Vec::with_capacity(args.len() + 1);
        wine_args.push(executable.to_string_lossy().into_owned());
        wine_args.extend(args.iter().cloned());

        info!(
            "Running {:?} in prefix '{}' with Wine {}",
            executable, prefix.name, version.version
        );
        self.runner
            .run_wine(
                &binary,
                &wine_args,
                &prefix.wine_path(),
                prefix.architecture,
                &env,
                invocation.working_directory.as_deref(),
                invocation.output,
            )
            .await
    }

    /// Initialize (`--init`) or refresh (`--update`) a prefix
    pub async fn run_wineboot(&self, prefix: &WinePrefix, version: Option<WineVersion>, init: bool) -> Result<()> {
        let flag = if init { "--init" } else { "--update" };
        let output = self
            .run_executable(
                Path::new("wineboot"),
                &[flag.to_string()],
                prefix,
                WineInvocation::with_version(version),
            )
            .await?;

        if !output.success() {
            return Err(CellarError::Wineboot {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Import a registry script through `regedit /S`. The script file is
    /// removed afterwards whatever the outcome.
    pub async fn import_registry(
        &self,
        prefix: &WinePrefix,
        version: Option<WineVersion>,
        script: &RegistryScript,
    ) -> Result<()> {
        let mut file = tempfile::Builder::new()
            .prefix("winecellar-")
            .suffix(".reg")
            .tempfile()?;
        file.write_all(script.render().as_bytes())?;
        file.as_file().sync_all()?;

        let args = vec!["/S".to_string(), dos_path(file.path())];
        let result = self
            .run_executable(
                Path::new("regedit"),
                &args,
                prefix,
                WineInvocation::with_version(version),
            )
            .await;
        ignore_failure("removing registry script", file.close());

        let output = result?;
        if !output.success() {
            return Err(CellarError::Registry(format!(
                "regedit exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    pub async fn set_windows_version(
        &self,
        prefix: &WinePrefix,
        version: Option<WineVersion>,
        windows: WindowsVersion,
    ) -> Result<()> {
        info!("Setting prefix '{}' to {}", prefix.name, windows.display_name());
        self.import_registry(prefix, version, &windows_version_script(windows))
            .await
    }

    /// Stop every Wine process of the prefix (`wineserver -k`)
    pub async fn kill_wineserver(&self, prefix: &WinePrefix) -> Result<()> {
        let (version, _) = self.resolve(self.version_for(prefix))?;
        let output = self
            .runner
            .run_wine(
                &version.wineserver_binary(),
                &["-k".to_string()],
                &prefix.wine_path(),
                prefix.architecture,
                &HashMap::new(),
                None,
                None,
            )
            .await?;
        debug!("wineserver -k exited with {}", output.exit_code);
        Ok(())
    }

    /// Open one of Wine's built-in programs in `prefix`
    pub async fn open_tool(
        &self,
        prefix: &WinePrefix,
        tool: WineTool,
        output: Option<OutputSink>,
    ) -> Result<ProcessOutput> {
        let invocation = WineInvocation {
            version: self.version_for(prefix),
            output,
            ..WineInvocation::default()
        };
        self.run_executable(Path::new(tool.program()), &[], prefix, invocation)
            .await
    }
}
