//! Wine prefix and installed application models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Metadata sidecar stored next to the Wine environment
pub const METADATA_FILE: &str = "prefix.json";

/// Guest Windows architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WineArch {
    #[default]
    #[serde(rename = "win64")]
    Win64,
    #[serde(rename = "win32")]
    Win32,
}

impl WineArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            WineArch::Win64 => "win64",
            WineArch::Win32 => "win32",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            WineArch::Win64 => "64-bit",
            WineArch::Win32 => "32-bit",
        }
    }
}

impl fmt::Display for WineArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WineArch {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "win64" | "64" => Ok(WineArch::Win64),
            "win32" | "32" => Ok(WineArch::Win32),
            _ => Err(format!("Unknown architecture: {}", s)),
        }
    }
}

/// Version strings Wine reports for an emulated Windows release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowsVersionInfo {
    pub current_version: &'static str,
    pub build_number: &'static str,
    pub product_name: &'static str,
    pub csd_version: &'static str,
    /// Set for releases that report `CurrentMajorVersionNumber`
    pub major_version: Option<u32>,
}

/// Guest Windows release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum WindowsVersion {
    #[serde(rename = "win11")]
    Win11,
    #[default]
    #[serde(rename = "win10")]
    Win10,
    #[serde(rename = "win81")]
    Win81,
    #[serde(rename = "win8")]
    Win8,
    #[serde(rename = "win7")]
    Win7,
    #[serde(rename = "winxp")]
    WinXp,
}

impl WindowsVersion {
    pub const ALL: [WindowsVersion; 6] = [
        WindowsVersion::Win11,
        WindowsVersion::Win10,
        WindowsVersion::Win81,
        WindowsVersion::Win8,
        WindowsVersion::Win7,
        WindowsVersion::WinXp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowsVersion::Win11 => "win11",
            WindowsVersion::Win10 => "win10",
            WindowsVersion::Win81 => "win81",
            WindowsVersion::Win8 => "win8",
            WindowsVersion::Win7 => "win7",
            WindowsVersion::WinXp => "winxp",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            WindowsVersion::Win11 => "Windows 11",
            WindowsVersion::Win10 => "Windows 10",
            WindowsVersion::Win81 => "Windows 8.1",
            WindowsVersion::Win8 => "Windows 8",
            WindowsVersion::Win7 => "Windows 7",
            WindowsVersion::WinXp => "Windows XP",
        }
    }

    pub fn registry_info(&self) -> WindowsVersionInfo {
        match self {
            WindowsVersion::Win11 => WindowsVersionInfo {
                current_version: "6.3",
                build_number: "22000",
                product_name: "Windows 11 Pro",
                csd_version: "",
                major_version: Some(10),
            },
            WindowsVersion::Win10 => WindowsVersionInfo {
                current_version: "6.3",
                build_number: "19045",
                product_name: "Windows 10 Pro",
                csd_version: "",
                major_version: Some(10),
            },
            WindowsVersion::Win81 => WindowsVersionInfo {
                current_version: "6.3",
                build_number: "9600",
                product_name: "Windows 8.1 Pro",
                csd_version: "",
                major_version: None,
            },
            WindowsVersion::Win8 => WindowsVersionInfo {
                current_version: "6.2",
                build_number: "9200",
                product_name: "Windows 8 Pro",
                csd_version: "",
                major_version: None,
            },
            WindowsVersion::Win7 => WindowsVersionInfo {
                current_version: "6.1",
                build_number: "7601",
                product_name: "Windows 7 Professional",
                csd_version: "Service Pack 1",
                major_version: None,
            },
            WindowsVersion::WinXp => WindowsVersionInfo {
                current_version: "5.1",
                build_number: "2600",
                product_name: "Microsoft Windows XP",
                csd_version: "Service Pack 3",
                major_version: None,
            },
        }
    }
}

impl fmt::Display for WindowsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowsVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        WindowsVersion::ALL
            .into_iter()
            .find(|v| v.as_str() == s)
            .ok_or_else(|| format!("Unknown Windows version: {}", s))
    }
}

/// A Windows application installed inside a prefix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstalledApp {
    pub id: Uuid,
    pub name: String,

    /// Relative to the prefix's `drive_c`
    pub executable_path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,

    #[serde(default)]
    pub arguments: Vec<String>,

    #[serde(default)]
    pub environment: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon_path: Option<PathBuf>,

    /// Install timestamp
    pub installed: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_launched: Option<DateTime<Utc>>,

    #[serde(default)]
    pub launch_count: u32,
}

impl InstalledApp {
    pub fn new(name: impl Into<String>, executable_path: impl AsRef<str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            executable_path: normalize_relative(executable_path.as_ref()),
            working_directory: None,
            arguments: Vec::new(),
            environment: HashMap::new(),
            icon_path: None,
            installed: Utc::now(),
            last_launched: None,
            launch_count: 0,
        }
    }

    /// Build an entry from an absolute path inside the prefix's `drive_c`.
    /// Returns `None` for paths outside the drive.
    pub fn from_absolute(name: impl Into<String>, prefix: &WinePrefix, absolute: &Path) -> Option<Self> {
        let relative = pathdiff::diff_paths(absolute, prefix.drive_c())?;
        if relative.starts_with("..") {
            return None;
        }
        Some(Self::new(name, relative.to_string_lossy()))
    }

    /// Copy with the launch counter bumped and the launch time set to now
    pub fn with_launch_recorded(&self) -> Self {
        Self {
            last_launched: Some(Utc::now()),
            launch_count: self.launch_count + 1,
            ..self.clone()
        }
    }

    pub fn is_steam(&self) -> bool {
        Path::new(&self.executable_path)
            .file_name()
            .map(|name| name.to_string_lossy().eq_ignore_ascii_case("steam.exe"))
            .unwrap_or(false)
    }

    /// Absolute path of the executable inside `prefix`
    pub fn full_path(&self, prefix: &WinePrefix) -> PathBuf {
        prefix.drive_c().join(&self.executable_path)
    }

    /// Absolute working directory, defaulting to the executable's folder
    pub fn working_directory_in(&self, prefix: &WinePrefix) -> Option<PathBuf> {
        match &self.working_directory {
            Some(dir) => Some(prefix.drive_c().join(normalize_relative(dir))),
            None => self.full_path(prefix).parent().map(Path::to_path_buf),
        }
    }
}

/// Strip leading separators and turn Windows separators into Unix ones
fn normalize_relative(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// An isolated Windows environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WinePrefix {
    pub id: Uuid,
    pub name: String,

    /// Parent of the `wine/` environment root
    pub path: PathBuf,

    /// Pinned toolchain version; empty means the configured default
    #[serde(default)]
    pub wine_version: String,

    pub architecture: WineArch,
    pub windows_version: WindowsVersion,

    #[serde(default)]
    pub dxvk_enabled: bool,

    #[serde(default)]
    pub environment: HashMap<String, String>,

    #[serde(default)]
    pub installed_apps: Vec<InstalledApp>,

    pub created: DateTime<Utc>,

    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

impl WinePrefix {
    pub fn new(id: Uuid, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            path: path.into(),
            wine_version: String::new(),
            architecture: WineArch::default(),
            windows_version: WindowsVersion::default(),
            dxvk_enabled: false,
            environment: HashMap::new(),
            installed_apps: Vec::new(),
            created: Utc::now(),
            last_used: None,
        }
    }

    /// The WINEPREFIX proper
    pub fn wine_path(&self) -> PathBuf {
        self.path.join("wine")
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.path.join(METADATA_FILE)
    }

    pub fn drive_c(&self) -> PathBuf {
        self.wine_path().join("drive_c")
    }

    pub fn program_files_path(&self) -> PathBuf {
        match self.architecture {
            WineArch::Win64 => self.drive_c().join("Program Files"),
            WineArch::Win32 => self.drive_c().join("Program Files (x86)"),
        }
    }

    /// Native system directory (64-bit on win64, 32-bit on win32)
    pub fn system32_path(&self) -> PathBuf {
        self.drive_c().join("windows").join("system32")
    }

    /// 32-bit system directory of a 64-bit prefix
    pub fn syswow64_path(&self) -> PathBuf {
        self.drive_c().join("windows").join("syswow64")
    }

    /// Whether the Wine environment exists and can run programs
    pub fn is_valid(&self) -> bool {
        self.wine_path().is_dir()
    }

    pub fn app(&self, id: Uuid) -> Option<&InstalledApp> {
        self.installed_apps.iter().find(|app| app.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix(arch: WineArch) -> WinePrefix {
        let mut prefix = WinePrefix::new(Uuid::new_v4(), "Games", "/cellar/prefixes/x");
        prefix.architecture = arch;
        prefix
    }

    #[test]
    fn program_files_depends_on_architecture() {
        assert_eq!(
            prefix(WineArch::Win64).program_files_path(),
            PathBuf::from("/cellar/prefixes/x/wine/drive_c/Program Files")
        );
        assert_eq!(
            prefix(WineArch::Win32).program_files_path(),
            PathBuf::from("/cellar/prefixes/x/wine/drive_c/Program Files (x86)")
        );
    }

    #[test]
    fn launch_recording_is_a_pure_copy() {
        let app = InstalledApp::new("Game", "Games/game.exe");
        let launched = app.with_launch_recorded();

        assert_eq!(app.launch_count, 0);
        assert!(app.last_launched.is_none());
        assert_eq!(launched.launch_count, 1);
        let when = launched.last_launched.unwrap();
        assert!((Utc::now() - when).num_seconds().abs() < 5);
        assert_eq!(launched.id, app.id);

        let again = launched.with_launch_recorded();
        assert_eq!(again.launch_count, 2);
        assert!(again.last_launched.unwrap() >= when);
    }

    #[test]
    fn steam_detection_uses_file_name_only() {
        assert!(InstalledApp::new("Steam", "Program Files (x86)/Steam/steam.exe").is_steam());
        assert!(InstalledApp::new("Steam", "Steam/STEAM.EXE").is_steam());
        assert!(!InstalledApp::new("Other", "steam.exe/launcher.exe").is_steam());
        assert!(!InstalledApp::new("Helper", "Steam/steamwebhelper.exe").is_steam());
    }

    #[test]
    fn executable_paths_are_always_relative() {
        let app = InstalledApp::new("Tool", "/Program Files\\Tool\\tool.exe");
        assert_eq!(app.executable_path, "Program Files/Tool/tool.exe");

        let prefix = prefix(WineArch::Win64);
        assert_eq!(
            app.full_path(&prefix),
            PathBuf::from("/cellar/prefixes/x/wine/drive_c/Program Files/Tool/tool.exe")
        );
        assert_eq!(
            app.working_directory_in(&prefix),
            Some(PathBuf::from("/cellar/prefixes/x/wine/drive_c/Program Files/Tool"))
        );
    }

    #[test]
    fn absolute_paths_are_made_relative_to_drive_c() {
        let prefix = prefix(WineArch::Win64);
        let inside = prefix.drive_c().join("Games/run.exe");
        let app = InstalledApp::from_absolute("Run", &prefix, &inside).unwrap();
        assert_eq!(app.executable_path, "Games/run.exe");

        assert!(InstalledApp::from_absolute("Elsewhere", &prefix, Path::new("/usr/bin/true")).is_none());
    }

    #[test]
    fn json_uses_expected_field_names() {
        let mut prefix = prefix(WineArch::Win32);
        prefix.windows_version = WindowsVersion::Win81;
        prefix.installed_apps.push(InstalledApp::new("App", "app.exe"));

        let value = serde_json::to_value(&prefix).unwrap();
        assert_eq!(value["architecture"], "win32");
        assert_eq!(value["windowsVersion"], "win81");
        assert_eq!(value["dxvkEnabled"], false);
        assert_eq!(value["wineVersion"], "");
        assert!(value["lastUsed"].is_null());
        assert_eq!(value["installedApps"][0]["executablePath"], "app.exe");
        assert_eq!(value["installedApps"][0]["launchCount"], 0);

        let back: WinePrefix = serde_json::from_value(value).unwrap();
        assert_eq!(back, prefix);
    }

    #[test]
    fn windows_versions_parse_from_raw_values() {
        for version in WindowsVersion::ALL {
            assert_eq!(version.as_str().parse::<WindowsVersion>().unwrap(), version);
        }
        assert!("win95".parse::<WindowsVersion>().is_err());
        assert_eq!(WindowsVersion::Win7.registry_info().csd_version, "Service Pack 1");
    }
}
