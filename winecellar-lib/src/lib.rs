//! WineCellar Library
//!
//! Core of WineCellar: creates and maintains Wine prefixes, drives Wine,
//! winetricks and installers against them, installs DXVK and runs Steam.

pub mod cellar;
pub mod config;
pub mod download;
pub mod dxvk;
pub mod error;
pub mod installer;
pub mod manager;
pub mod prefix;
pub mod process;
pub mod registry;
pub mod steam;
pub mod storage;
pub mod wine;
pub mod winetricks;

#[cfg(all(test, unix))]
mod test_support;

pub use cellar::{Bundle, WineCellar};
pub use config::{Settings, SettingsStore};
pub use error::{CellarError, Result};
pub use manager::{NewPrefix, PrefixManager};
pub use prefix::{InstalledApp, WineArch, WinePrefix, WindowsVersion};
pub use process::{OutputSink, ProcessOutput, ProcessRunner};
pub use steam::{SteamGame, SteamLibrary, SteamManager};
pub use storage::{ProgressSink, Storage};
pub use wine::{WineRegistry, WineSource, WineTool, WineVersion};
pub use winetricks::{InstallReport, VerbCategory, Winetricks, WinetricksVerb};
