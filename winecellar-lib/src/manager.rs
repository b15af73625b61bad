//! Prefix lifecycle: creation, persistence, mutation and teardown
//!
//! [`PrefixManager`] owns the in-memory list of prefixes and is the only
//! writer of their `prefix.json` sidecars. Every mutation is a whole-object
//! read-modify-write followed by an immediate save; there is no version
//! check, so the last writer wins.

use crate::config::SettingsStore;
use crate::error::{ignore_failure, CellarError, Result};
use crate::installer::{self, InstallerType};
use crate::prefix::{InstalledApp, WineArch, WinePrefix, WindowsVersion};
use crate::process::{OutputSink, ProcessOutput};
use crate::registry::dos_path;
use crate::storage::{self, ProgressSink, Storage};
use crate::wine::{WineInvocation, WineRegistry};
use chrono::Utc;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name given to legacy prefixes whose directory is only an id
pub const UNNAMED_PREFIX: &str = "Unnamed Prefix";

/// Parameters for [`PrefixManager::create_prefix`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPrefix {
    pub name: String,
    pub architecture: WineArch,
    pub windows_version: WindowsVersion,
    pub dxvk_enabled: bool,
    /// Pin a toolchain by id or version string
    pub wine_version: Option<String>,
}

impl NewPrefix {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            architecture: WineArch::default(),
            windows_version: WindowsVersion::default(),
            dxvk_enabled: false,
            wine_version: None,
        }
    }
}

pub struct PrefixManager {
    storage: Storage,
    settings: Arc<SettingsStore>,
    wine: Arc<WineRegistry>,
    prefixes: Vec<WinePrefix>,
}

impl PrefixManager {
    pub fn new(storage: Storage, settings: Arc<SettingsStore>, wine: Arc<WineRegistry>) -> Self {
        Self {
            storage,
            settings,
            wine,
            prefixes: Vec::new(),
        }
    }

    /// Known prefixes, most recently used first
    pub fn prefixes(&self) -> &[WinePrefix] {
        &self.prefixes
    }

    pub fn prefix(&self, id: Uuid) -> Option<&WinePrefix> {
        self.prefixes.iter().find(|p| p.id == id)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&WinePrefix> {
        self.prefixes.iter().find(|p| p.name == name)
    }

    /// Resolve a full id or an exact name
    pub fn lookup(&self, query: &str) -> Option<&WinePrefix> {
        match Uuid::parse_str(query) {
            Ok(id) => self.prefix(id),
            Err(_) => self.find_by_name(query),
        }
    }

    fn index_of(&self, id: Uuid) -> Result<usize> {
        self.prefixes
            .iter()
            .position(|p| p.id == id)
            .ok_or(CellarError::PrefixNotFound(id))
    }

    fn require(&self, id: Uuid) -> Result<WinePrefix> {
        Ok(self.prefixes[self.index_of(id)?].clone())
    }

    /// Rebuild the list from the prefixes directory.
    ///
    /// Directories with a readable sidecar are decoded; directories without
    /// one are synthesized by [`legacy_prefix`]. Unreadable sidecars are
    /// skipped with a warning.
    pub async fn load_prefixes(&mut self) -> Result<&[WinePrefix]> {
        let root = self.storage.prefixes_dir();
        let mut loaded = Vec::new();

        if storage::is_dir(&root).await {
            let mut entries = tokio::fs::read_dir(&root).await?;
            while let Some(entry) = entries.next_entry().await? {
                let dir = entry.path();
                if !entry.file_type().await?.is_dir() {
                    continue;
                }

                let metadata = dir.join(crate::prefix::METADATA_FILE);
                if storage::exists(&metadata).await {
                    match storage::read_json::<WinePrefix>(&metadata).await {
                        Ok(mut prefix) => {
                            // Trust the directory over a stale recorded path
                            prefix.path = dir;
                            loaded.push(prefix);
                        }
                        Err(e) => warn!("Skipping prefix with unreadable metadata {:?}: {}", metadata, e),
                    }
                } else {
                    debug!("Synthesizing metadata for legacy prefix {:?}", dir);
                    loaded.push(legacy_prefix(&dir));
                }
            }
        }

        sort_prefixes(&mut loaded);
        info!("Loaded {} prefix(es)", loaded.len());
        self.prefixes = loaded;
        Ok(&self.prefixes)
    }

    /// Create and initialize a prefix.
    ///
    /// If initialization fails the directory is removed again and the
    /// prefix never enters the list.
    pub async fn create_prefix(&mut self, request: NewPrefix) -> Result<WinePrefix> {
        let version = match &request.wine_version {
            Some(query) => Some(
                self.wine
                    .find(query)
                    .ok_or_else(|| CellarError::WineVersionNotFound(query.clone()))?,
            ),
            None => None,
        };

        let id = Uuid::new_v4();
        let mut prefix = WinePrefix::new(id, request.name, self.storage.prefix_dir(id));
        prefix.architecture = request.architecture;
        prefix.windows_version = request.windows_version;
        prefix.dxvk_enabled = request.dxvk_enabled;
        prefix.wine_version = version
            .as_ref()
            .map(|v| v.version.clone())
            .unwrap_or_default();

        info!(
            "Creating prefix '{}' ({}, {}) at {:?}",
            prefix.name,
            prefix.architecture,
            prefix.windows_version.display_name(),
            prefix.path
        );
        tokio::fs::create_dir_all(&prefix.path).await?;

        if let Err(e) = self.initialize(&prefix, version).await {
            warn!("Initialization of prefix '{}' failed: {}", prefix.name, e);
            ignore_failure(
                "removing half-created prefix",
                storage::remove_dir(&prefix.path).await,
            );
            return Err(CellarError::PrefixInitialization(e.to_string()));
        }

        self.prefixes.push(prefix.clone());
        sort_prefixes(&mut self.prefixes);
        Ok(prefix)
    }

    async fn initialize(&self, prefix: &WinePrefix, version: Option<crate::wine::WineVersion>) -> Result<()> {
        self.wine.run_wineboot(prefix, version.clone(), true).await?;
        self.wine
            .set_windows_version(prefix, version, prefix.windows_version)
            .await?;
        persist(prefix).await
    }

    /// Persist `prefix` and replace the cached copy
    pub async fn update_prefix(&mut self, prefix: WinePrefix) -> Result<()> {
        let index = self.index_of(prefix.id)?;
        persist(&prefix).await?;
        self.prefixes[index] = prefix;
        Ok(())
    }

    async fn modify<F>(&mut self, id: Uuid, apply: F) -> Result<WinePrefix>
    where
        F: FnOnce(&mut WinePrefix),
    {
        let mut prefix = self.require(id)?;
        apply(&mut prefix);
        self.update_prefix(prefix.clone()).await?;
        Ok(prefix)
    }

    /// Stop the prefix's processes, then remove it from disk and from the lists
    pub async fn delete_prefix(&mut self, id: Uuid) -> Result<()> {
        let prefix = self.require(id)?;
        info!("Deleting prefix '{}'", prefix.name);

        ignore_failure(
            "stopping Wine processes before delete",
            self.wine.kill_wineserver(&prefix).await,
        );
        storage::remove_dir(&prefix.path).await?;

        self.prefixes.retain(|p| p.id != id);
        self.settings.forget_recent_prefix(id).await?;
        Ok(())
    }

    /// Copy a prefix under a fresh id and name
    pub async fn duplicate_prefix(
        &mut self,
        id: Uuid,
        name: impl Into<String>,
        progress: Option<ProgressSink>,
    ) -> Result<WinePrefix> {
        let source = self.require(id)?;
        let new_id = Uuid::new_v4();
        let mut copy = WinePrefix {
            id: new_id,
            name: name.into(),
            path: self.storage.prefix_dir(new_id),
            created: Utc::now(),
            ..source.clone()
        };
        for app in &mut copy.installed_apps {
            app.id = Uuid::new_v4();
        }

        info!("Duplicating prefix '{}' as '{}'", source.name, copy.name);
        let copied = async {
            storage::copy_dir(&source.path, &copy.path, progress).await?;
            persist(&copy).await
        };
        if let Err(e) = copied.await {
            ignore_failure("removing partial copy", storage::remove_dir(&copy.path).await);
            return Err(e);
        }

        self.prefixes.push(copy.clone());
        sort_prefixes(&mut self.prefixes);
        Ok(copy)
    }

    /// Stamp the prefix as used now and move it to the front of the recent list
    pub async fn record_usage(&mut self, id: Uuid) -> Result<()> {
        self.modify(id, |prefix| prefix.last_used = Some(Utc::now()))
            .await?;
        self.settings.record_recent_prefix(id).await?;
        sort_prefixes(&mut self.prefixes);
        Ok(())
    }

    pub async fn rename_prefix(&mut self, id: Uuid, name: impl Into<String>) -> Result<WinePrefix> {
        let name = name.into();
        self.modify(id, move |prefix| prefix.name = name).await
    }

    pub async fn set_dxvk_enabled(&mut self, id: Uuid, enabled: bool) -> Result<WinePrefix> {
        self.modify(id, |prefix| prefix.dxvk_enabled = enabled).await
    }

    /// Reconfigure the emulated Windows release, then record it
    pub async fn set_windows_version(&mut self, id: Uuid, windows: WindowsVersion) -> Result<WinePrefix> {
        let prefix = self.require(id)?;
        self.wine
            .set_windows_version(&prefix, self.wine.version_for(&prefix), windows)
            .await?;
        self.modify(id, |prefix| prefix.windows_version = windows).await
    }

    /// Bytes used by the prefix directory
    pub async fn prefix_size(&self, id: Uuid) -> Result<u64> {
        let prefix = self.require(id)?;
        storage::dir_size(&prefix.path).await
    }

    pub async fn add_app(&mut self, prefix_id: Uuid, app: InstalledApp) -> Result<InstalledApp> {
        let added = app.clone();
        self.modify(prefix_id, move |prefix| prefix.installed_apps.push(app))
            .await?;
        info!("Added '{}' to prefix {}", added.name, prefix_id);
        Ok(added)
    }

    pub async fn remove_app(&mut self, prefix_id: Uuid, app_id: Uuid) -> Result<()> {
        let prefix = self.require(prefix_id)?;
        if prefix.app(app_id).is_none() {
            return Err(CellarError::AppNotFound(app_id));
        }
        self.modify(prefix_id, |prefix| {
            prefix.installed_apps.retain(|app| app.id != app_id)
        })
        .await?;
        Ok(())
    }

    /// Replace an app entry in place, keeping its position
    pub async fn update_app(&mut self, prefix_id: Uuid, app: InstalledApp) -> Result<()> {
        let prefix = self.require(prefix_id)?;
        let index = prefix
            .installed_apps
            .iter()
            .position(|existing| existing.id == app.id)
            .ok_or(CellarError::AppNotFound(app.id))?;
        self.modify(prefix_id, move |prefix| prefix.installed_apps[index] = app)
            .await?;
        Ok(())
    }

    /// Record the launch, then run the app under Wine
    pub async fn launch_app(
        &mut self,
        prefix_id: Uuid,
        app_id: Uuid,
        output: Option<OutputSink>,
    ) -> Result<ProcessOutput> {
        let prefix = self.require(prefix_id)?;
        if !prefix.is_valid() {
            return Err(CellarError::PrefixNotReady(prefix.name));
        }
        let app = prefix
            .app(app_id)
            .ok_or(CellarError::AppNotFound(app_id))?
            .with_launch_recorded();

        self.update_app(prefix_id, app.clone()).await?;
        self.record_usage(prefix_id).await?;

        let prefix = self.require(prefix_id)?;
        let invocation = WineInvocation {
            version: self.wine.version_for(&prefix),
            environment: app.environment.clone(),
            working_directory: app.working_directory_in(&prefix).filter(|dir| dir.is_dir()),
            output,
        };
        info!("Launching '{}' from prefix '{}'", app.name, prefix.name);
        self.wine
            .run_executable(&app.full_path(&prefix), &app.arguments, &prefix, invocation)
            .await
    }

    /// Run an arbitrary Windows program in the prefix
    pub async fn run_program(
        &mut self,
        prefix_id: Uuid,
        executable: &Path,
        args: &[String],
        output: Option<OutputSink>,
    ) -> Result<ProcessOutput> {
        let prefix = self.require(prefix_id)?;
        if !prefix.is_valid() {
            return Err(CellarError::PrefixNotReady(prefix.name));
        }
        self.record_usage(prefix_id).await?;

        let invocation = WineInvocation {
            version: self.wine.version_for(&prefix),
            working_directory: executable
                .parent()
                .filter(|dir| dir.is_dir())
                .map(Path::to_path_buf),
            output,
            ..WineInvocation::default()
        };
        self.wine
            .run_executable(executable, args, &prefix, invocation)
            .await
    }

    /// Run a Windows installer, unattended if requested.
    ///
    /// MSI packages go through `msiexec /i`. Finding the installed program
    /// afterwards is left to the user.
    pub async fn run_installer(
        &mut self,
        prefix_id: Uuid,
        installer_path: &Path,
        unattended: bool,
        output: Option<OutputSink>,
    ) -> Result<ProcessOutput> {
        let kind = installer::detect(installer_path);
        let switches = installer::silent_switches(kind, unattended);
        info!(
            "Running {} installer {:?} (unattended: {})",
            kind.display_name(),
            installer_path,
            unattended
        );

        let (executable, args) = match kind {
            InstallerType::Msi => {
                let mut args = vec!["/i".to_string(), dos_path(installer_path)];
                args.extend(switches);
                (PathBuf::from("msiexec"), args)
            }
            _ => (installer_path.to_path_buf(), switches),
        };
        self.run_program(prefix_id, &executable, &args, output).await
    }
}

async fn persist(prefix: &WinePrefix) -> Result<()> {
    storage::write_json(&prefix.metadata_path(), prefix).await
}

/// Default record for a prefix directory without metadata.
///
/// An id-shaped directory name becomes the id with a placeholder name;
/// any other name is capitalized and used as the display name.
pub fn legacy_prefix(dir: &Path) -> WinePrefix {
    let dir_name = dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    match Uuid::parse_str(&dir_name) {
        Ok(id) => WinePrefix::new(id, UNNAMED_PREFIX, dir),
        Err(_) => WinePrefix::new(Uuid::new_v4(), capitalize(&dir_name), dir),
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Last used first, never-used after used, then by name
pub fn sort_prefixes(prefixes: &mut [WinePrefix]) {
    prefixes.sort_by(|a, b| match (a.last_used, b.last_used) {
        (Some(x), Some(y)) => y.cmp(&x).then_with(|| a.name.cmp(&b.name)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.name.cmp(&b.name),
    });
}
