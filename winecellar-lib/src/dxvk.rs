//! DXVK installation into prefixes

use crate::config::SettingsStore;
use crate::download::{extract_archive, DownloadManager};
use crate::error::{ignore_failure, CellarError, Result};
use crate::prefix::{WineArch, WinePrefix};
use crate::process::ProcessRunner;
use crate::registry::RegistryScript;
use crate::storage::{self, ProgressSink, Storage};
use crate::wine::WineRegistry;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// DLLs replaced by DXVK: Direct3D 9/10/11 and the DXGI swap chain
pub const DXVK_DLLS: [&str; 4] = ["d3d9", "d3d10core", "d3d11", "dxgi"];

/// A `dxgi.dll` larger than this is DXVK rather than Wine's builtin stub
pub const INSTALLED_SIZE_THRESHOLD: u64 = 200_000;

const DLL_OVERRIDES_KEY: &str = r"HKEY_CURRENT_USER\Software\Wine\DllOverrides";

/// DXVK_LOG_LEVEL values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DxvkLogLevel {
    #[default]
    #[serde(rename = "none")]
    Off,
    Error,
    Warn,
    Info,
    Debug,
}

impl DxvkLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DxvkLogLevel::Off => "none",
            DxvkLogLevel::Error => "error",
            DxvkLogLevel::Warn => "warn",
            DxvkLogLevel::Info => "info",
            DxvkLogLevel::Debug => "debug",
        }
    }
}

/// Elements accepted by DXVK_HUD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DxvkHudElement {
    Fps,
    Frametimes,
    Devinfo,
    Memory,
    Gpuload,
    Version,
    Api,
    Compiler,
}

impl DxvkHudElement {
    pub const ALL: [DxvkHudElement; 8] = [
        DxvkHudElement::Fps,
        DxvkHudElement::Frametimes,
        DxvkHudElement::Devinfo,
        DxvkHudElement::Memory,
        DxvkHudElement::Gpuload,
        DxvkHudElement::Version,
        DxvkHudElement::Api,
        DxvkHudElement::Compiler,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DxvkHudElement::Fps => "fps",
            DxvkHudElement::Frametimes => "frametimes",
            DxvkHudElement::Devinfo => "devinfo",
            DxvkHudElement::Memory => "memory",
            DxvkHudElement::Gpuload => "gpuload",
            DxvkHudElement::Version => "version",
            DxvkHudElement::Api => "api",
            DxvkHudElement::Compiler => "compiler",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            DxvkHudElement::Fps => "Frame Rate",
            DxvkHudElement::Frametimes => "Frame Times",
            DxvkHudElement::Devinfo => "Device Info",
            DxvkHudElement::Memory => "Memory Usage",
            DxvkHudElement::Gpuload => "GPU Load",
            DxvkHudElement::Version => "DXVK Version",
            DxvkHudElement::Api => "Graphics API",
            DxvkHudElement::Compiler => "Shader Compiler",
        }
    }
}

/// Downloads, caches and installs DXVK releases
pub struct DxvkInstaller {
    runner: ProcessRunner,
    downloader: Arc<DownloadManager>,
    storage: Storage,
    settings: Arc<SettingsStore>,
    wine: Arc<WineRegistry>,
}

impl DxvkInstaller {
    pub fn new(
        runner: ProcessRunner,
        downloader: Arc<DownloadManager>,
        storage: Storage,
        settings: Arc<SettingsStore>,
        wine: Arc<WineRegistry>,
    ) -> Self {
        Self {
            runner,
            downloader,
            storage,
            settings,
            wine,
        }
    }

    /// Install DXVK `version` into `prefix`.
    ///
    /// The release archive and its extracted tree are cached and reused.
    pub async fn install(&self, version: &str, prefix: &WinePrefix, progress: Option<ProgressSink>) -> Result<()> {
        let report = |fraction: f64| {
            if let Some(progress) = &progress {
                progress(fraction);
            }
        };
        info!("Installing DXVK {} into prefix '{}'", version, prefix.name);
        report(0.1);

        let archive = self
            .storage
            .downloads_dir()
            .join(format!("dxvk-{}.tar.gz", version));
        if !storage::exists(&archive).await {
            let url = self.settings.snapshot().dxvk_url(version);
            let scaled: Option<ProgressSink> = progress
                .clone()
                .map(|sink| Arc::new(move |f: f64| sink(0.1 + f * 0.3)) as ProgressSink);
            self.downloader
                .download(&url, &archive, scaled)
                .await
                .map_err(|e| CellarError::DxvkDownload(e.to_string()))?;
        } else {
            debug!("Using cached DXVK archive {:?}", archive);
        }
        report(0.4);

        let extracted = self.storage.dxvk_dir(version);
        if release_complete(&extracted).await {
            debug!("Using cached DXVK release {:?}", extracted);
        } else if let Err(e) = self.extract(&archive, &extracted).await {
            // Neither may be reused: the next attempt starts from a fresh download
            if storage::exists(&extracted).await {
                ignore_failure("removing partial DXVK extraction", storage::remove_dir(&extracted).await);
            }
            ignore_failure("removing DXVK archive", tokio::fs::remove_file(&archive).await);
            return Err(e);
        }

        match prefix.architecture {
            WineArch::Win64 => {
                copy_dlls(&extracted.join("x64"), &prefix.system32_path()).await?;
                if storage::is_dir(&prefix.syswow64_path()).await {
                    copy_dlls(&extracted.join("x32"), &prefix.syswow64_path()).await?;
                }
            }
            WineArch::Win32 => {
                copy_dlls(&extracted.join("x32"), &prefix.system32_path()).await?;
            }
        }
        report(0.8);

        let mut script = RegistryScript::new();
        for dll in DXVK_DLLS {
            script.set_string(DLL_OVERRIDES_KEY, dll, "native");
        }
        self.wine
            .import_registry(prefix, self.wine.version_for(prefix), &script)
            .await?;

        report(1.0);
        info!("DXVK {} installed into prefix '{}'", version, prefix.name);
        Ok(())
    }

    async fn extract(&self, archive: &Path, extracted: &Path) -> Result<()> {
        if storage::exists(extracted).await {
            debug!("Discarding incomplete DXVK release {:?}", extracted);
            storage::remove_dir(extracted)
                .await
                .map_err(|e| CellarError::DxvkExtraction(e.to_string()))?;
        }
        extract_archive(&self.runner, archive, &self.storage.cache_dir())
            .await
            .map_err(|e| CellarError::DxvkExtraction(e.to_string()))?;

        if !release_complete(extracted).await {
            return Err(CellarError::DxvkExtraction(format!(
                "archive did not contain a complete {:?}",
                extracted.file_name().unwrap_or_default()
            )));
        }
        Ok(())
    }

    /// Remove the DXVK DLLs and their overrides. Nothing here is fatal.
    pub async fn uninstall(&self, prefix: &WinePrefix) -> Result<()> {
        for dir in [prefix.system32_path(), prefix.syswow64_path()] {
            for dll in DXVK_DLLS {
                let path = dir.join(format!("{}.dll", dll));
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => debug!("Removed {:?}", path),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => ignore_failure(&format!("removing {:?}", path), Err::<(), _>(e)),
                }
            }
        }

        let mut script = RegistryScript::new();
        for dll in DXVK_DLLS {
            script.delete(DLL_OVERRIDES_KEY, dll);
        }
        ignore_failure(
            "removing DXVK DLL overrides",
            self.wine
                .import_registry(prefix, self.wine.version_for(prefix), &script)
                .await,
        );

        info!("DXVK removed from prefix '{}'", prefix.name);
        Ok(())
    }

    pub async fn is_installed(&self, prefix: &WinePrefix) -> bool {
        is_installed(prefix).await
    }
}

/// Size heuristic on `system32/dxgi.dll`
pub async fn is_installed(prefix: &WinePrefix) -> bool {
    match tokio::fs::metadata(prefix.system32_path().join("dxgi.dll")).await {
        Ok(metadata) => metadata.is_file() && metadata.len() > INSTALLED_SIZE_THRESHOLD,
        Err(_) => false,
    }
}

/// Both architecture directories carry every DLL
async fn release_complete(extracted: &Path) -> bool {
    for arch in ["x64", "x32"] {
        for dll in DXVK_DLLS {
            let path = extracted.join(arch).join(format!("{}.dll", dll));
            match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.is_file() => {}
                _ => return false,
            }
        }
    }
    true
}

async fn copy_dlls(source: &Path, destination: &Path) -> Result<()> {
    tokio::fs::create_dir_all(destination)
        .await
        .map_err(|e| CellarError::DxvkInstallation(format!("{:?}: {}", destination, e)))?;

    for dll in DXVK_DLLS {
        let name = format!("{}.dll", dll);
        let from = source.join(&name);
        let to = destination.join(&name);
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| CellarError::DxvkInstallation(format!("copying {:?}: {}", from, e)))?;
    }
    debug!("Copied DXVK DLLs from {:?} to {:?}", source, destination);
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{fake_wine, serve_once, settings_store};
    use crate::wine::SearchPaths;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Fixture {
        _dir: TempDir,
        storage: Storage,
        settings: Arc<SettingsStore>,
        installer: DxvkInstaller,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        storage.ensure_directories().await.unwrap();
        fake_wine(&storage.wine_dir().join("stable"), "wine-9.0");

        let settings = settings_store(dir.path());
        let wine = Arc::new(WineRegistry::new(
            ProcessRunner::new(),
            settings.clone(),
            SearchPaths::managed_only(storage.wine_dir()),
        ));
        wine.detect().await.unwrap();

        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        let downloader = Arc::new(DownloadManager::with_client(client, storage.downloads_dir()));
        let installer = DxvkInstaller::new(
            ProcessRunner::new(),
            downloader,
            storage.clone(),
            settings.clone(),
            wine,
        );
        Fixture {
            _dir: dir,
            storage,
            settings,
            installer,
        }
    }

    fn prefix(storage: &Storage, arch: WineArch) -> WinePrefix {
        let id = Uuid::new_v4();
        let mut prefix = WinePrefix::new(id, "Games", storage.prefix_dir(id));
        prefix.architecture = arch;
        std::fs::create_dir_all(prefix.system32_path()).unwrap();
        if arch == WineArch::Win64 {
            std::fs::create_dir_all(prefix.syswow64_path()).unwrap();
        }
        prefix
    }

    fn seed_release(storage: &Storage, version: &str) {
        let root = storage.dxvk_dir(version);
        for (arch, size) in [("x64", 300_000), ("x32", 250_000)] {
            let dir = root.join(arch);
            std::fs::create_dir_all(&dir).unwrap();
            for dll in DXVK_DLLS {
                std::fs::write(dir.join(format!("{}.dll", dll)), vec![0u8; size]).unwrap();
            }
        }
        std::fs::write(
            storage.downloads_dir().join(format!("dxvk-{}.tar.gz", version)),
            b"cached",
        )
        .unwrap();
    }

    /// A gzipped release tarball laid out like the upstream ones
    fn release_archive(version: &str) -> Vec<u8> {
        let staging = TempDir::new().unwrap();
        let top = format!("dxvk-{}", version);
        for (arch, size) in [("x64", 300_000usize), ("x32", 250_000)] {
            let dir = staging.path().join(&top).join(arch);
            std::fs::create_dir_all(&dir).unwrap();
            for (i, dll) in DXVK_DLLS.iter().enumerate() {
                let body: Vec<u8> = (0..size).map(|n| (n * 31 + i * 7) as u8).collect();
                std::fs::write(dir.join(format!("{}.dll", dll)), body).unwrap();
            }
        }
        let archive = staging.path().join("release.tar.gz");
        let status = std::process::Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(staging.path())
            .arg(&top)
            .status()
            .unwrap();
        assert!(status.success());
        std::fs::read(&archive).unwrap()
    }

    fn assert_dlls_installed(prefix: &WinePrefix) {
        for dll in DXVK_DLLS {
            let name = format!("{}.dll", dll);
            assert_eq!(
                std::fs::metadata(prefix.system32_path().join(&name)).unwrap().len(),
                300_000
            );
            assert_eq!(
                std::fs::metadata(prefix.syswow64_path().join(&name)).unwrap().len(),
                250_000
            );
        }
    }

    #[test]
    fn log_level_serializes_off_as_none() {
        assert_eq!(serde_json::to_string(&DxvkLogLevel::Off).unwrap(), "\"none\"");
        assert_eq!(
            serde_json::from_str::<DxvkLogLevel>("\"warn\"").unwrap(),
            DxvkLogLevel::Warn
        );
        assert_eq!(DxvkHudElement::ALL.len(), 8);
    }

    #[tokio::test]
    async fn size_threshold_boundary() {
        let f = fixture().await;
        let prefix = prefix(&f.storage, WineArch::Win64);
        let dxgi = prefix.system32_path().join("dxgi.dll");

        assert!(!f.installer.is_installed(&prefix).await);
        for (size, expected) in [(199_999, false), (200_000, false), (200_001, true)] {
            std::fs::write(&dxgi, vec![0u8; size]).unwrap();
            assert_eq!(f.installer.is_installed(&prefix).await, expected, "size {}", size);
        }
    }

    #[tokio::test]
    async fn install_from_cache_copies_both_architectures() {
        let f = fixture().await;
        seed_release(&f.storage, "2.3");
        let prefix = prefix(&f.storage, WineArch::Win64);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: ProgressSink = {
            let seen = seen.clone();
            Arc::new(move |p: f64| seen.lock().unwrap().push(p))
        };
        f.installer.install("2.3", &prefix, Some(sink)).await.unwrap();

        for dll in DXVK_DLLS {
            let name = format!("{}.dll", dll);
            assert_eq!(
                std::fs::metadata(prefix.system32_path().join(&name)).unwrap().len(),
                300_000
            );
            assert_eq!(
                std::fs::metadata(prefix.syswow64_path().join(&name)).unwrap().len(),
                250_000
            );
        }
        assert!(f.installer.is_installed(&prefix).await);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![0.1, 0.4, 0.8, 1.0]);
    }

    #[tokio::test]
    async fn win32_prefix_gets_32_bit_dlls() {
        let f = fixture().await;
        seed_release(&f.storage, "2.3");
        let prefix = prefix(&f.storage, WineArch::Win32);

        f.installer.install("2.3", &prefix, None).await.unwrap();
        assert_eq!(
            std::fs::metadata(prefix.system32_path().join("dxgi.dll")).unwrap().len(),
            250_000
        );
        assert!(!prefix.syswow64_path().exists());
    }

    #[tokio::test]
    async fn cached_archive_is_extracted() {
        let f = fixture().await;
        std::fs::write(
            f.storage.downloads_dir().join("dxvk-2.3.tar.gz"),
            release_archive("2.3"),
        )
        .unwrap();
        let prefix = prefix(&f.storage, WineArch::Win64);

        f.installer.install("2.3", &prefix, None).await.unwrap();

        assert_dlls_installed(&prefix);
        assert!(release_complete(&f.storage.dxvk_dir("2.3")).await);
    }

    #[tokio::test]
    async fn missing_archive_is_downloaded() {
        let f = fixture().await;
        let url = serve_once("dxvk-2.4.tar.gz", release_archive("2.4")).await;
        f.settings
            .update(move |s| s.dxvk_url_template = url)
            .await
            .unwrap();
        let prefix = prefix(&f.storage, WineArch::Win64);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: ProgressSink = {
            let seen = seen.clone();
            Arc::new(move |p: f64| seen.lock().unwrap().push(p))
        };
        f.installer.install("2.4", &prefix, Some(sink)).await.unwrap();

        assert_dlls_installed(&prefix);
        assert!(f.storage.downloads_dir().join("dxvk-2.4.tar.gz").is_file());
        let seen = seen.lock().unwrap().clone();
        assert!(seen.windows(2).all(|pair| pair[0] <= pair[1]), "{:?}", seen);
        assert_eq!(seen.last(), Some(&1.0));
    }

    #[tokio::test]
    async fn truncated_archive_does_not_poison_the_cache() {
        let f = fixture().await;
        let good = release_archive("9.8");
        let archive = f.storage.downloads_dir().join("dxvk-9.8.tar.gz");
        std::fs::write(&archive, &good[..good.len() / 2]).unwrap();
        let prefix = prefix(&f.storage, WineArch::Win64);

        let result = f.installer.install("9.8", &prefix, None).await;
        assert!(matches!(result, Err(CellarError::DxvkExtraction(_))), "{:?}", result);
        assert!(!f.storage.dxvk_dir("9.8").exists());
        assert!(!archive.exists());

        std::fs::write(&archive, &good).unwrap();
        f.installer.install("9.8", &prefix, None).await.unwrap();
        assert_dlls_installed(&prefix);
    }

    #[tokio::test]
    async fn incomplete_cache_is_extracted_again() {
        let f = fixture().await;
        seed_release(&f.storage, "2.3");
        std::fs::remove_file(f.storage.dxvk_dir("2.3").join("x64").join("d3d11.dll")).unwrap();
        std::fs::write(
            f.storage.downloads_dir().join("dxvk-2.3.tar.gz"),
            release_archive("2.3"),
        )
        .unwrap();
        let prefix = prefix(&f.storage, WineArch::Win64);

        f.installer.install("2.3", &prefix, None).await.unwrap();
        assert_dlls_installed(&prefix);
    }

    #[tokio::test]
    async fn copy_failure_is_installation_error() {
        let f = fixture().await;
        seed_release(&f.storage, "2.3");
        let prefix = prefix(&f.storage, WineArch::Win64);
        std::fs::create_dir_all(prefix.system32_path().join("d3d9.dll").join("occupied")).unwrap();

        let result = f.installer.install("2.3", &prefix, None).await;
        assert!(matches!(result, Err(CellarError::DxvkInstallation(_))));
    }

    #[tokio::test]
    async fn corrupt_archive_is_extraction_error() {
        let f = fixture().await;
        let archive = f.storage.downloads_dir().join("dxvk-9.9.tar.gz");
        std::fs::write(&archive, b"junk").unwrap();
        let prefix = prefix(&f.storage, WineArch::Win64);

        let result = f.installer.install("9.9", &prefix, None).await;
        assert!(matches!(result, Err(CellarError::DxvkExtraction(_))));
        assert!(!archive.exists());
    }

    #[tokio::test]
    async fn uninstall_tolerates_missing_files() {
        let f = fixture().await;
        seed_release(&f.storage, "2.3");
        let prefix = prefix(&f.storage, WineArch::Win64);

        f.installer.uninstall(&prefix).await.unwrap();

        f.installer.install("2.3", &prefix, None).await.unwrap();
        std::fs::remove_file(prefix.syswow64_path().join("d3d9.dll")).unwrap();
        f.installer.uninstall(&prefix).await.unwrap();

        assert!(!f.installer.is_installed(&prefix).await);
        for dll in DXVK_DLLS {
            assert!(!prefix.system32_path().join(format!("{}.dll", dll)).exists());
            assert!(!prefix.syswow64_path().join(format!("{}.dll", dll)).exists());
        }
    }

    #[tokio::test]
    async fn uninstall_skips_dlls_it_cannot_remove() {
        let f = fixture().await;
        seed_release(&f.storage, "2.3");
        let prefix = prefix(&f.storage, WineArch::Win64);
        f.installer.install("2.3", &prefix, None).await.unwrap();

        let stuck = prefix.syswow64_path().join("d3d9.dll");
        std::fs::remove_file(&stuck).unwrap();
        std::fs::create_dir_all(stuck.join("occupied")).unwrap();

        f.installer.uninstall(&prefix).await.unwrap();

        assert!(stuck.is_dir());
        assert!(!prefix.system32_path().join("dxgi.dll").exists());
        assert!(!prefix.syswow64_path().join("dxgi.dll").exists());
    }
}
