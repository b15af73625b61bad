//! On-disk layout and filesystem primitives
//!
//! Everything WineCellar persists lives below a single application-support
//! root:
//!
//! ```text
//! <root>/prefixes/<prefix-id>/prefix.json
//! <root>/prefixes/<prefix-id>/wine/
//! <root>/wine/<name>/
//! <root>/cache/downloads/
//! <root>/cache/icons/
//! <root>/cache/dxvk-<version>/
//! <root>/winetricks/winetricks
//! <root>/config.json
//! ```
//!
//! Blocking filesystem work runs on tokio's blocking pool so callers on the
//! orchestration side only ever await it.

use crate::error::{CellarError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use walkdir::WalkDir;

/// Receives completion fractions in `0.0..=1.0`
pub type ProgressSink = Arc<dyn Fn(f64) + Send + Sync>;

/// Well-known Homebrew installation roots
pub const HOMEBREW_PREFIXES: &[&str] = &["/opt/homebrew", "/usr/local", "/home/linuxbrew/.linuxbrew"];

/// Computed directory layout below the application-support root
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
    logs: PathBuf,
}

impl Storage {
    /// Layout below `root`, with logs in `root/logs`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let logs = root.join("logs");
        Self { root, logs }
    }

    /// Keep logs somewhere other than below the root
    pub fn with_logs_dir(mut self, logs: impl Into<PathBuf>) -> Self {
        self.logs = logs.into();
        self
    }

    /// Per-user log directory, `~/Logs/WineCellar`
    pub fn default_logs_dir() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join("Logs").join("WineCellar"))
    }

    /// Default application-support root (`~/Library/Application Support/WineCellar` on macOS)
    pub fn default_root() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| CellarError::Config("Could not determine data directory".into()))?;
        Ok(data_dir.join("WineCellar"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefixes_dir(&self) -> PathBuf {
        self.root.join("prefixes")
    }

    pub fn prefix_dir(&self, id: Uuid) -> PathBuf {
        self.prefixes_dir().join(id.to_string())
    }

    /// Managed Wine toolchains
    pub fn wine_dir(&self) -> PathBuf {
        self.root.join("wine")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir().join("downloads")
    }

    pub fn icons_dir(&self) -> PathBuf {
        self.cache_dir().join("icons")
    }

    /// Extracted DXVK release
    pub fn dxvk_dir(&self, version: &str) -> PathBuf {
        self.cache_dir().join(format!("dxvk-{}", version))
    }

    pub fn winetricks_dir(&self) -> PathBuf {
        self.root.join("winetricks")
    }

    pub fn winetricks_path(&self) -> PathBuf {
        self.winetricks_dir().join("winetricks")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Plain-text log directory
    pub fn logs_dir(&self) -> PathBuf {
        self.logs.clone()
    }

    /// Create every directory of the layout. Safe to call repeatedly.
    pub async fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.prefixes_dir(),
            self.wine_dir(),
            self.downloads_dir(),
            self.icons_dir(),
            self.winetricks_dir(),
            self.logs_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        debug!("Storage layout ready at {:?}", self.root);
        Ok(())
    }
}

/// Decode a JSON document
pub async fn read_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let content = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&content)?)
}

/// Encode `value` as pretty JSON with sorted keys and atomically replace `path`
pub async fn write_json<T>(path: &Path, value: &T) -> Result<()>
where
    T: Serialize,
{
    let document = sorted(serde_json::to_value(value)?);
    let mut bytes = serde_json::to_vec_pretty(&document)?;
    bytes.push(b'\n');

    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || write_atomic(&path, &bytes)).await??;
    Ok(())
}

fn sorted(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            serde_json::Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, sorted(value)))
                    .collect(),
            )
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sorted).collect())
        }
        other => other,
    }
}

/// Write to a temporary sibling, then rename over the destination
fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Recursively copy `source` into `destination`.
///
/// Symbolic links are recreated, not followed: a Wine prefix maps `z:` to `/`.
/// `progress` receives the fraction of files copied and always ends with 1.0.
pub async fn copy_dir(source: &Path, destination: &Path, progress: Option<ProgressSink>) -> Result<()> {
    let source = source.to_path_buf();
    let destination = destination.to_path_buf();
    info!("Copying {:?} to {:?}", source, destination);

    tokio::task::spawn_blocking(move || copy_dir_blocking(&source, &destination, progress.as_ref()))
        .await??;
    Ok(())
}

fn copy_dir_blocking(source: &Path, destination: &Path, progress: Option<&ProgressSink>) -> io::Result<()> {
    let entries = WalkDir::new(source)
        .into_iter()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(io::Error::other)?;

    let total = entries.iter().filter(|e| !e.file_type().is_dir()).count();
    let mut done = 0usize;

    for entry in &entries {
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let target = destination.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }

        done += 1;
        if let Some(progress) = progress {
            progress(done as f64 / total as f64);
        }
    }

    if let Some(progress) = progress {
        progress(1.0);
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    let pointee = fs::read_link(link)?;
    std::os::unix::fs::symlink(pointee, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    fs::copy(link, target).map(|_| ())
}

/// Move a directory, copying across filesystems when a rename is impossible
pub async fn move_dir(source: &Path, destination: &Path, progress: Option<ProgressSink>) -> Result<()> {
    match tokio::fs::rename(source, destination).await {
        Ok(()) => {
            if let Some(progress) = progress {
                progress(1.0);
            }
            Ok(())
        }
        Err(e) => {
            debug!("Rename of {:?} failed ({}), copying instead", source, e);
            copy_dir(source, destination, progress).await?;
            remove_dir(source).await
        }
    }
}

pub async fn remove_dir(path: &Path) -> Result<()> {
    info!("Removing {:?}", path);
    tokio::fs::remove_dir_all(path).await?;
    Ok(())
}

pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

pub async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// Sum of the sizes of all regular files below `path`
pub async fn dir_size(path: &Path) -> Result<u64> {
    let path = path.to_path_buf();
    let size = tokio::task::spawn_blocking(move || -> io::Result<u64> {
        let mut total = 0;
        for entry in WalkDir::new(&path) {
            let entry = entry.map_err(io::Error::other)?;
            if entry.file_type().is_file() {
                total += entry.metadata().map_err(io::Error::other)?.len();
            }
        }
        Ok(total)
    })
    .await??;
    Ok(size)
}

/// Regular file with at least one execute bit set
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Locate the Homebrew installation, if any
pub fn homebrew_prefix() -> Option<PathBuf> {
    homebrew_prefix_in(HOMEBREW_PREFIXES.iter().map(PathBuf::from))
}

pub fn homebrew_prefix_in(candidates: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    candidates
        .into_iter()
        .find(|prefix| prefix.join("bin").join("brew").is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Document {
        zeta: u32,
        alpha: String,
        nested: std::collections::HashMap<String, String>,
    }

    #[tokio::test]
    async fn layout_is_created_idempotently() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("root"));
        storage.ensure_directories().await.unwrap();
        storage.ensure_directories().await.unwrap();

        assert!(storage.prefixes_dir().is_dir());
        assert!(storage.downloads_dir().is_dir());
        assert!(storage.icons_dir().is_dir());
        assert!(storage.winetricks_dir().is_dir());
        assert!(dir.path().join("root/logs").is_dir());
        assert_eq!(
            storage.winetricks_path(),
            dir.path().join("root/winetricks/winetricks")
        );
        assert_eq!(storage.dxvk_dir("2.3"), dir.path().join("root/cache/dxvk-2.3"));
    }

    #[tokio::test]
    async fn relocated_logs_dir_is_created() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("root")).with_logs_dir(dir.path().join("Logs"));
        storage.ensure_directories().await.unwrap();

        assert_eq!(storage.logs_dir(), dir.path().join("Logs"));
        assert!(storage.logs_dir().is_dir());
        assert!(!dir.path().join("root/logs").exists());
    }

    #[tokio::test]
    async fn json_is_written_sorted_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.json");
        let mut nested = std::collections::HashMap::new();
        nested.insert("b".to_string(), "2".to_string());
        nested.insert("a".to_string(), "1".to_string());
        let doc = Document {
            zeta: 3,
            alpha: "first".into(),
            nested,
        };

        write_json(&path, &doc).await.unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let alpha = text.find("\"alpha\"").unwrap();
        let nested_at = text.find("\"nested\"").unwrap();
        let zeta = text.find("\"zeta\"").unwrap();
        assert!(alpha < nested_at && nested_at < zeta);
        assert!(text.find("\"a\"").unwrap() < text.find("\"b\"").unwrap());

        let back: Document = read_json(&path).await.unwrap();
        assert_eq!(back, doc);

        // Replacing leaves no temporary files behind
        write_json(&path, &doc).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn read_json_propagates_missing_file() {
        let dir = TempDir::new().unwrap();
        let result: Result<Document> = read_json(&dir.path().join("absent.json")).await;
        assert!(matches!(result, Err(CellarError::Io(_))));
    }

    #[tokio::test]
    async fn size_of_empty_directory_is_zero() {
        let dir = TempDir::new().unwrap();
        assert_eq!(dir_size(dir.path()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn size_sums_nested_files_only() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        std::fs::write(dir.path().join("one"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("a/two"), vec![0u8; 250]).unwrap();
        std::fs::write(dir.path().join("a/b/c/three"), vec![0u8; 4096]).unwrap();

        assert_eq!(dir_size(dir.path()).await.unwrap(), 10 + 250 + 4096);
    }

    #[tokio::test]
    async fn copy_reports_monotonic_progress_ending_at_one() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("source");
        std::fs::create_dir_all(source.join("drive_c/windows")).unwrap();
        for i in 0..5 {
            std::fs::write(source.join(format!("drive_c/windows/{}.dll", i)), b"dll").unwrap();
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink("../drive_c", source.join("c_link")).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            Arc::new(move |fraction: f64| seen.lock().unwrap().push(fraction)) as ProgressSink
        };

        let destination = dir.path().join("copy");
        copy_dir(&source, &destination, Some(sink)).await.unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), 1.0);
        assert!(destination.join("drive_c/windows/4.dll").is_file());
        #[cfg(unix)]
        assert!(std::fs::symlink_metadata(destination.join("c_link"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[tokio::test]
    async fn copy_of_empty_directory_still_reports_completion() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("empty");
        std::fs::create_dir(&source).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            Arc::new(move |fraction: f64| seen.lock().unwrap().push(fraction)) as ProgressSink
        };

        copy_dir(&source, &dir.path().join("out"), Some(sink)).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1.0]);
    }

    #[tokio::test]
    async fn move_and_remove_directory() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("from");
        std::fs::create_dir_all(source.join("inner")).unwrap();
        std::fs::write(source.join("inner/file"), b"x").unwrap();

        let destination = dir.path().join("to");
        move_dir(&source, &destination, None).await.unwrap();
        assert!(!exists(&source).await);
        assert!(is_dir(&destination).await);

        remove_dir(&destination).await.unwrap();
        assert!(!exists(&destination).await);
        assert!(remove_dir(&destination).await.is_err());
    }

    #[test]
    fn homebrew_is_found_by_brew_binary() {
        let dir = TempDir::new().unwrap();
        let without = dir.path().join("nobrew");
        let with = dir.path().join("brew");
        std::fs::create_dir_all(with.join("bin")).unwrap();
        std::fs::write(with.join("bin/brew"), b"").unwrap();

        assert_eq!(homebrew_prefix_in([without.clone(), with.clone()]), Some(with));
        assert_eq!(homebrew_prefix_in([without]), None);
    }
}
