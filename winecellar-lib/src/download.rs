//! Download manager and archive extraction

use crate::error::{CellarError, Result};
use crate::process::ProcessRunner;
use crate::storage::ProgressSink;
use reqwest::Client;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Download manager
pub struct DownloadManager {
    client: Client,
    cache_dir: PathBuf,
}

impl DownloadManager {
    /// Create a new download manager
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("WineCellar/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self::with_client(client, cache_dir))
    }

    pub fn with_client(client: Client, cache_dir: PathBuf) -> Self {
        Self { client, cache_dir }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Fetch `url` into `destination`.
    ///
    /// The body is streamed into a temporary file next to the destination and
    /// renamed over it only once complete. A single attempt is made.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        progress: Option<ProgressSink>,
    ) -> Result<PathBuf> {
        info!("Downloading {} to {:?}", url, destination);
        let mut response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CellarError::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        let total_size = response.content_length().unwrap_or(0);
        let mut received = 0u64;
        let mut file = tempfile::NamedTempFile::new_in(parent)?;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk)?;
            received += chunk.len() as u64;

            if let Some(ref progress) = progress {
                if total_size > 0 {
                    progress((received as f64 / total_size as f64).min(1.0));
                }
            }
        }

        file.as_file().sync_all()?;
        file.persist(destination).map_err(|e| e.error)?;

        if let Some(progress) = progress {
            progress(1.0);
        }
        debug!("Downloaded {} bytes from {}", received, url);
        Ok(destination.to_path_buf())
    }

    /// Download into the shared cache under `filename`
    pub async fn download_to_cache(
        &self,
        url: &str,
        filename: &str,
        progress: Option<ProgressSink>,
    ) -> Result<PathBuf> {
        let destination = self.cached_path(filename);
        self.download(url, &destination, progress).await
    }

    /// Check if file is cached
    pub fn is_cached<P: AsRef<Path>>(&self, filename: P) -> bool {
        self.cache_dir.join(filename).exists()
    }

    /// Get cached file path
    pub fn cached_path<P: AsRef<Path>>(&self, filename: P) -> PathBuf {
        self.cache_dir.join(filename)
    }
}

/// Unpack a tarball into `destination` with the system `tar`
pub async fn extract_archive(runner: &ProcessRunner, archive: &Path, destination: &Path) -> Result<()> {
    tokio::fs::create_dir_all(destination).await?;

    let args = vec![
        "-xf".to_string(),
        archive.to_string_lossy().into_owned(),
        "-C".to_string(),
        destination.to_string_lossy().into_owned(),
    ];
    let output = runner
        .run(Path::new("tar"), &args, &HashMap::new(), None)
        .await?;

    if !output.success() {
        return Err(CellarError::Archive(format!(
            "tar exited with code {} for {:?}: {}",
            output.exit_code,
            archive,
            output.stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn manager(dir: &TempDir) -> DownloadManager {
        let client = Client::builder().no_proxy().build().unwrap();
        DownloadManager::with_client(client, dir.path().to_path_buf())
    }

    /// Serve a single canned HTTP response
    async fn serve_once(status_line: &'static str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = vec![0u8; 4096];
            let _ = socket.read(&mut request).await;
            let head = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                status_line,
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        format!("http://{}/file", address)
    }

    #[tokio::test]
    async fn successful_download_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        std::fs::write(dir.path().join("SteamSetup.exe"), b"stale").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink: ProgressSink = {
            let seen = seen.clone();
            Arc::new(move |f: f64| seen.lock().unwrap().push(f))
        };

        let url = serve_once("200 OK", b"fresh installer bytes").await;
        let path = manager
            .download_to_cache(&url, "SteamSetup.exe", Some(sink))
            .await
            .unwrap();

        assert_eq!(path, dir.path().join("SteamSetup.exe"));
        assert_eq!(std::fs::read(&path).unwrap(), b"fresh installer bytes");
        assert_eq!(*seen.lock().unwrap().last().unwrap(), 1.0);
        assert!(manager.is_cached("SteamSetup.exe"));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn non_success_status_is_distinct_error() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        std::fs::write(dir.path().join("keep.bin"), b"original").unwrap();

        let url = serve_once("404 Not Found", b"missing").await;
        let result = manager.download_to_cache(&url, "keep.bin", None).await;

        match result {
            Err(CellarError::HttpStatus { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(std::fs::read(dir.path().join("keep.bin")).unwrap(), b"original");
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_http_error() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);

        let result = manager
            .download(&format!("http://{}/x", address), &dir.path().join("x"), None)
            .await;
        assert!(matches!(result, Err(CellarError::Http(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn extraction_failure_is_archive_error() {
        let dir = TempDir::new().unwrap();
        let bogus = dir.path().join("bogus.tar.gz");
        std::fs::write(&bogus, b"not an archive").unwrap();

        let result = extract_archive(&ProcessRunner::new(), &bogus, &dir.path().join("out")).await;
        assert!(matches!(result, Err(CellarError::Archive(_))));
    }
}
