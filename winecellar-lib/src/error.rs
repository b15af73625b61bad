//! Error types for winecellar

use std::fmt::Display;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// WineCellar result type
pub type Result<T> = std::result::Result<T, CellarError>;

/// Main error type for winecellar operations
#[derive(Error, Debug)]
pub enum CellarError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download of {url} failed with HTTP status {status}")]
    HttpStatus { status: u16, url: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to start {command}: {error}")]
    ProcessLaunch { command: String, error: String },

    #[error("{command} did not finish within {seconds}s")]
    ProcessTimeout { command: String, seconds: u64 },

    #[error("No Wine installation found")]
    WineNotInstalled,

    #[error("Wine binary not found in {0}")]
    WineBinaryMissing(PathBuf),

    #[error("Wine version not found: {0}")]
    WineVersionNotFound(String),

    #[error("wineboot failed with exit code {exit_code}: {stderr}")]
    Wineboot { exit_code: i32, stderr: String },

    #[error("Failed to initialize prefix: {0}")]
    PrefixInitialization(String),

    #[error("Registry import failed: {0}")]
    Registry(String),

    #[error("Archive extraction failed: {0}")]
    Archive(String),

    #[error("winetricks unavailable: {0}")]
    Winetricks(String),

    #[error("DXVK download failed: {0}")]
    DxvkDownload(String),

    #[error("DXVK extraction failed: {0}")]
    DxvkExtraction(String),

    #[error("DXVK installation failed: {0}")]
    DxvkInstallation(String),

    #[error("Prefix not found: {0}")]
    PrefixNotFound(Uuid),

    #[error("Prefix '{0}' has no Wine environment yet")]
    PrefixNotReady(String),

    #[error("Application not found: {0}")]
    AppNotFound(Uuid),

    #[error("Steam is not installed")]
    SteamNotInstalled,

    #[error("Steam installation failed: {0}")]
    SteamInstallation(String),
}

impl From<config::ConfigError> for CellarError {
    fn from(err: config::ConfigError) -> Self {
        CellarError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for CellarError {
    fn from(err: tokio::task::JoinError) -> Self {
        CellarError::Io(std::io::Error::other(err))
    }
}

/// Attempt a non-critical step and discard its failure.
///
/// Used for cleanup that must never mask the outcome of the surrounding
/// operation: killing stray Wine processes before a delete, removing a
/// half-created prefix directory, dropping a temporary registry script.
pub fn ignore_failure<T, E: Display>(step: &str, result: std::result::Result<T, E>) {
    if let Err(e) = result {
        debug!("Ignoring failure while {}: {}", step, e);
    }
}
