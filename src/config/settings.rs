//! Engine Settings Storage
//!
//! Settings location: ~/.sshmux/settings.json on macOS/Linux,
//! %APPDATA%\sshmux\settings.json on Windows.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::session::reconnect::BackoffPolicy;
use crate::sftp::types::TransferSettings;

pub const SETTINGS_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Get the sshmux configuration directory
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("sshmux"));
        }
        dirs::home_dir()
            .map(|home| home.join(".sshmux"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".sshmux"))
            .ok_or(StorageError::NoConfigDir)
    }
}

pub fn settings_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("settings.json"))
}

/// Vault header location
pub fn vault_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("vault.json"))
}

/// Engine-wide tunables shared by every session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub reconnect: BackoffPolicy,

    #[serde(default)]
    pub transfer: TransferSettings,

    /// Per-channel inbound buffer, in chunks
    #[serde(default = "default_channel_buffer")]
    pub channel_buffer: usize,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_channel_buffer() -> usize {
    256
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            reconnect: BackoffPolicy::default(),
            transfer: TransferSettings::default(),
            channel_buffer: default_channel_buffer(),
        }
    }
}

pub struct SettingsStorage {
    path: PathBuf,
}

impl SettingsStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: settings_file()?,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load settings, falling back to defaults when the file is missing or corrupt
    pub async fn load(&self) -> Result<EngineSettings, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<EngineSettings>(&contents) {
                Ok(settings) => {
                    if settings.version > SETTINGS_VERSION {
                        return Err(StorageError::VersionTooNew {
                            found: settings.version,
                            supported: SETTINGS_VERSION,
                        });
                    }
                    Ok(settings)
                }
                Err(e) => {
                    tracing::warn!("Settings file corrupted, using defaults: {}", e);
                    Ok(EngineSettings::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EngineSettings::default()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Write via a temp file and rename
    pub async fn save(&self, settings: &EngineSettings) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(settings)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}
