//! Pipeline configuration
//!
//! Loaded from a JSON file; a default file is created on first use.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{OtaError, OtaResult};

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtaConfig {
    /// Staging area layout
    pub staging: StagingConfig,
    /// Download/upload settings
    pub acquisition: AcquisitionConfig,
    /// Flash write settings
    pub commit: CommitConfig,
    /// Boot-time recovery settings
    pub recovery: RecoveryConfig,
    /// Largest manifest file accepted, in bytes
    pub manifest_max_bytes: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            staging: StagingConfig::default(),
            acquisition: AcquisitionConfig::default(),
            commit: CommitConfig::default(),
            recovery: RecoveryConfig::default(),
            manifest_max_bytes: 4096,
        }
    }
}

/// Staging directory and the file names external tooling relies on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StagingConfig {
    /// Recovery root directory
    pub dir: PathBuf,
    /// Pending firmware image
    pub firmware_file: String,
    /// Pending asset image
    pub asset_file: String,
    /// Manifest descriptor
    pub manifest_file: String,
    /// Scratch file that receives in-flight transfers
    pub scratch_file: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("recovery"),
            firmware_file: "firmware.bin".to_string(),
            asset_file: "www.bin".to_string(),
            manifest_file: "manifest.json".to_string(),
            scratch_file: "temp.bin".to_string(),
        }
    }
}

/// Acquisition engine settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Size of the fixed transfer buffer in bytes
    pub transfer_buffer_size: usize,
    /// Transport connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Transport per-read timeout in seconds
    pub read_timeout_secs: u64,
    /// User agent sent with download requests
    pub user_agent: String,
    /// Capacity of the progress event bus
    pub progress_bus_capacity: usize,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            transfer_buffer_size: 8192,
            connect_timeout_secs: 30,
            read_timeout_secs: 30,
            user_agent: concat!("ota-pipeline/", env!("CARGO_PKG_VERSION")).to_string(),
            progress_bus_capacity: 256,
        }
    }
}

impl AcquisitionConfig {
    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Read timeout as a [`Duration`]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// Partition committer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommitConfig {
    /// Chunk size for flash writes
    pub flash_chunk_size: usize,
    /// Label of the asset region
    pub asset_region_label: String,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            flash_chunk_size: 4096,
            asset_region_label: "www".to_string(),
        }
    }
}

/// Recovery controller settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Delay before restart so log output can drain
    pub reboot_delay_ms: u64,
    /// Recompute the staged firmware digest and compare it to the manifest before flashing
    pub verify_checksum_before_flash: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            reboot_delay_ms: 3000,
            verify_checksum_before_flash: true,
        }
    }
}

impl RecoveryConfig {
    /// Reboot delay as a [`Duration`]
    pub fn reboot_delay(&self) -> Duration {
        Duration::from_millis(self.reboot_delay_ms)
    }
}

impl OtaConfig {
    /// Load configuration from a path, writing the defaults there if it does not exist
    pub async fn load_from_path<P: AsRef<Path>>(path: P) -> OtaResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file not found at {:?}, creating default", path);
            let config = Self::default();
            config.save_to_path(path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| OtaError::from_storage(e, path.display()))?;

        let config: OtaConfig = serde_json::from_str(&content)?;
        config.validate()?;

        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a path
    pub async fn save_to_path<P: AsRef<Path>>(&self, path: P) -> OtaResult<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| OtaError::from_storage(e, parent.display()))?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| OtaError::from_storage(e, path.display()))?;

        debug!("Saved config to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> OtaResult<()> {
        let names = [
            ("firmware_file", &self.staging.firmware_file),
            ("asset_file", &self.staging.asset_file),
            ("manifest_file", &self.staging.manifest_file),
            ("scratch_file", &self.staging.scratch_file),
        ];
        for (field, name) in names {
            if !crate::staging::is_plain_file_name(name) {
                return Err(OtaError::InvalidArgument(format!(
                    "staging.{field} must be a plain file name, got {name:?}"
                )));
            }
        }

        let mut unique: Vec<&String> = names.iter().map(|(_, n)| *n).collect();
        unique.sort();
        unique.dedup();
        if unique.len() != names.len() {
            return Err(OtaError::InvalidArgument(
                "staging file names must be distinct".to_string(),
            ));
        }

        if self.acquisition.transfer_buffer_size == 0 {
            return Err(OtaError::InvalidArgument(
                "acquisition.transfer_buffer_size must be non-zero".to_string(),
            ));
        }
        if self.acquisition.progress_bus_capacity == 0 {
            return Err(OtaError::InvalidArgument(
                "acquisition.progress_bus_capacity must be non-zero".to_string(),
            ));
        }
        if self.commit.flash_chunk_size == 0 {
            return Err(OtaError::InvalidArgument(
                "commit.flash_chunk_size must be non-zero".to_string(),
            ));
        }
        if self.commit.asset_region_label.is_empty() {
            return Err(OtaError::InvalidArgument(
                "commit.asset_region_label must not be empty".to_string(),
            ));
        }
        if self.manifest_max_bytes == 0 {
            return Err(OtaError::InvalidArgument(
                "manifest_max_bytes must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() -> OtaResult<()> {
        let config = OtaConfig::default();
        config.validate()?;
        assert_eq!(config.staging.firmware_file, "firmware.bin");
        assert_eq!(config.staging.manifest_file, "manifest.json");
        assert_eq!(config.acquisition.transfer_buffer_size, 8192);
        assert_eq!(config.manifest_max_bytes, 4096);
        Ok(())
    }

    #[test]
    fn test_rejects_path_like_file_names() {
        let mut config = OtaConfig::default();
        config.staging.firmware_file = "../firmware.bin".to_string();
        assert!(matches!(
            config.validate(),
            Err(OtaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_file_names() {
        let mut config = OtaConfig::default();
        config.staging.asset_file = config.staging.firmware_file.clone();
        assert!(matches!(
            config.validate(),
            Err(OtaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() -> Result<(), serde_json::Error> {
        let config: OtaConfig =
            serde_json::from_str(r#"{"recovery": {"reboot_delay_ms": 0}}"#)?;
        assert_eq!(config.recovery.reboot_delay_ms, 0);
        assert!(config.recovery.verify_checksum_before_flash);
        assert_eq!(config.commit.asset_region_label, "www");
        Ok(())
    }

    #[tokio::test]
    async fn test_load_creates_default_file() -> OtaResult<()> {
        let dir = TempDir::new().map_err(|e| OtaError::Internal(e.to_string()))?;
        let path = dir.path().join("conf").join("ota.json");

        let config = OtaConfig::load_from_path(&path).await?;
        assert!(path.exists());
        assert_eq!(config, OtaConfig::default());

        let reloaded = OtaConfig::load_from_path(&path).await?;
        assert_eq!(reloaded, config);
        Ok(())
    }
}
