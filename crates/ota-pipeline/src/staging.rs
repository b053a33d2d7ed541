//! Staging area layout and housekeeping
//!
//! The staging directory holds at most one pending firmware image, one
//! pending asset image, one manifest and one scratch file.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::StagingConfig;
use crate::error::{OtaError, OtaResult};
use crate::storage::Storage;

/// Kind of artifact being staged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Application firmware image
    Firmware,
    /// Bundled asset image (web UI region)
    Asset,
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Firmware => write!(f, "firmware"),
            ArtifactKind::Asset => write!(f, "asset"),
        }
    }
}

/// Whether `name` is a single path component with no traversal
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}

/// Resolved paths of the staging area
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    dir: PathBuf,
    firmware: PathBuf,
    asset: PathBuf,
    manifest: PathBuf,
    manifest_tmp: PathBuf,
    scratch: PathBuf,
}

impl StagingLayout {
    /// Build the layout from configuration
    pub fn from_config(config: &StagingConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            firmware: config.dir.join(&config.firmware_file),
            asset: config.dir.join(&config.asset_file),
            manifest: config.dir.join(&config.manifest_file),
            manifest_tmp: config.dir.join(format!("{}.tmp", config.manifest_file)),
            scratch: config.dir.join(&config.scratch_file),
        }
    }

    /// Layout with the default file names under `dir`
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        let config = StagingConfig {
            dir: dir.into(),
            ..StagingConfig::default()
        };
        Self::from_config(&config)
    }

    /// Staging directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pending firmware image
    pub fn firmware(&self) -> &Path {
        &self.firmware
    }

    /// Pending asset image
    pub fn asset(&self) -> &Path {
        &self.asset
    }

    /// Manifest file
    pub fn manifest(&self) -> &Path {
        &self.manifest
    }

    /// Manifest being written, renamed over [`Self::manifest`] when complete
    pub fn manifest_tmp(&self) -> &Path {
        &self.manifest_tmp
    }

    /// Scratch file for in-flight transfers
    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    /// Final path of an artifact kind
    pub fn artifact(&self, kind: ArtifactKind) -> &Path {
        match kind {
            ArtifactKind::Firmware => &self.firmware,
            ArtifactKind::Asset => &self.asset,
        }
    }

    /// Resolve a file name taken from a manifest, rejecting anything but a plain name
    pub fn resolve(&self, file_name: &str) -> OtaResult<PathBuf> {
        if !is_plain_file_name(file_name) {
            return Err(OtaError::InvalidArgument(format!(
                "staged file name must be a plain file name, got {file_name:?}"
            )));
        }
        Ok(self.dir.join(file_name))
    }
}

/// Snapshot of what is currently staged
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingStatus {
    /// Staging directory
    pub dir: PathBuf,
    /// Whether a firmware image is staged
    pub has_firmware: bool,
    /// Whether an asset image is staged
    pub has_asset: bool,
    /// Whether a manifest is present
    pub has_manifest: bool,
    /// Version embedded in the staged firmware, if it parses
    pub firmware_version: Option<String>,
    /// Size of the staged firmware in bytes
    pub firmware_size: Option<u64>,
    /// Size of the staged asset in bytes
    pub asset_size: Option<u64>,
    /// Manifest contents, if readable
    pub manifest: Option<crate::manifest::Manifest>,
}

/// Staging directory operations shared by the engine and the recovery controller
#[derive(Clone)]
pub struct StagingArea {
    layout: StagingLayout,
    storage: Arc<dyn Storage>,
}

impl StagingArea {
    /// Create a staging area over a storage backend
    pub fn new(layout: StagingLayout, storage: Arc<dyn Storage>) -> Self {
        Self { layout, storage }
    }

    /// Path layout
    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    /// Storage backend
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Whether the staging directory exists
    pub async fn exists(&self) -> bool {
        self.storage.exists(self.layout.dir()).await
    }

    /// Create the staging directory if missing
    pub async fn ensure_dir(&self) -> OtaResult<()> {
        if !self.exists().await {
            self.storage
                .create_dir_all(self.layout.dir())
                .await
                .map_err(|e| {
                    OtaError::WriteFailed(format!(
                        "failed to create staging dir {}: {e}",
                        self.layout.dir().display()
                    ))
                })?;
            debug!("Created staging dir {}", self.layout.dir().display());
        }
        Ok(())
    }

    /// Whether a firmware image is staged
    pub async fn has_firmware(&self) -> bool {
        self.storage.exists(self.layout.firmware()).await
    }

    /// Whether an asset image is staged
    pub async fn has_asset(&self) -> bool {
        self.storage.exists(self.layout.asset()).await
    }

    /// Delete a file, treating "already gone" as success
    ///
    /// Returns whether a file was actually removed.
    pub async fn remove_if_present(&self, path: &Path) -> OtaResult<bool> {
        match self.storage.remove(path).await {
            Ok(()) => {
                debug!("Deleted {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(OtaError::WriteFailed(format!(
                "failed to delete {}: {e}",
                path.display()
            ))),
        }
    }

    /// Best-effort removal used on error paths, where the original error wins
    pub(crate) async fn discard(&self, path: &Path) {
        if let Err(e) = self.remove_if_present(path).await {
            warn!("Failed to discard {}: {}", path.display(), e);
        }
    }

    /// Remove every staged artifact, the manifest and any half-written files
    pub async fn clean(&self) -> OtaResult<()> {
        let paths = [
            self.layout.firmware(),
            self.layout.asset(),
            self.layout.manifest(),
            self.layout.manifest_tmp(),
            self.layout.scratch(),
        ];

        let mut first_error = None;
        for path in paths {
            if let Err(e) = self.remove_if_present(path).await {
                warn!("{}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Staging area cleaned");
                Ok(())
            }
        }
    }

    /// Size of a staged file if present
    pub async fn size_of(&self, path: &Path) -> Option<u64> {
        self.storage.size(path).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsStorage;
    use tempfile::TempDir;

    #[test]
    fn test_plain_file_names() {
        assert!(is_plain_file_name("firmware.bin"));
        assert!(is_plain_file_name("TianShan-1.2.bin"));
        assert!(!is_plain_file_name(""));
        assert!(!is_plain_file_name("."));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name("../x.bin"));
        assert!(!is_plain_file_name("sub/x.bin"));
        assert!(!is_plain_file_name("/etc/passwd"));
        assert!(!is_plain_file_name("a\\b"));
    }

    #[test]
    fn test_layout_paths() -> OtaResult<()> {
        let layout = StagingLayout::with_dir("/data/recovery");
        assert_eq!(layout.firmware(), Path::new("/data/recovery/firmware.bin"));
        assert_eq!(layout.asset(), Path::new("/data/recovery/www.bin"));
        assert_eq!(layout.manifest(), Path::new("/data/recovery/manifest.json"));
        assert_eq!(
            layout.manifest_tmp(),
            Path::new("/data/recovery/manifest.json.tmp")
        );
        assert_eq!(layout.scratch(), Path::new("/data/recovery/temp.bin"));
        assert_eq!(layout.artifact(ArtifactKind::Asset), layout.asset());
        assert_eq!(
            layout.resolve("custom.bin")?,
            PathBuf::from("/data/recovery/custom.bin")
        );
        assert!(matches!(
            layout.resolve("../../boot.bin"),
            Err(OtaError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_clean_removes_everything() -> OtaResult<()> {
        let dir = TempDir::new().map_err(|e| OtaError::Internal(e.to_string()))?;
        let layout = StagingLayout::with_dir(dir.path().join("recovery"));
        let area = StagingArea::new(layout.clone(), Arc::new(FsStorage::new()));
        area.ensure_dir().await?;

        for path in [
            layout.firmware(),
            layout.asset(),
            layout.manifest_tmp(),
            layout.scratch(),
        ] {
            area.storage()
                .write(path, b"x")
                .await
                .map_err(|e| OtaError::Internal(e.to_string()))?;
        }

        area.clean().await?;
        assert!(!area.has_firmware().await);
        assert!(!area.has_asset().await);
        assert!(!area.storage().exists(layout.scratch()).await);
        assert!(!area.storage().exists(layout.manifest_tmp()).await);
        assert!(area.exists().await);
        Ok(())
    }
}
