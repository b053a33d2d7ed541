//! Manifest codec
//!
//! The manifest is the durable record of a pending update. It lives next to
//! the staged images as JSON and names the files to apply plus the policy
//! flags the recovery step honours.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{OtaError, OtaResult};
use crate::image::ImageVerifier;
use crate::staging::{StagingLayout, is_plain_file_name};
use crate::storage::Storage;

fn default_delete_after() -> bool {
    true
}

/// Pending update descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Version the staged firmware carries
    #[serde(rename = "version", default)]
    pub target_version: String,
    /// Firmware file name inside the staging directory
    #[serde(rename = "firmware", default)]
    pub firmware_file: String,
    /// Asset file name inside the staging directory
    #[serde(rename = "www", alias = "asset", default)]
    pub asset_file: String,
    /// Apply even if the running version matches
    #[serde(default)]
    pub force: bool,
    /// Remove staged files after a successful firmware flash
    #[serde(rename = "delete_after", default = "default_delete_after")]
    pub delete_after_apply: bool,
    /// SHA-256 of the staged firmware, lower-case hex
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_sha256: Option<String>,
    /// SHA-256 of the staged asset image, lower-case hex
    #[serde(
        rename = "www_sha256",
        alias = "asset_sha256",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub asset_sha256: Option<String>,
    /// When the manifest was written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staged_at: Option<DateTime<Utc>>,
}

impl Manifest {
    /// Manifest naming the layout's files, with no digests
    pub fn new(layout: &StagingLayout, version: impl Into<String>, force: bool) -> Self {
        Self {
            target_version: version.into(),
            firmware_file: file_name(layout.firmware()),
            asset_file: file_name(layout.asset()),
            force,
            delete_after_apply: true,
            firmware_sha256: None,
            asset_sha256: None,
            staged_at: None,
        }
    }

    /// Stand-in used when a firmware image is staged without a manifest
    ///
    /// Older tooling dropped a bare image into the staging directory; such an
    /// image is always applied.
    pub fn synthesized(layout: &StagingLayout) -> Self {
        Self::new(layout, String::new(), true)
    }

    /// Parse manifest JSON, filling omitted file names from `layout`
    pub fn parse(data: &[u8], layout: &StagingLayout) -> OtaResult<Self> {
        if data.iter().all(u8::is_ascii_whitespace) {
            return Err(OtaError::InvalidArgument("manifest is empty".to_string()));
        }

        let mut manifest: Manifest = serde_json::from_slice(data)
            .map_err(|e| OtaError::InvalidArgument(format!("malformed manifest: {e}")))?;

        if manifest.firmware_file.is_empty() {
            manifest.firmware_file = file_name(layout.firmware());
        }
        if manifest.asset_file.is_empty() {
            manifest.asset_file = file_name(layout.asset());
        }
        manifest.validate()?;
        Ok(manifest)
    }

    /// Reject file names that could escape the staging directory
    pub fn validate(&self) -> OtaResult<()> {
        for (key, name) in [("firmware", &self.firmware_file), ("www", &self.asset_file)] {
            if !is_plain_file_name(name) {
                return Err(OtaError::InvalidArgument(format!(
                    "manifest {key} must be a plain file name, got {name:?}"
                )));
            }
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Outcome of loading the manifest with the fallback policy applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestLoad {
    /// A manifest file was read
    Present(Manifest),
    /// No manifest, but a firmware image is staged; apply it unconditionally
    Synthesized(Manifest),
    /// Nothing is staged
    Absent,
}

impl ManifestLoad {
    /// The manifest to act on, if any
    pub fn manifest(&self) -> Option<&Manifest> {
        match self {
            ManifestLoad::Present(m) | ManifestLoad::Synthesized(m) => Some(m),
            ManifestLoad::Absent => None,
        }
    }
}

/// Reads and writes the manifest file of a staging area
#[derive(Clone)]
pub struct ManifestCodec {
    layout: StagingLayout,
    storage: Arc<dyn Storage>,
    verifier: ImageVerifier,
    max_bytes: u64,
}

impl ManifestCodec {
    /// Create a codec for `layout`, refusing manifests above `max_bytes`
    pub fn new(layout: StagingLayout, storage: Arc<dyn Storage>, max_bytes: u64) -> Self {
        let verifier = ImageVerifier::new(storage.clone());
        Self {
            layout,
            storage,
            verifier,
            max_bytes,
        }
    }

    /// Path layout
    pub fn layout(&self) -> &StagingLayout {
        &self.layout
    }

    /// Read and parse the manifest
    ///
    /// Absent is `NotFound`; empty, oversized or malformed is `InvalidArgument`.
    pub async fn read(&self) -> OtaResult<Manifest> {
        let path = self.layout.manifest();
        if !self.storage.exists(path).await {
            return Err(OtaError::NotFound(format!(
                "no manifest at {}",
                path.display()
            )));
        }

        let size = self
            .storage
            .size(path)
            .await
            .map_err(|e| OtaError::from_storage(e, path.display()))?;
        if size > self.max_bytes {
            return Err(OtaError::InvalidArgument(format!(
                "manifest is {size} bytes, limit is {}",
                self.max_bytes
            )));
        }

        let data = self
            .storage
            .read(path)
            .await
            .map_err(|e| OtaError::from_storage(e, path.display()))?;
        let manifest = Manifest::parse(&data, &self.layout)?;

        debug!(
            "Manifest: version={}, force={}, delete_after={}",
            manifest.target_version, manifest.force, manifest.delete_after_apply
        );
        Ok(manifest)
    }

    /// Read the manifest, synthesizing one for a bare staged firmware image
    pub async fn load(&self) -> OtaResult<ManifestLoad> {
        match self.read().await {
            Ok(manifest) => Ok(ManifestLoad::Present(manifest)),
            Err(OtaError::NotFound(_)) => {
                if self.storage.exists(self.layout.firmware()).await {
                    info!("No manifest but firmware is staged, forcing update");
                    Ok(ManifestLoad::Synthesized(Manifest::synthesized(&self.layout)))
                } else {
                    Ok(ManifestLoad::Absent)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Write the manifest atomically
    pub async fn write(&self, manifest: &Manifest) -> OtaResult<()> {
        manifest.validate()?;

        let json = serde_json::to_vec_pretty(manifest)?;
        if json.len() as u64 > self.max_bytes {
            return Err(OtaError::InvalidArgument(format!(
                "encoded manifest is {} bytes, limit is {}",
                json.len(),
                self.max_bytes
            )));
        }

        let path = self.layout.manifest();
        let tmp = self.layout.manifest_tmp();
        self.storage
            .write(tmp, &json)
            .await
            .map_err(|e| OtaError::WriteFailed(format!("{}: {e}", tmp.display())))?;
        self.storage
            .rename(tmp, path)
            .await
            .map_err(|e| OtaError::WriteFailed(format!("{}: {e}", path.display())))?;

        info!(
            "Manifest written: version={}, force={}",
            manifest.target_version, manifest.force
        );
        Ok(())
    }

    /// Delete the manifest; returns whether one existed
    pub async fn delete(&self) -> OtaResult<bool> {
        let path = self.layout.manifest();
        match self.storage.remove(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(OtaError::WriteFailed(format!(
                "failed to delete {}: {e}",
                path.display()
            ))),
        }
    }

    /// Rewrite the manifest from what is currently staged
    ///
    /// Digests are recomputed for every staged artifact. Without an explicit
    /// `version` the staged firmware header supplies it. Requires a staged
    /// firmware image.
    pub async fn refresh(&self, version: Option<String>, force: bool) -> OtaResult<Manifest> {
        let firmware = self.layout.firmware();
        if !self.storage.exists(firmware).await {
            return Err(OtaError::NotFound(format!(
                "no firmware staged at {}",
                firmware.display()
            )));
        }

        let version = match version {
            Some(v) => v,
            None => self.verifier.verify(firmware).await?.version,
        };

        let mut manifest = Manifest::new(&self.layout, version, force);
        manifest.firmware_sha256 = Some(self.verifier.file_sha256(firmware).await?);
        if self.storage.exists(self.layout.asset()).await {
            manifest.asset_sha256 = Some(self.verifier.file_sha256(self.layout.asset()).await?);
        }
        manifest.staged_at = Some(Utc::now());

        self.write(&manifest).await?;
        Ok(manifest)
    }

    /// Staged firmware path named by a manifest
    pub fn firmware_path(&self, manifest: &Manifest) -> OtaResult<PathBuf> {
        self.layout.resolve(&manifest.firmware_file)
    }

    /// Staged asset path named by a manifest
    pub fn asset_path(&self, manifest: &Manifest) -> OtaResult<PathBuf> {
        self.layout.resolve(&manifest.asset_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{ImageHeader, build_image, compute_data_hash};
    use crate::storage::FsStorage;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn setup() -> OtaResult<(TempDir, ManifestCodec)> {
        let dir = TempDir::new().map_err(|e| OtaError::Internal(e.to_string()))?;
        let layout = StagingLayout::with_dir(dir.path());
        let codec = ManifestCodec::new(layout, Arc::new(FsStorage::new()), 4096);
        Ok((dir, codec))
    }

    #[test]
    fn test_parse_defaults() -> OtaResult<()> {
        let layout = StagingLayout::with_dir("/r");
        let m = Manifest::parse(br#"{"version": "1.3.0"}"#, &layout)?;
        assert_eq!(m.target_version, "1.3.0");
        assert_eq!(m.firmware_file, "firmware.bin");
        assert_eq!(m.asset_file, "www.bin");
        assert!(!m.force);
        assert!(m.delete_after_apply);
        assert!(m.firmware_sha256.is_none());
        Ok(())
    }

    #[test]
    fn test_parse_full_and_aliases() -> OtaResult<()> {
        let layout = StagingLayout::with_dir("/r");
        let m = Manifest::parse(
            br#"{"version":"2.0","firmware":"fw.bin","asset":"ui.bin","force":true,
                 "delete_after":false,"firmware_sha256":"ab","asset_sha256":"cd"}"#,
            &layout,
        )?;
        assert_eq!(m.firmware_file, "fw.bin");
        assert_eq!(m.asset_file, "ui.bin");
        assert!(m.force);
        assert!(!m.delete_after_apply);
        assert_eq!(m.asset_sha256.as_deref(), Some("cd"));
        Ok(())
    }

    #[test]
    fn test_serialized_keys() -> OtaResult<()> {
        let layout = StagingLayout::with_dir("/r");
        let json = serde_json::to_value(Manifest::new(&layout, "1.0", false))?;
        assert_eq!(json.get("version"), Some(&serde_json::json!("1.0")));
        assert_eq!(json.get("firmware"), Some(&serde_json::json!("firmware.bin")));
        assert_eq!(json.get("www"), Some(&serde_json::json!("www.bin")));
        assert_eq!(json.get("delete_after"), Some(&serde_json::json!(true)));
        assert!(json.get("firmware_sha256").is_none());
        Ok(())
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let layout = StagingLayout::with_dir("/r");
        for data in [&b""[..], b"  \n", b"{", b"[1,2]", br#"{"force": "yes"}"#] {
            assert!(matches!(
                Manifest::parse(data, &layout),
                Err(OtaError::InvalidArgument(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_read_absent_vs_malformed() -> OtaResult<()> {
        let (_dir, codec) = setup()?;
        assert!(matches!(codec.read().await, Err(OtaError::NotFound(_))));

        tokio::fs::write(codec.layout().manifest(), b"not json")
            .await
            .map_err(|e| OtaError::Internal(e.to_string()))?;
        assert!(matches!(
            codec.read().await,
            Err(OtaError::InvalidArgument(_))
        ));

        tokio::fs::write(codec.layout().manifest(), vec![b' '; 5000])
            .await
            .map_err(|e| OtaError::Internal(e.to_string()))?;
        assert!(matches!(
            codec.read().await,
            Err(OtaError::InvalidArgument(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_load_fallback_policy() -> OtaResult<()> {
        let (_dir, codec) = setup()?;
        assert_eq!(codec.load().await?, ManifestLoad::Absent);

        tokio::fs::write(codec.layout().firmware(), b"fw")
            .await
            .map_err(|e| OtaError::Internal(e.to_string()))?;
        assert_eq!(
            codec.load().await?,
            ManifestLoad::Synthesized(Manifest::synthesized(codec.layout()))
        );
        let synthesized = Manifest::synthesized(codec.layout());
        assert!(synthesized.force);
        assert!(synthesized.delete_after_apply);
        assert_eq!(synthesized.firmware_file, "firmware.bin");

        codec
            .write(&Manifest::new(codec.layout(), "1.2.0", false))
            .await?;
        assert!(matches!(codec.load().await?, ManifestLoad::Present(m) if m.target_version == "1.2.0"));
        Ok(())
    }

    #[tokio::test]
    async fn test_refresh_computes_digests() -> OtaResult<()> {
        let (_dir, codec) = setup()?;
        assert!(matches!(
            codec.refresh(None, false).await,
            Err(OtaError::NotFound(_))
        ));

        let image = build_image(&ImageHeader::new("1.4.2", "gw"), &[7u8; 1000]);
        tokio::fs::write(codec.layout().firmware(), &image)
            .await
            .map_err(|e| OtaError::Internal(e.to_string()))?;
        tokio::fs::write(codec.layout().asset(), b"assets")
            .await
            .map_err(|e| OtaError::Internal(e.to_string()))?;

        let written = codec.refresh(None, true).await?;
        assert_eq!(written.target_version, "1.4.2");
        assert!(written.force);
        assert_eq!(
            written.firmware_sha256.as_deref(),
            Some(compute_data_hash(&image).as_str())
        );
        assert_eq!(
            written.asset_sha256.as_deref(),
            Some(compute_data_hash(b"assets").as_str())
        );
        assert!(written.staged_at.is_some());

        let read_back = codec.read().await?;
        assert_eq!(read_back, written);
        assert!(!codec.layout().dir().join("manifest.json.tmp").exists());

        assert!(codec.delete().await?);
        assert!(!codec.delete().await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_resolves_manifest_paths() -> OtaResult<()> {
        let (dir, codec) = setup()?;
        let mut m = Manifest::new(codec.layout(), "1", false);
        m.asset_file = "ui.bin".to_string();
        assert_eq!(codec.asset_path(&m)?, dir.path().join("ui.bin"));
        m.firmware_file = "../escape.bin".to_string();
        assert!(matches!(
            codec.firmware_path(&m),
            Err(OtaError::InvalidArgument(_))
        ));
        assert!(matches!(
            codec.write(&m).await,
            Err(OtaError::InvalidArgument(_))
        ));
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_path_like_names_rejected(
            prefix in "[a-z]{0,8}",
            sep in prop::sample::select(vec!["/", "\\", "../"]),
            suffix in "[a-z]{1,8}",
        ) {
            let layout = StagingLayout::with_dir("/r");
            let json = serde_json::json!({ "firmware": format!("{prefix}{sep}{suffix}") });
            let result = Manifest::parse(json.to_string().as_bytes(), &layout);
            prop_assert!(matches!(result, Err(OtaError::InvalidArgument(_))));
        }

        #[test]
        fn prop_version_and_flags_survive_encoding(
            version in "[ -~]{0,31}",
            force in any::<bool>(),
            delete_after in any::<bool>(),
        ) {
            let layout = StagingLayout::with_dir("/r");
            let mut manifest = Manifest::new(&layout, version, force);
            manifest.delete_after_apply = delete_after;
            let json = serde_json::to_vec(&manifest)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            let parsed = Manifest::parse(&json, &layout)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            prop_assert_eq!(parsed, manifest);
        }
    }
}
