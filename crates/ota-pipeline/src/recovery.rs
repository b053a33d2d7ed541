//! Boot-time recovery controller
//!
//! Runs once early in boot, before the acquisition engine exists. If the
//! staging area holds an update that has not been applied yet, the firmware
//! is committed, the asset region refreshed on a best-effort basis, staged
//! files cleaned up and the system restarted.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::committer::{AssetFlash, CommitReport, PartitionCommitter};
use crate::config::{OtaConfig, RecoveryConfig};
use crate::error::{OtaError, OtaResult};
use crate::flash::FlashDevice;
use crate::image::ImageVerifier;
use crate::manifest::{Manifest, ManifestCodec, ManifestLoad};
use crate::progress::ProgressReporter;
use crate::staging::{StagingArea, StagingLayout};
use crate::storage::Storage;
use crate::system::SystemControl;

/// What happened to the staged asset image during recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetRecovery {
    /// No asset image was staged
    NotStaged,
    /// Asset flash ran (or the layout had no region)
    Done(AssetFlash),
    /// Asset flash failed; firmware recovery still counts
    Failed(String),
}

/// Summary of an applied recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySummary {
    /// Manifest that drove the recovery
    pub manifest: Manifest,
    /// Firmware commit result
    pub firmware: CommitReport,
    /// Asset outcome
    pub asset: AssetRecovery,
    /// Whether staged files were removed
    pub cleaned: bool,
}

/// Result of the boot-time check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryOutcome {
    /// No staging directory, or nothing in it to apply
    NothingStaged,
    /// Staged version is already running and the manifest does not force
    UpToDate {
        /// Running version
        version: String,
    },
    /// Update applied and restart requested
    Applied(RecoverySummary),
}

/// Applies a staged-but-unapplied update at boot
pub struct RecoveryController {
    staging: StagingArea,
    manifest: ManifestCodec,
    verifier: ImageVerifier,
    committer: PartitionCommitter,
    system: Arc<dyn SystemControl>,
    config: RecoveryConfig,
}

impl RecoveryController {
    /// Wire a controller from configuration and collaborators
    pub fn new(
        config: &OtaConfig,
        storage: Arc<dyn Storage>,
        flash: Arc<dyn FlashDevice>,
        system: Arc<dyn SystemControl>,
        reporter: ProgressReporter,
    ) -> Self {
        let layout = StagingLayout::from_config(&config.staging);
        Self {
            staging: StagingArea::new(layout.clone(), storage.clone()),
            manifest: ManifestCodec::new(layout, storage.clone(), config.manifest_max_bytes),
            verifier: ImageVerifier::new(storage.clone()),
            committer: PartitionCommitter::new(
                flash,
                storage,
                reporter,
                config.commit.flash_chunk_size,
                config.commit.asset_region_label.clone(),
            ),
            system,
            config: config.recovery.clone(),
        }
    }

    /// Check the staging area and apply a pending update
    ///
    /// A firmware flash failure is returned with every staged file left in
    /// place; the caller keeps booting the active image.
    pub async fn check_and_apply_recovery(&self) -> OtaResult<RecoveryOutcome> {
        info!("Checking for staged recovery...");

        if !self.staging.exists().await {
            info!("No recovery directory found");
            return Ok(RecoveryOutcome::NothingStaged);
        }

        let manifest = match self.load_manifest().await? {
            ManifestLoad::Absent => {
                info!("No recovery files found");
                return Ok(RecoveryOutcome::NothingStaged);
            }
            ManifestLoad::Present(m) | ManifestLoad::Synthesized(m) => m,
        };

        info!(
            "Recovery manifest: version={}, force={}, firmware={}, www={}",
            manifest.target_version, manifest.force, manifest.firmware_file, manifest.asset_file
        );

        if !manifest.force {
            let running = self
                .system
                .running_version()
                .await
                .map_err(|e| OtaError::Internal(format!("cannot read running version: {e:#}")))?;
            if running == manifest.target_version {
                info!("Firmware v{} already running, no recovery needed", running);
                return Ok(RecoveryOutcome::UpToDate { version: running });
            }
            info!(
                "Version mismatch: current={}, target={}",
                running, manifest.target_version
            );
        } else {
            info!("Force recovery requested");
        }

        warn!("Staged recovery initiated");
        let summary = self.apply(manifest).await?;

        warn!(
            "Recovery complete, firmware v{} in slot {}, asset {:?}; restarting in {} ms",
            summary.firmware.version,
            summary.firmware.boot_slot,
            summary.asset,
            self.config.reboot_delay_ms
        );
        tokio::time::sleep(self.config.reboot_delay()).await;
        self.system
            .restart()
            .await
            .map_err(|e| OtaError::Internal(format!("restart failed: {e:#}")))?;

        Ok(RecoveryOutcome::Applied(summary))
    }

    async fn load_manifest(&self) -> OtaResult<ManifestLoad> {
        match self.manifest.load().await {
            Err(OtaError::InvalidArgument(reason)) => {
                warn!("Ignoring malformed manifest: {}", reason);
                if self.staging.has_firmware().await {
                    warn!("Firmware is staged, falling back to forced recovery");
                    Ok(ManifestLoad::Synthesized(Manifest::synthesized(
                        self.staging.layout(),
                    )))
                } else {
                    Ok(ManifestLoad::Absent)
                }
            }
            other => other,
        }
    }

    async fn apply(&self, manifest: Manifest) -> OtaResult<RecoverySummary> {
        let firmware_path = self.manifest.firmware_path(&manifest)?;
        if !self.staging.storage().exists(&firmware_path).await {
            return Err(OtaError::NotFound(format!(
                "firmware file {} not found",
                firmware_path.display()
            )));
        }

        if self.config.verify_checksum_before_flash {
            if let Some(expected) = manifest.firmware_sha256.as_deref() {
                self.verifier
                    .verify_checksum(&firmware_path, expected)
                    .await?;
                info!("Staged firmware checksum verified");
            }
        }

        let firmware = self.committer.flash_firmware(&firmware_path).await?;

        let asset_path = self.manifest.asset_path(&manifest)?;
        let asset = if self.staging.storage().exists(&asset_path).await {
            match self.committer.flash_asset(&asset_path).await {
                Ok(done) => AssetRecovery::Done(done),
                Err(e) => {
                    warn!("Asset recovery failed (non-fatal): {}", e);
                    AssetRecovery::Failed(e.to_string())
                }
            }
        } else {
            AssetRecovery::NotStaged
        };

        let cleaned = if manifest.delete_after_apply {
            info!("Cleaning up recovery files...");
            for path in [&firmware_path, &asset_path] {
                self.staging.discard(path).await;
            }
            self.staging.discard(self.staging.layout().manifest()).await;
            true
        } else {
            false
        };

        Ok(RecoverySummary {
            manifest,
            firmware,
            asset,
            cleaned,
        })
    }
}
