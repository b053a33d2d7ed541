//! Partition committer
//!
//! Writes a verified firmware image into the inactive slot and moves the
//! boot pointer only after the write has been finalized. Until that single
//! switch the previously active slot stays the boot target, so a failure at
//! any earlier point leaves the device booting the old image.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::{OtaError, OtaResult};
use crate::flash::{FlashDevice, Slot};
use crate::image::ImageVerifier;
use crate::progress::{Progress, ProgressReporter, ProgressState};
use crate::storage::Storage;

/// Point reached by a firmware commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitStage {
    /// Nothing done yet
    Idle,
    /// Image header re-validated
    HeaderValidated,
    /// Streaming into the inactive slot
    Writing,
    /// Slot write completed and accepted by the device
    Finalized,
    /// Boot pointer moved to the new slot
    BootSwitched,
}

impl std::fmt::Display for CommitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CommitStage::Idle => "idle",
            CommitStage::HeaderValidated => "header-validated",
            CommitStage::Writing => "writing",
            CommitStage::Finalized => "finalized",
            CommitStage::BootSwitched => "boot-switched",
        };
        f.write_str(name)
    }
}

/// Result of a successful firmware commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReport {
    /// Slot that was running when the commit started
    pub previous_slot: Slot,
    /// Slot now named by the boot pointer
    pub boot_slot: Slot,
    /// Version embedded in the written image
    pub version: String,
    /// Bytes written
    pub bytes_written: u64,
}

/// Result of an asset flash attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetFlash {
    /// Region erased and rewritten
    Flashed {
        /// Bytes written
        bytes_written: u64,
    },
    /// The flash layout has no asset region
    SkippedNoRegion,
}

fn tag(stage: CommitStage, err: OtaError) -> OtaError {
    let tagged = |msg: String| format!("[{stage}] {msg}");
    match err {
        OtaError::InvalidArgument(m) => OtaError::InvalidArgument(tagged(m)),
        OtaError::NotFound(m) => OtaError::NotFound(tagged(m)),
        OtaError::WriteFailed(m) => OtaError::WriteFailed(tagged(m)),
        OtaError::VerifyFailed(m) => OtaError::VerifyFailed(tagged(m)),
        OtaError::Internal(m) => OtaError::Internal(tagged(m)),
        other => other,
    }
}

/// Drives flash writes for staged images
#[derive(Clone)]
pub struct PartitionCommitter {
    flash: Arc<dyn FlashDevice>,
    storage: Arc<dyn Storage>,
    verifier: ImageVerifier,
    reporter: ProgressReporter,
    chunk_size: usize,
    asset_label: String,
}

impl PartitionCommitter {
    /// Create a committer writing through `flash`
    pub fn new(
        flash: Arc<dyn FlashDevice>,
        storage: Arc<dyn Storage>,
        reporter: ProgressReporter,
        chunk_size: usize,
        asset_label: impl Into<String>,
    ) -> Self {
        Self {
            flash,
            verifier: ImageVerifier::new(storage.clone()),
            storage,
            reporter,
            chunk_size: chunk_size.max(1),
            asset_label: asset_label.into(),
        }
    }

    /// Flash a firmware image into the inactive slot and make it the boot target
    pub async fn flash_firmware(&self, path: &Path) -> OtaResult<CommitReport> {
        let mut stage = CommitStage::Idle;
        let result = self.commit_firmware(path, &mut stage).await;

        match &result {
            Ok(report) => {
                info!(
                    "Firmware v{} committed to slot {}, reboot to apply",
                    report.version, report.boot_slot
                );
            }
            Err(e) => {
                error!("Firmware commit failed at stage {}: {}", stage, e);
                self.reporter
                    .publish(Progress::new(ProgressState::Error, e.to_string()));
            }
        }
        result.map_err(|e| tag(stage, e))
    }

    async fn commit_firmware(&self, path: &Path, stage: &mut CommitStage) -> OtaResult<CommitReport> {
        if !self.storage.exists(path).await {
            return Err(OtaError::NotFound(format!(
                "firmware image {} not found",
                path.display()
            )));
        }

        info!("Flashing firmware from {}", path.display());
        self.reporter
            .publish(Progress::new(ProgressState::Verifying, "Validating image header"));

        let image = self.verifier.verify(path).await?;
        let size = self
            .storage
            .size(path)
            .await
            .map_err(|e| OtaError::from_storage(e, path.display()))?;
        *stage = CommitStage::HeaderValidated;

        let running = self
            .flash
            .running_slot()
            .await
            .map_err(|e| OtaError::Internal(format!("cannot query running slot: {e:#}")))?;
        let target = self
            .flash
            .next_update_slot()
            .await
            .map_err(|e| OtaError::Internal(format!("cannot query update slot: {e:#}")))?
            .ok_or_else(|| OtaError::NotFound("no update slot available".to_string()))?;

        if target.slot == running {
            return Err(OtaError::Internal(format!(
                "update slot {} is the running slot",
                target.slot
            )));
        }
        if size > target.capacity {
            return Err(OtaError::InvalidArgument(format!(
                "image of {size} bytes does not fit slot {} ({} bytes)",
                target.slot, target.capacity
            )));
        }

        info!(
            "Writing v{} ({} bytes) to slot {} (running {})",
            image.version, size, target.slot, running
        );

        self.flash
            .begin_write(target.slot, size)
            .await
            .map_err(|e| OtaError::WriteFailed(format!("begin write on slot {}: {e:#}", target.slot)))?;
        *stage = CommitStage::Writing;

        if let Err(e) = self.stream_into_slot(path, target.slot, size).await {
            self.abort(target.slot).await;
            return Err(e);
        }

        if let Err(e) = self.flash.end_write(target.slot).await {
            self.abort(target.slot).await;
            return Err(OtaError::VerifyFailed(format!(
                "slot {} rejected the image: {e:#}",
                target.slot
            )));
        }
        *stage = CommitStage::Finalized;

        self.flash
            .set_boot_slot(target.slot)
            .await
            .map_err(|e| OtaError::WriteFailed(format!("set boot slot {}: {e:#}", target.slot)))?;
        *stage = CommitStage::BootSwitched;

        self.reporter.publish(
            Progress::new(ProgressState::Done, format!("Firmware v{} flashed", image.version))
                .with_bytes(size, size),
        );

        Ok(CommitReport {
            previous_slot: running,
            boot_slot: target.slot,
            version: image.version,
            bytes_written: size,
        })
    }

    async fn stream_into_slot(&self, path: &Path, slot: Slot, size: u64) -> OtaResult<()> {
        let mut offset = 0u64;
        let mut next_log_pct = 10u64;

        while offset < size {
            let chunk = self
                .storage
                .read_range(path, offset, self.chunk_size)
                .await
                .map_err(|e| OtaError::from_storage(e, path.display()))?;
            if chunk.is_empty() {
                return Err(OtaError::WriteFailed(format!(
                    "{} ended at {offset} of {size} bytes",
                    path.display()
                )));
            }

            self.flash
                .write(slot, &chunk)
                .await
                .map_err(|e| OtaError::WriteFailed(format!("write at offset {offset}: {e:#}")))?;
            offset += chunk.len() as u64;

            let pct = offset.saturating_mul(100) / size.max(1);
            if pct >= next_log_pct {
                info!("Flash progress: {}% ({}/{} bytes)", pct, offset, size);
                next_log_pct = (pct / 10 + 1) * 10;
            }
            self.reporter.publish(
                Progress::new(ProgressState::Flashing, format!("Writing slot {slot}"))
                    .with_bytes(offset, size),
            );
        }

        Ok(())
    }

    async fn abort(&self, slot: Slot) {
        match self.flash.abort_write(slot).await {
            Ok(()) => warn!("Aborted write to slot {}, boot slot unchanged", slot),
            Err(e) => error!("Failed to abort write to slot {}: {:#}", slot, e),
        }
    }

    /// Erase the asset region and write the image at `path` into it
    ///
    /// A layout without an asset region is not an error.
    pub async fn flash_asset(&self, path: &Path) -> OtaResult<AssetFlash> {
        let label = self.asset_label.as_str();
        let region = match self
            .flash
            .find_region(label)
            .await
            .map_err(|e| OtaError::Internal(format!("cannot query region {label}: {e:#}")))?
        {
            Some(region) => region,
            None => {
                warn!("No {} region in flash layout, skipping asset flash", label);
                return Ok(AssetFlash::SkippedNoRegion);
            }
        };

        if !self.storage.exists(path).await {
            return Err(OtaError::NotFound(format!(
                "asset image {} not found",
                path.display()
            )));
        }
        let size = self
            .storage
            .size(path)
            .await
            .map_err(|e| OtaError::from_storage(e, path.display()))?;
        if size > region.size {
            return Err(OtaError::InvalidArgument(format!(
                "asset image of {size} bytes exceeds {label} region ({} bytes)",
                region.size
            )));
        }

        info!("Erasing {} region ({} bytes)", label, region.size);
        self.flash
            .erase_region(label, 0, region.size)
            .await
            .map_err(|e| OtaError::WriteFailed(format!("erase {label}: {e:#}")))?;

        let mut offset = 0u64;
        while offset < size {
            let chunk = self
                .storage
                .read_range(path, offset, self.chunk_size)
                .await
                .map_err(|e| OtaError::from_storage(e, path.display()))?;
            if chunk.is_empty() {
                break;
            }
            self.flash
                .write_region(label, offset, &chunk)
                .await
                .map_err(|e| OtaError::WriteFailed(format!("write {label} at {offset}: {e:#}")))?;
            offset += chunk.len() as u64;
            self.reporter.publish(
                Progress::new(ProgressState::Flashing, format!("Writing {label} region"))
                    .with_bytes(offset, size),
            );
        }

        debug!("Wrote {} bytes to {} region", offset, label);
        info!("Asset region {} flashed", label);
        Ok(AssetFlash::Flashed {
            bytes_written: offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FileFlash, FileFlashGeometry, RegionInfo};
    use crate::image::{ImageHeader, build_image};
    use crate::storage::FsStorage;
    use tempfile::TempDir;

    struct Rig {
        dir: TempDir,
        flash: Arc<FileFlash>,
        committer: PartitionCommitter,
    }

    async fn rig(geometry: FileFlashGeometry) -> anyhow::Result<Rig> {
        let dir = TempDir::new()?;
        let running = build_image(&ImageHeader::new("1.0.0", "gw"), &[1u8; 128]);
        let flash = Arc::new(FileFlash::provision(dir.path().join("flash"), geometry, &running).await?);
        let committer = PartitionCommitter::new(
            flash.clone(),
            Arc::new(FsStorage::new()),
            ProgressReporter::default(),
            1000,
            "www",
        );
        Ok(Rig {
            dir,
            flash,
            committer,
        })
    }

    #[tokio::test]
    async fn test_flash_firmware_switches_boot_slot() -> anyhow::Result<()> {
        let rig = rig(FileFlashGeometry::default()).await?;
        let image = build_image(&ImageHeader::new("2.0.0", "gw"), &[9u8; 10_000]);
        let path = rig.dir.path().join("firmware.bin");
        tokio::fs::write(&path, &image).await?;

        let report = rig.committer.flash_firmware(&path).await?;
        assert_eq!(report.previous_slot, Slot::A);
        assert_eq!(report.boot_slot, Slot::B);
        assert_eq!(report.version, "2.0.0");
        assert_eq!(report.bytes_written, image.len() as u64);

        let info = rig.flash.slot_info(Slot::B).await?;
        assert!(info.boot);
        assert_eq!(rig.flash.read_slot(Slot::B).await?, image);
        Ok(())
    }

    #[tokio::test]
    async fn test_bad_header_never_touches_flash() -> anyhow::Result<()> {
        let rig = rig(FileFlashGeometry::default()).await?;
        let path = rig.dir.path().join("firmware.bin");
        tokio::fs::write(&path, vec![0u8; 4096]).await?;

        let err = rig.committer.flash_firmware(&path).await;
        assert!(matches!(err, Err(OtaError::VerifyFailed(_))));
        assert!(rig.flash.slot_info(Slot::A).await?.boot);
        assert!(rig.flash.read_slot(Slot::B).await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_oversized_image_rejected() -> anyhow::Result<()> {
        let rig = rig(FileFlashGeometry {
            slot_size: 1024,
            asset_region: None,
        })
        .await?;
        let path = rig.dir.path().join("firmware.bin");
        tokio::fs::write(&path, build_image(&ImageHeader::new("2.0.0", "gw"), &[0u8; 2048])).await?;

        let err = rig.committer.flash_firmware(&path).await;
        assert!(matches!(err, Err(OtaError::InvalidArgument(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_firmware_is_not_found() -> anyhow::Result<()> {
        let rig = rig(FileFlashGeometry::default()).await?;
        let err = rig.committer.flash_firmware(&rig.dir.path().join("nope.bin")).await;
        assert!(matches!(err, Err(OtaError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_flash_asset() -> anyhow::Result<()> {
        let rig = rig(FileFlashGeometry {
            slot_size: 1 << 20,
            asset_region: Some(RegionInfo {
                label: "www".to_string(),
                size: 4096,
            }),
        })
        .await?;

        let path = rig.dir.path().join("www.bin");
        tokio::fs::write(&path, vec![0xAB; 2500]).await?;
        let outcome = rig.committer.flash_asset(&path).await?;
        assert_eq!(outcome, AssetFlash::Flashed { bytes_written: 2500 });

        let region = rig.flash.read_region("www").await?;
        assert_eq!(region.get(2499), Some(&0xAB));
        assert_eq!(region.get(2500), Some(&0xFF));

        tokio::fs::write(&path, vec![0xAB; 5000]).await?;
        let err = rig.committer.flash_asset(&path).await;
        assert!(matches!(err, Err(OtaError::InvalidArgument(_))));
        // pre-flight rejection leaves the previous contents in place
        assert_eq!(rig.flash.read_region("www").await?.get(0), Some(&0xAB));
        Ok(())
    }

    #[tokio::test]
    async fn test_asset_without_region_is_skipped() -> anyhow::Result<()> {
        let rig = rig(FileFlashGeometry {
            slot_size: 1 << 20,
            asset_region: None,
        })
        .await?;
        let outcome = rig.committer.flash_asset(&rig.dir.path().join("www.bin")).await?;
        assert_eq!(outcome, AssetFlash::SkippedNoRegion);
        Ok(())
    }

    #[test]
    fn test_errors_carry_stage() {
        let err = tag(CommitStage::Writing, OtaError::WriteFailed("disk".into()));
        assert_eq!(err.to_string(), "Write failed: [writing] disk");
        assert!(matches!(
            tag(CommitStage::Idle, OtaError::Cancelled),
            OtaError::Cancelled
        ));
    }
}
