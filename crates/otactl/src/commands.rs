//! Command implementations

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use ota_pipeline::prelude::*;
use ota_pipeline::{FileFlashGeometry, SlotInfo, StagingLayout};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::CliError;
use crate::output;

/// Everything a command needs to talk to the emulated device
pub struct Device {
    config: OtaConfig,
    flash: Arc<FileFlash>,
    storage: Arc<dyn Storage>,
    system: Arc<EmulatedSystem>,
}

impl Device {
    pub async fn open(config_path: &Path, device_dir: &Path) -> Result<Self> {
        let config = OtaConfig::load_from_path(config_path)
            .await
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

        if !device_dir.join("otadata.json").exists() {
            return Err(CliError::DeviceNotProvisioned(format!(
                "{} (run `otactl provision <image>` first)",
                device_dir.display()
            ))
            .into());
        }
        let flash = Arc::new(FileFlash::open(device_dir).await?);
        let system = Arc::new(EmulatedSystem::new(flash.clone()));

        Ok(Self {
            config,
            flash,
            storage: Arc::new(FsStorage::new()),
            system,
        })
    }

    fn engine(&self) -> Result<AcquisitionEngine> {
        let transport = Arc::new(HttpTransport::new(&self.config.acquisition)?);
        Ok(AcquisitionEngine::new(
            &self.config,
            self.storage.clone(),
            transport,
            self.flash.clone(),
            self.system.clone(),
        ))
    }

    fn recovery(&self) -> RecoveryController {
        RecoveryController::new(
            &self.config,
            self.storage.clone(),
            self.flash.clone(),
            self.system.clone(),
            ProgressReporter::default(),
        )
    }

    async fn slots(&self) -> Result<Vec<SlotInfo>> {
        let mut slots = Vec::with_capacity(2);
        for slot in [Slot::A, Slot::B] {
            slots.push(self.flash.slot_info(slot).await?);
        }
        Ok(slots)
    }
}

fn kind(asset: bool) -> ArtifactKind {
    if asset {
        ArtifactKind::Asset
    } else {
        ArtifactKind::Firmware
    }
}

/// Create a fresh emulated device with `image` running from slot A
pub async fn provision(device_dir: &Path, image: &Path, slot_size: u64, json: bool) -> Result<()> {
    if device_dir.join("otadata.json").exists() {
        return Err(CliError::InvalidInput(format!(
            "{} is already provisioned",
            device_dir.display()
        ))
        .into());
    }

    let data = tokio::fs::read(image)
        .await
        .with_context(|| format!("Failed to read {}", image.display()))?;
    ImageHeader::parse(&data).map_err(|e| CliError::InvalidInput(format!("{}: {e}", image.display())))?;

    let geometry = FileFlashGeometry {
        slot_size,
        ..FileFlashGeometry::default()
    };
    let flash = FileFlash::provision(device_dir, geometry, &data).await?;
    let version = flash.running_version().await?;

    output::print_success(
        &format!("Provisioned {} running v{}", device_dir.display(), version),
        json,
    );
    Ok(())
}

/// Boot-time recovery check
pub async fn recover(device: &Device, json: bool) -> Result<()> {
    let outcome = device.recovery().check_and_apply_recovery().await?;
    output::print_recovery(&outcome, json);
    Ok(())
}

/// Stream an image into staging
pub async fn download(
    device: &Device,
    url: &str,
    asset: bool,
    insecure: bool,
    apply: bool,
    json: bool,
) -> Result<()> {
    let engine = device.engine()?;
    let request = match kind(asset) {
        ArtifactKind::Firmware => DownloadRequest::firmware(url),
        ArtifactKind::Asset => DownloadRequest::asset(url),
    }
    .skip_cert_verify(insecure)
    .auto_apply(apply);

    let (sink, mut rx) = progress_channel(device.config.acquisition.progress_bus_capacity);
    let job = engine.start_download(request, Some(sink))?;
    info!("Started download job {}", job.id());

    let pb = if json {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("#>-");
        pb.set_style(style);
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    };

    loop {
        tokio::select! {
            update = rx.recv() => match update {
                Some(progress) => {
                    if progress.bytes_total > 0 {
                        pb.set_length(progress.bytes_total);
                    }
                    pb.set_position(progress.bytes_done);
                    pb.set_message(progress.message.clone());
                    if progress.state.is_terminal() {
                        break;
                    }
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                pb.set_message("Aborting...");
                if !engine.abort() {
                    warn!("No download running");
                }
            }
        }
    }
    pb.finish_and_clear();

    let report = job.wait().await?;
    output::print_acquisition(&report, json);
    Ok(())
}

/// Stage an image from a local file
pub async fn upload(device: &Device, file: &Path, asset: bool, apply: bool, json: bool) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let report = device
        .engine()?
        .save_upload(&data, kind(asset), apply)
        .await?;
    output::print_acquisition(&report, json);
    Ok(())
}

/// Flash what is currently staged
pub async fn apply(device: &Device, asset: bool, json: bool) -> Result<()> {
    let engine = device.engine()?;
    if asset {
        let report = engine.flash_staged_asset().await?;
        output::print_asset_report(&report, json);
    } else {
        let report = engine.flash_staged_firmware().await?;
        output::print_commit_report(&report, json);
    }
    Ok(())
}

/// Show slots and staging contents
pub async fn status(device: &Device, json: bool) -> Result<()> {
    let staging = device.engine()?.inspect_staging().await?;
    let slots = device.slots().await?;
    output::print_status(&staging, &slots, json);
    Ok(())
}

/// Remove everything from staging
pub async fn clean(device: &Device, json: bool) -> Result<()> {
    device.engine()?.clean_staging().await?;
    output::print_success("Staging area cleaned", json);
    Ok(())
}

/// Write a manifest for a hand-copied firmware image
pub async fn prepare(device: &Device, version: &str, force: bool, json: bool) -> Result<()> {
    if version.trim().is_empty() {
        return Err(CliError::InvalidInput("version must not be empty".to_string()).into());
    }
    let manifest = device.engine()?.prepare_recovery(version, force).await?;
    output::print_manifest(&manifest, json);
    Ok(())
}

/// Write a default configuration file
pub async fn init_config(path: &Path, force: bool, json: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(CliError::InvalidInput(format!(
            "{} exists (use --force to overwrite)",
            path.display()
        ))
        .into());
    }
    let config = OtaConfig::default();
    config.save_to_path(path).await?;
    let layout = StagingLayout::from_config(&config.staging);

    output::print_success(
        &format!(
            "Wrote {} (staging in {})",
            path.display(),
            layout.dir().display()
        ),
        json,
    );
    Ok(())
}
