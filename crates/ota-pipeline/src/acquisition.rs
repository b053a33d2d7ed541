//! Acquisition engine
//!
//! Streams an update image from a URL (or accepts an in-memory upload) into
//! the staging area. Transfers land in the scratch file first and are only
//! renamed into place once complete and verified, so a previously staged good
//! image is never replaced by a partial one.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::committer::{AssetFlash, CommitReport, PartitionCommitter};
use crate::config::OtaConfig;
use crate::error::{OtaError, OtaResult};
use crate::flash::FlashDevice;
use crate::image::ImageVerifier;
use crate::job::{JobManager, JobStatus, JobTicket};
use crate::manifest::{Manifest, ManifestCodec};
use crate::progress::{JobProgress, Progress, ProgressReporter, ProgressSink, ProgressState};
use crate::staging::{ArtifactKind, StagingArea, StagingLayout, StagingStatus};
use crate::storage::Storage;
use crate::system::SystemControl;
use crate::transport::{RequestOptions, ResponseStream, Transport};

/// HTTP statuses accepted as a successful response
const ACCEPTED_STATUS: [u16; 2] = [200, 206];

/// A download to stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Source URL (`http` or `https`)
    pub url: String,
    /// What the download contains
    pub kind: ArtifactKind,
    /// Accept any server certificate
    pub skip_cert_verify: bool,
    /// Flash right after staging
    pub auto_apply: bool,
}

impl DownloadRequest {
    /// Firmware download from `url`
    pub fn firmware(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: ArtifactKind::Firmware,
            skip_cert_verify: false,
            auto_apply: false,
        }
    }

    /// Asset image download from `url`
    pub fn asset(url: impl Into<String>) -> Self {
        Self {
            kind: ArtifactKind::Asset,
            ..Self::firmware(url)
        }
    }

    /// Disable certificate verification
    pub fn skip_cert_verify(mut self, skip: bool) -> Self {
        self.skip_cert_verify = skip;
        self
    }

    /// Flash immediately once staged
    pub fn auto_apply(mut self, apply: bool) -> Self {
        self.auto_apply = apply;
        self
    }
}

/// What an immediate apply did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Applied {
    /// Firmware committed and restart requested
    Firmware(CommitReport),
    /// Asset region written (or skipped)
    Asset(AssetFlash),
}

/// Outcome of a staged download or upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionReport {
    /// Artifact staged
    pub kind: ArtifactKind,
    /// Bytes staged
    pub bytes: u64,
    /// Version from the image header (firmware only)
    pub version: Option<String>,
    /// Manifest written alongside, if any
    pub manifest: Option<Manifest>,
    /// Result of the immediate apply, when requested
    pub applied: Option<Applied>,
}

/// Outcome of [`AcquisitionEngine::save_upload`]
pub type UploadOutcome = AcquisitionReport;

/// Handle to a running download worker
///
/// Dropping the handle detaches the worker; it keeps running.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    join: JoinHandle<OtaResult<AcquisitionReport>>,
}

impl JobHandle {
    /// Job identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Whether the worker has finished
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the worker to finish
    pub async fn wait(self) -> OtaResult<AcquisitionReport> {
        self.join
            .await
            .map_err(|e| OtaError::Internal(format!("download worker failed: {e}")))?
    }
}

struct EngineInner {
    staging: StagingArea,
    manifest: ManifestCodec,
    verifier: ImageVerifier,
    committer: PartitionCommitter,
    transport: Arc<dyn Transport>,
    system: Arc<dyn SystemControl>,
    jobs: JobManager,
    reporter: ProgressReporter,
    buffer_size: usize,
    reboot_delay: Duration,
    verify_checksum: bool,
}

/// Download/upload staging engine
#[derive(Clone)]
pub struct AcquisitionEngine {
    inner: Arc<EngineInner>,
}

impl AcquisitionEngine {
    /// Wire an engine from configuration and collaborators
    pub fn new(
        config: &OtaConfig,
        storage: Arc<dyn Storage>,
        transport: Arc<dyn Transport>,
        flash: Arc<dyn FlashDevice>,
        system: Arc<dyn SystemControl>,
    ) -> Self {
        let layout = StagingLayout::from_config(&config.staging);
        let reporter = ProgressReporter::new(config.acquisition.progress_bus_capacity);
        let committer = PartitionCommitter::new(
            flash,
            storage.clone(),
            reporter.clone(),
            config.commit.flash_chunk_size,
            config.commit.asset_region_label.clone(),
        );

        Self {
            inner: Arc::new(EngineInner {
                staging: StagingArea::new(layout.clone(), storage.clone()),
                manifest: ManifestCodec::new(layout, storage.clone(), config.manifest_max_bytes),
                verifier: ImageVerifier::new(storage),
                committer,
                transport,
                system,
                jobs: JobManager::new(),
                reporter,
                buffer_size: config.acquisition.transfer_buffer_size,
                reboot_delay: config.recovery.reboot_delay(),
                verify_checksum: config.recovery.verify_checksum_before_flash,
            }),
        }
    }

    /// Progress bus shared by all jobs
    pub fn progress(&self) -> &ProgressReporter {
        &self.inner.reporter
    }

    /// Staging paths
    pub fn layout(&self) -> &StagingLayout {
        self.inner.staging.layout()
    }

    /// Start a background download
    ///
    /// Returns `Busy` if another job holds the slot; the running job is not
    /// affected. Intermediate progress is offered to `sink` without blocking.
    /// The terminal `Done`/`Error` update reaches the bus before the slot is
    /// released and waits a bounded time for room in `sink`.
    pub fn start_download(
        &self,
        request: DownloadRequest,
        sink: Option<ProgressSink>,
    ) -> OtaResult<JobHandle> {
        let url = parse_source_url(&request.url)?;
        let destination = self.layout().artifact(request.kind).to_path_buf();
        let ticket = self
            .inner
            .jobs
            .try_start(url.as_str(), destination, request.kind)?;
        let id = ticket.id();

        let inner = self.inner.clone();
        let join = tokio::spawn(async move {
            let progress = JobProgress::new(inner.reporter.clone(), sink);
            let result = inner.run_download(&ticket, &url, &request, &progress).await;
            let terminal = inner.finish_job(&progress, &ticket.status(), &result);
            drop(ticket);

            progress.deliver_terminal(terminal).await;
            result
        });

        Ok(JobHandle { id, join })
    }

    /// Stage an image received in memory (browser upload)
    ///
    /// Uploads take the same single-flight slot as downloads. A staged
    /// firmware upload is marked `force`.
    pub async fn save_upload(
        &self,
        data: &[u8],
        kind: ArtifactKind,
        auto_apply: bool,
    ) -> OtaResult<UploadOutcome> {
        if data.is_empty() {
            return Err(OtaError::InvalidArgument("upload is empty".to_string()));
        }

        let ticket = self
            .inner
            .jobs
            .try_start("upload", self.layout().artifact(kind), kind)?;
        let progress = JobProgress::new(self.inner.reporter.clone(), None);

        let result = self
            .inner
            .run_upload(&ticket, data, kind, auto_apply, &progress)
            .await;
        self.inner.finish_job(&progress, &ticket.status(), &result);
        drop(ticket);
        result
    }

    /// Request cancellation of the active job; returns whether one was running
    pub fn abort(&self) -> bool {
        self.inner.jobs.cancel()
    }

    /// Whether a job holds the single-flight slot
    pub fn is_running(&self) -> bool {
        self.inner.jobs.is_running()
    }

    /// Snapshot of the active job
    pub fn status(&self) -> Option<JobStatus> {
        self.inner.jobs.status()
    }

    /// Flash the staged firmware now, clean up per the manifest and restart
    pub async fn flash_staged_firmware(&self) -> OtaResult<CommitReport> {
        let _ticket = self.inner.jobs.try_start(
            "apply",
            self.layout().firmware(),
            ArtifactKind::Firmware,
        )?;
        self.inner.apply_firmware(self.inner.verify_checksum).await
    }

    /// Flash the staged asset image now
    pub async fn flash_staged_asset(&self) -> OtaResult<AssetFlash> {
        let _ticket =
            self.inner
                .jobs
                .try_start("apply", self.layout().asset(), ArtifactKind::Asset)?;
        self.inner.apply_asset().await
    }

    /// Describe what is currently staged
    pub async fn inspect_staging(&self) -> OtaResult<StagingStatus> {
        let staging = &self.inner.staging;
        let layout = staging.layout();

        let has_firmware = staging.has_firmware().await;
        let firmware_version = if has_firmware {
            match self.inner.verifier.verify(layout.firmware()).await {
                Ok(info) => Some(info.version),
                Err(e) => {
                    warn!("Staged firmware does not verify: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let manifest = match self.inner.manifest.read().await {
            Ok(m) => Some(m),
            Err(OtaError::NotFound(_)) => None,
            Err(e) => {
                warn!("Staged manifest unreadable: {}", e);
                None
            }
        };

        Ok(StagingStatus {
            dir: layout.dir().to_path_buf(),
            has_firmware,
            has_asset: staging.has_asset().await,
            has_manifest: staging.storage().exists(layout.manifest()).await,
            firmware_version,
            firmware_size: staging.size_of(layout.firmware()).await,
            asset_size: staging.size_of(layout.asset()).await,
            manifest,
        })
    }

    /// Delete every staged file; refused while a job is running
    pub async fn clean_staging(&self) -> OtaResult<()> {
        let _ticket = self.inner.jobs.try_start(
            "clean",
            self.layout().dir(),
            ArtifactKind::Firmware,
        )?;
        self.inner.staging.clean().await
    }

    /// Write a manifest for a firmware image copied into staging by hand
    pub async fn prepare_recovery(&self, version: &str, force: bool) -> OtaResult<Manifest> {
        let _ticket = self.inner.jobs.try_start(
            "prepare",
            self.layout().manifest(),
            ArtifactKind::Firmware,
        )?;
        let manifest = self
            .inner
            .manifest
            .refresh(Some(version.to_string()), force)
            .await?;
        info!("Recovery prepared: version={}, force={}", version, force);
        Ok(manifest)
    }
}

/// Parse a download URL, accepting only `http` and `https`
fn parse_source_url(raw: &str) -> OtaResult<Url> {
    let url = Url::parse(raw)
        .map_err(|e| OtaError::InvalidArgument(format!("invalid URL {raw:?}: {e}")))?;
    match url.scheme() {
        "https" => Ok(url),
        "http" => {
            warn!("Using plain HTTP (insecure): {}", url);
            Ok(url)
        }
        other => Err(OtaError::InvalidArgument(format!(
            "unsupported URL scheme {other:?}"
        ))),
    }
}

fn alloc_buffer(size: usize) -> OtaResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size).map_err(|e| {
        OtaError::OutOfMemory(format!("transfer buffer of {size} bytes: {e}"))
    })?;
    buf.resize(size, 0);
    Ok(buf)
}

impl EngineInner {
    async fn run_download(
        &self,
        ticket: &JobTicket,
        url: &Url,
        request: &DownloadRequest,
        progress: &JobProgress,
    ) -> OtaResult<AcquisitionReport> {
        info!("Download started: {} -> {}", url, request.kind);
        self.staging.ensure_dir().await?;
        let scratch = self.staging.layout().scratch();
        self.staging.discard(scratch).await;

        progress.update(Progress::new(
            ProgressState::Downloading,
            "Connecting to server",
        ));

        if request.skip_cert_verify {
            warn!("TLS certificate verification disabled for {}", url);
        }
        let options = RequestOptions {
            skip_cert_verify: request.skip_cert_verify,
        };
        let mut stream = self
            .transport
            .open(url, &options)
            .await
            .map_err(|e| OtaError::ConnectionFailed(format!("{e:#}")))?;

        let status = stream.status();
        if !ACCEPTED_STATUS.contains(&status) {
            return Err(OtaError::DownloadFailed(format!("server returned HTTP {status}")));
        }

        // a zero length is treated as unknown
        let expected = stream.content_length().filter(|&len| len > 0);
        match expected {
            Some(len) => {
                info!("Content-Length: {}", len);
                ticket.set_expected_total(len);
            }
            None => warn!("Content-Length unknown"),
        }

        let mut buf = alloc_buffer(self.buffer_size)?;
        self.staging
            .storage()
            .write(scratch, b"")
            .await
            .map_err(|e| OtaError::WriteFailed(format!("{}: {e}", scratch.display())))?;

        let streamed = self
            .stream_to_scratch(ticket, stream.as_mut(), &mut buf, expected, progress)
            .await;
        let received = match streamed {
            Ok(received) => received,
            Err(e) => {
                self.staging.discard(scratch).await;
                return Err(e);
            }
        };

        if let Some(len) = expected {
            if received != len {
                error!("Size mismatch: {} / {}", received, len);
                self.staging.discard(scratch).await;
                return Err(OtaError::SizeMismatch {
                    expected: len,
                    received,
                });
            }
        }

        info!("Download completed: {} bytes", received);
        self.stage_scratch(
            ticket,
            request.kind,
            received,
            false,
            request.auto_apply,
            progress,
        )
        .await
    }

    async fn stream_to_scratch(
        &self,
        ticket: &JobTicket,
        stream: &mut dyn ResponseStream,
        buf: &mut [u8],
        expected: Option<u64>,
        progress: &JobProgress,
    ) -> OtaResult<u64> {
        let scratch = self.staging.layout().scratch();
        let mut received = 0u64;

        loop {
            if ticket.is_cancelled() {
                info!("Download aborted by user after {} bytes", received);
                return Err(OtaError::Cancelled);
            }

            let n = stream.read_chunk(buf).await.map_err(|e| {
                OtaError::DownloadFailed(format!("connection lost after {received} bytes: {e:#}"))
            })?;
            if n == 0 {
                return Ok(received);
            }

            let chunk = buf
                .get(..n)
                .ok_or_else(|| OtaError::Internal(format!("transport returned {n} bytes")))?;
            self.staging
                .storage()
                .append(scratch, chunk)
                .await
                .map_err(|e| OtaError::WriteFailed(format!("{}: {e}", scratch.display())))?;

            received = ticket.add_received(n as u64);
            progress.update(
                Progress::new(ProgressState::Downloading, "Downloading")
                    .with_bytes(received, expected.unwrap_or(0)),
            );
        }
    }

    async fn run_upload(
        &self,
        ticket: &JobTicket,
        data: &[u8],
        kind: ArtifactKind,
        auto_apply: bool,
        progress: &JobProgress,
    ) -> OtaResult<AcquisitionReport> {
        let len = data.len() as u64;
        ticket.set_expected_total(len);
        self.staging.ensure_dir().await?;

        progress.update(
            Progress::new(ProgressState::Downloading, "Saving uploaded file").with_bytes(0, len),
        );

        let scratch = self.staging.layout().scratch();
        if let Err(e) = self.staging.storage().write(scratch, data).await {
            self.staging.discard(scratch).await;
            return Err(OtaError::WriteFailed(format!("{}: {e}", scratch.display())));
        }
        ticket.add_received(len);
        info!("Saved {} upload ({} bytes)", kind, len);

        self.stage_scratch(ticket, kind, len, true, auto_apply, progress)
            .await
    }

    /// Verify the scratch file, move it into place and refresh the manifest
    async fn stage_scratch(
        &self,
        ticket: &JobTicket,
        kind: ArtifactKind,
        bytes: u64,
        force: bool,
        auto_apply: bool,
        progress: &JobProgress,
    ) -> OtaResult<AcquisitionReport> {
        let layout = self.staging.layout();
        let scratch = layout.scratch();

        let version = match kind {
            ArtifactKind::Firmware => {
                progress.update(
                    Progress::new(ProgressState::Verifying, "Verifying firmware")
                        .with_bytes(bytes, bytes),
                );
                match self.verifier.verify(scratch).await {
                    Ok(info) => Some(info.version),
                    Err(e) => {
                        error!("Firmware verification failed: {}", e);
                        self.staging.discard(scratch).await;
                        return Err(e);
                    }
                }
            }
            ArtifactKind::Asset => None,
        };

        if ticket.is_cancelled() {
            info!("{} aborted by user before staging", kind);
            self.staging.discard(scratch).await;
            return Err(OtaError::Cancelled);
        }

        let destination = layout.artifact(kind);
        if let Err(e) = self.staging.storage().rename(scratch, destination).await {
            self.staging.discard(scratch).await;
            return Err(OtaError::WriteFailed(format!(
                "{}: {e}",
                destination.display()
            )));
        }
        info!("Staged {} at {}", kind, destination.display());

        let manifest = self.refresh_manifest(kind, version.clone(), force).await;

        let applied = if auto_apply {
            Some(match kind {
                ArtifactKind::Firmware => {
                    info!("Auto-applying staged firmware");
                    Applied::Firmware(self.apply_firmware(false).await?)
                }
                ArtifactKind::Asset => {
                    info!("Auto-applying staged asset image");
                    Applied::Asset(self.apply_asset().await?)
                }
            })
        } else {
            None
        };

        Ok(AcquisitionReport {
            kind,
            bytes,
            version,
            manifest,
            applied,
        })
    }

    /// Rewrite the manifest after staging; failures are logged, not returned
    async fn refresh_manifest(
        &self,
        kind: ArtifactKind,
        version: Option<String>,
        force: bool,
    ) -> Option<Manifest> {
        if !self.staging.has_firmware().await {
            return None;
        }

        // an asset staged next to an existing firmware keeps its policy
        let (version, force) = match (kind, self.manifest.read().await) {
            (ArtifactKind::Asset, Ok(existing)) => (Some(existing.target_version), existing.force),
            _ => (version, force),
        };

        match self.manifest.refresh(version, force).await {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Failed to write manifest (non-fatal): {}", e);
                None
            }
        }
    }

    async fn apply_firmware(&self, verify_checksum: bool) -> OtaResult<CommitReport> {
        let layout = self.staging.layout();
        if !self.staging.has_firmware().await {
            return Err(OtaError::NotFound(format!(
                "no firmware staged at {}",
                layout.firmware().display()
            )));
        }

        let manifest = match self.manifest.read().await {
            Ok(m) => Some(m),
            Err(OtaError::NotFound(_)) => None,
            Err(e) => {
                warn!("Ignoring unreadable manifest: {}", e);
                None
            }
        };

        if verify_checksum {
            if let Some(expected) = manifest.as_ref().and_then(|m| m.firmware_sha256.as_deref()) {
                self.verifier
                    .verify_checksum(layout.firmware(), expected)
                    .await?;
            }
        }

        let report = self.committer.flash_firmware(layout.firmware()).await?;

        if manifest.as_ref().is_none_or(|m| m.delete_after_apply) {
            if let Err(e) = self.staging.clean().await {
                warn!("Failed to clean staging after apply: {}", e);
            }
        }

        info!(
            "Restarting in {} ms to boot v{}",
            self.reboot_delay.as_millis(),
            report.version
        );
        tokio::time::sleep(self.reboot_delay).await;
        self.system
            .restart()
            .await
            .map_err(|e| OtaError::Internal(format!("restart failed: {e:#}")))?;

        Ok(report)
    }

    async fn apply_asset(&self) -> OtaResult<AssetFlash> {
        let asset = self.staging.layout().asset();
        if !self.staging.has_asset().await {
            return Err(OtaError::NotFound(format!(
                "no asset image staged at {}",
                asset.display()
            )));
        }
        self.committer.flash_asset(asset).await
    }

    /// Publish the terminal state on the bus and return it for the sink
    fn finish_job(
        &self,
        progress: &JobProgress,
        status: &JobStatus,
        result: &OtaResult<AcquisitionReport>,
    ) -> Progress {
        let terminal = match result {
            Ok(report) => Progress::new(
                ProgressState::Done,
                format!("{} staged ({} bytes)", report.kind, report.bytes),
            )
            .with_bytes(report.bytes, report.bytes),
            Err(e) => {
                error!("{} job {} failed: {}", status.kind, status.id, e);
                Progress::new(ProgressState::Error, e.to_string()).with_bytes(
                    status.bytes_received,
                    status.expected_total.unwrap_or(0),
                )
            }
        };
        progress.finish(&terminal);
        terminal
    }
}
