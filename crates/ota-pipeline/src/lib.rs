//! Staged firmware update pipeline
//!
//! This crate acquires firmware and asset images, stages them on persistent
//! storage and commits them to flash so that the device never ends up
//! unbootable, wherever power is lost along the way:
//! - Streaming download or in-memory upload into a staging area
//! - Structural image header validation and SHA-256 digests
//! - A durable JSON manifest recording the pending update
//! - A/B slot commit with a single atomic boot pointer switch
//! - Boot-time recovery that replays a staged but unapplied update
//!
//! # Architecture
//!
//! - [`acquisition`]: Download/upload engine with single-flight jobs
//! - [`image`]: Image header parsing and integrity checks
//! - [`manifest`]: Manifest codec and fallback policy
//! - [`committer`]: Flash writes and boot slot switching
//! - [`recovery`]: Boot-time recovery controller
//! - [`progress`]: Progress bus and per-job sinks
//! - [`staging`]: Staging area layout and housekeeping
//! - [`transport`], [`storage`], [`flash`], [`system`]: Collaborator traits
//!   and host implementations
//! - [`config`]: Configuration
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```ignore
//! use ota_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OtaConfig::load_from_path("ota.json").await?;
//! let flash = Arc::new(FileFlash::open("device").await?);
//! let storage: Arc<dyn Storage> = Arc::new(FsStorage::new());
//! let system = Arc::new(EmulatedSystem::new(flash.clone()));
//!
//! // At boot, before anything else touches the staging area
//! let recovery = RecoveryController::new(
//!     &config,
//!     storage.clone(),
//!     flash.clone(),
//!     system.clone(),
//!     ProgressReporter::default(),
//! );
//! recovery.check_and_apply_recovery().await?;
//!
//! let transport = Arc::new(HttpTransport::new(&config.acquisition)?);
//! let engine = AcquisitionEngine::new(&config, storage, transport, flash, system);
//! let job = engine.start_download(DownloadRequest::firmware("https://example.com/fw.bin"), None)?;
//! let report = job.wait().await?;
//! println!("Staged {} bytes", report.bytes);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn, clippy::unwrap_used)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod acquisition;
pub mod committer;
pub mod config;
pub mod error;
pub mod flash;
pub mod image;
pub mod job;
pub mod manifest;
pub mod prelude;
pub mod progress;
pub mod recovery;
pub mod staging;
pub mod storage;
pub mod system;
pub mod transport;

pub use acquisition::{
    AcquisitionEngine, AcquisitionReport, Applied, DownloadRequest, JobHandle, UploadOutcome,
};
pub use committer::{AssetFlash, CommitReport, CommitStage, PartitionCommitter};
pub use config::{AcquisitionConfig, CommitConfig, OtaConfig, RecoveryConfig, StagingConfig};
pub use error::{OtaError, OtaResult};
pub use flash::{FileFlash, FileFlashGeometry, FlashDevice, RegionInfo, Slot, SlotInfo, SlotState};
pub use image::{
    HeaderError, ImageHeader, ImageInfo, ImageVerifier, build_image, compute_data_hash,
};
pub use job::{JobManager, JobStatus, JobTicket};
pub use manifest::{Manifest, ManifestCodec, ManifestLoad};
pub use progress::{Progress, ProgressReporter, ProgressSink, ProgressState, progress_channel};
pub use recovery::{AssetRecovery, RecoveryController, RecoveryOutcome, RecoverySummary};
pub use staging::{ArtifactKind, StagingArea, StagingLayout, StagingStatus};
pub use storage::{FsStorage, Storage};
pub use system::{EmulatedSystem, SystemControl};
pub use transport::{HttpTransport, RequestOptions, ResponseStream, Transport};
