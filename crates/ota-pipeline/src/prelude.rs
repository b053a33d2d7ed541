//! Convenience re-exports for common pipeline types

pub use crate::acquisition::{AcquisitionEngine, AcquisitionReport, DownloadRequest, JobHandle};
pub use crate::committer::{AssetFlash, CommitReport, PartitionCommitter};
pub use crate::config::OtaConfig;
pub use crate::error::{OtaError, OtaResult};
pub use crate::flash::{FileFlash, FileFlashGeometry, FlashDevice, Slot};
pub use crate::image::{ImageHeader, ImageVerifier};
pub use crate::manifest::{Manifest, ManifestCodec, ManifestLoad};
pub use crate::progress::{Progress, ProgressReporter, ProgressState, progress_channel};
pub use crate::recovery::{RecoveryController, RecoveryOutcome};
pub use crate::staging::{ArtifactKind, StagingLayout, StagingStatus};
pub use crate::storage::{FsStorage, Storage};
pub use crate::system::{EmulatedSystem, SystemControl};
pub use crate::transport::{HttpTransport, Transport};
