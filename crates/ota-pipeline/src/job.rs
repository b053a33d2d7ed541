//! Single-flight job manager
//!
//! At most one acquisition job (download or upload) runs per manager. The
//! slot is claimed with [`JobManager::try_start`] and released when the
//! returned [`JobTicket`] drops, so a panicking or early-returning worker can
//! never leave the slot stuck.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{OtaError, OtaResult};
use crate::staging::ArtifactKind;

/// Live state of the active job; counters are written only by its worker
#[derive(Debug)]
struct ActiveJob {
    id: Uuid,
    source: String,
    destination: PathBuf,
    kind: ArtifactKind,
    started_at: DateTime<Utc>,
    expected_total: AtomicU64,
    bytes_received: AtomicU64,
    cancel_requested: AtomicBool,
}

impl ActiveJob {
    fn status(&self) -> JobStatus {
        let expected = self.expected_total.load(Ordering::Acquire);
        JobStatus {
            id: self.id,
            source: self.source.clone(),
            destination: self.destination.clone(),
            kind: self.kind,
            started_at: self.started_at,
            expected_total: (expected > 0).then_some(expected),
            bytes_received: self.bytes_received.load(Ordering::Acquire),
            cancel_requested: self.cancel_requested.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time view of the active job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Job identifier
    pub id: Uuid,
    /// Source URL, or `upload` for in-memory uploads
    pub source: String,
    /// Final staging path of the artifact
    pub destination: PathBuf,
    /// Artifact being acquired
    pub kind: ArtifactKind,
    /// Start time
    pub started_at: DateTime<Utc>,
    /// Advertised size, if known
    pub expected_total: Option<u64>,
    /// Bytes received so far
    pub bytes_received: u64,
    /// Whether cancellation was requested
    pub cancel_requested: bool,
}

impl JobStatus {
    /// Whether this job stages a firmware image
    pub fn is_firmware(&self) -> bool {
        self.kind == ArtifactKind::Firmware
    }
}

/// Owner of the single-flight slot
#[derive(Debug, Clone, Default)]
pub struct JobManager {
    active: Arc<Mutex<Option<Arc<ActiveJob>>>>,
}

impl JobManager {
    /// Create an idle manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot, or fail with `Busy` leaving the active job untouched
    pub fn try_start(
        &self,
        source: impl Into<String>,
        destination: impl Into<PathBuf>,
        kind: ArtifactKind,
    ) -> OtaResult<JobTicket> {
        let mut active = self.active.lock();
        if let Some(job) = active.as_ref() {
            return Err(OtaError::Busy(format!(
                "{} job {} from {} is still running",
                job.kind, job.id, job.source
            )));
        }

        let job = Arc::new(ActiveJob {
            id: Uuid::new_v4(),
            source: source.into(),
            destination: destination.into(),
            kind,
            started_at: Utc::now(),
            expected_total: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            cancel_requested: AtomicBool::new(false),
        });
        *active = Some(job.clone());

        info!("Started {} job {} from {}", job.kind, job.id, job.source);
        Ok(JobTicket {
            slot: self.active.clone(),
            job,
        })
    }

    /// Request cooperative cancellation; returns whether a job was running
    pub fn cancel(&self) -> bool {
        match self.active.lock().as_ref() {
            Some(job) => {
                job.cancel_requested.store(true, Ordering::Release);
                info!("Cancellation requested for job {}", job.id);
                true
            }
            None => false,
        }
    }

    /// Snapshot of the active job
    pub fn status(&self) -> Option<JobStatus> {
        self.active.lock().as_ref().map(|job| job.status())
    }

    /// Whether a job holds the slot
    pub fn is_running(&self) -> bool {
        self.active.lock().is_some()
    }
}

/// Proof of holding the single-flight slot; releases it on drop
#[derive(Debug)]
pub struct JobTicket {
    slot: Arc<Mutex<Option<Arc<ActiveJob>>>>,
    job: Arc<ActiveJob>,
}

impl JobTicket {
    /// Job identifier
    pub fn id(&self) -> Uuid {
        self.job.id
    }

    /// Record the advertised size
    pub fn set_expected_total(&self, total: u64) {
        self.job.expected_total.store(total, Ordering::Release);
    }

    /// Add to the received byte counter, returning the new total
    pub fn add_received(&self, bytes: u64) -> u64 {
        self.job.bytes_received.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    /// Whether cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.job.cancel_requested.load(Ordering::Acquire)
    }

    /// Snapshot of this job
    pub fn status(&self) -> JobStatus {
        self.job.status()
    }
}

impl Drop for JobTicket {
    fn drop(&mut self) {
        let mut active = self.slot.lock();
        if active.as_ref().is_some_and(|job| job.id == self.job.id) {
            *active = None;
            debug!("Released job slot held by {}", self.job.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight() -> OtaResult<()> {
        let manager = JobManager::new();
        assert!(!manager.is_running());

        let ticket = manager.try_start("http://a/fw.bin", "/r/firmware.bin", ArtifactKind::Firmware)?;
        assert!(manager.is_running());

        let second = manager.try_start("http://b/fw.bin", "/r/firmware.bin", ArtifactKind::Firmware);
        assert!(matches!(second, Err(OtaError::Busy(_))));
        assert_eq!(manager.status().map(|s| s.id), Some(ticket.id()));

        drop(ticket);
        assert!(!manager.is_running());
        assert!(matches!(
            manager.try_start("upload", "/r/www.bin", ArtifactKind::Asset),
            Ok(_)
        ));
        Ok(())
    }

    #[test]
    fn test_counters_and_cancel() -> OtaResult<()> {
        let manager = JobManager::new();
        assert!(!manager.cancel());

        let ticket = manager.try_start("http://a/fw.bin", "/r/firmware.bin", ArtifactKind::Firmware)?;
        assert_eq!(manager.status().and_then(|s| s.expected_total), None);

        ticket.set_expected_total(1000);
        ticket.add_received(300);
        assert_eq!(ticket.add_received(200), 500);
        assert!(!ticket.is_cancelled());

        assert!(manager.cancel());
        assert!(ticket.is_cancelled());

        let status = ticket.status();
        assert_eq!(status.expected_total, Some(1000));
        assert_eq!(status.bytes_received, 500);
        assert!(status.cancel_requested);
        assert!(status.is_firmware());
        Ok(())
    }

    #[test]
    fn test_concurrent_claims_admit_one() {
        let manager = JobManager::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = manager.clone();
                std::thread::spawn(move || {
                    manager
                        .try_start(format!("http://host/{i}"), "/r/firmware.bin", ArtifactKind::Firmware)
                        .ok()
                })
            })
            .collect();

        let tickets: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().ok().flatten())
            .collect();
        assert_eq!(tickets.len(), 1);
    }
}
