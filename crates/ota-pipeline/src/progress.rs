//! Progress reporting
//!
//! Progress travels two ways: every update is published on a broadcast bus
//! (any number of late-joining observers), and a job may additionally carry a
//! bounded per-job sink. Intermediate updates are dropped for a slow sink
//! rather than stalling the transfer. A terminal update waits a bounded time
//! for room in the sink; the bus always carries it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// How long a terminal update waits for an undrained sink
const TERMINAL_DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Phase of an update operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressState {
    /// Nothing in progress
    #[default]
    Idle,
    /// Receiving data
    Downloading,
    /// Checking a received image
    Verifying,
    /// Writing to flash
    Flashing,
    /// Finished successfully
    Done,
    /// Finished with an error
    Error,
}

impl ProgressState {
    /// Whether no further updates follow this state
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressState::Done | ProgressState::Error)
    }
}

impl std::fmt::Display for ProgressState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProgressState::Idle => "idle",
            ProgressState::Downloading => "downloading",
            ProgressState::Verifying => "verifying",
            ProgressState::Flashing => "flashing",
            ProgressState::Done => "done",
            ProgressState::Error => "error",
        };
        f.write_str(name)
    }
}

/// A self-contained progress update
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Progress {
    /// Current phase
    pub state: ProgressState,

    /// Total bytes expected, 0 if unknown
    pub bytes_total: u64,

    /// Bytes processed so far
    pub bytes_done: u64,

    /// Human-readable status line
    pub message: String,
}

impl Progress {
    /// Create a progress update
    pub fn new(state: ProgressState, message: impl Into<String>) -> Self {
        Self {
            state,
            bytes_total: 0,
            bytes_done: 0,
            message: message.into(),
        }
    }

    /// Attach byte counters
    pub fn with_bytes(mut self, done: u64, total: u64) -> Self {
        self.bytes_done = done;
        self.bytes_total = total;
        self
    }

    /// Completion percentage, `None` while the total is unknown
    pub fn percent(&self) -> Option<u8> {
        if self.bytes_total == 0 {
            return None;
        }
        let pct = self.bytes_done.min(self.bytes_total).saturating_mul(100) / self.bytes_total;
        Some(u8::try_from(pct).unwrap_or(100))
    }
}

/// Per-job progress channel handed to the acquisition engine
pub type ProgressSink = mpsc::Sender<Progress>;

/// Create a per-job sink and its receiving end
pub fn progress_channel(capacity: usize) -> (ProgressSink, mpsc::Receiver<Progress>) {
    mpsc::channel(capacity.max(1))
}

/// Broadcast bus plus the latest snapshot
#[derive(Clone)]
pub struct ProgressReporter {
    tx: broadcast::Sender<Progress>,
    latest: Arc<RwLock<Progress>>,
}

impl ProgressReporter {
    /// Create a reporter whose bus buffers `capacity` updates per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            latest: Arc::new(RwLock::new(Progress::default())),
        }
    }

    /// Publish an update to the bus and record it as the snapshot
    pub fn publish(&self, progress: Progress) {
        *self.latest.write() = progress.clone();
        if self.tx.send(progress).is_err() {
            debug!("No progress subscribers");
        }
    }

    /// Subscribe to future updates
    pub fn subscribe(&self) -> broadcast::Receiver<Progress> {
        self.tx.subscribe()
    }

    /// Latest published update
    pub fn snapshot(&self) -> Progress {
        self.latest.read().clone()
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Fans one job's updates out to the bus and its optional sink
pub(crate) struct JobProgress {
    reporter: ProgressReporter,
    sink: Option<ProgressSink>,
}

impl JobProgress {
    pub(crate) fn new(reporter: ProgressReporter, sink: Option<ProgressSink>) -> Self {
        Self { reporter, sink }
    }

    /// Intermediate update: never waits on the sink
    pub(crate) fn update(&self, progress: Progress) {
        if let Some(sink) = &self.sink {
            if let Err(mpsc::error::TrySendError::Full(_)) = sink.try_send(progress.clone()) {
                debug!("Progress sink full, dropping {} update", progress.state);
            }
        }
        self.reporter.publish(progress);
    }

    /// Terminal update on the bus; published while the job still holds its slot
    pub(crate) fn finish(&self, progress: &Progress) {
        self.reporter.publish(progress.clone());
    }

    /// Terminal update to the sink, waiting at most [`TERMINAL_DELIVERY_TIMEOUT`]
    pub(crate) async fn deliver_terminal(&self, progress: Progress) {
        let Some(sink) = &self.sink else {
            return;
        };
        match tokio::time::timeout(TERMINAL_DELIVERY_TIMEOUT, sink.send(progress)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("Progress sink closed before terminal update"),
            Err(_) => warn!(
                "Progress sink not drained within {:?}, terminal update dropped",
                TERMINAL_DELIVERY_TIMEOUT
            ),
        }
    }
}
