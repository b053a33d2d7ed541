//! Flash/partition collaborator
//!
//! Two alternating firmware slots plus an independent asset region. The
//! committer only depends on [`FlashDevice`]; [`FileFlash`] emulates the
//! contract on top of a host directory.

use anyhow::{Context, Result, anyhow, bail, ensure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::image::{HEADER_LEN, ImageHeader, compute_data_hash};

/// Firmware slot identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Slot {
    /// Slot A
    A,
    /// Slot B
    B,
}

impl Slot {
    /// Get the other slot
    pub fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::A => write!(f, "A"),
            Slot::B => write!(f, "B"),
        }
    }
}

/// Lifecycle of a slot's contents
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SlotState {
    /// Nothing usable in the slot
    #[default]
    Empty,
    /// A streaming write is in progress
    Writing,
    /// Write completed and the image checked out
    Finalized {
        /// Image size in bytes
        size: u64,
        /// SHA-256 of the image
        sha256: String,
    },
}

impl SlotState {
    /// Whether the boot pointer may name this slot
    pub fn is_bootable(&self) -> bool {
        matches!(self, SlotState::Finalized { .. })
    }
}

/// Firmware slot description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotInfo {
    /// Slot identifier
    pub slot: Slot,
    /// Capacity in bytes
    pub capacity: u64,
    /// Whether this slot is currently running
    pub running: bool,
    /// Whether the boot pointer names this slot
    pub boot: bool,
    /// Content state
    pub state: SlotState,
    /// Version embedded in the slot image, if it parses
    pub version: Option<String>,
}

/// Fixed data region description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    /// Region label
    pub label: String,
    /// Region size in bytes
    pub size: u64,
}

/// Device-specific flash operations
#[async_trait::async_trait]
pub trait FlashDevice: Send + Sync {
    /// Slot the system is executing from
    async fn running_slot(&self) -> Result<Slot>;

    /// Slot the next update should be written to (never the running one)
    async fn next_update_slot(&self) -> Result<Option<SlotInfo>>;

    /// Describe a slot
    async fn slot_info(&self, slot: Slot) -> Result<SlotInfo>;

    /// Start a sequential write of an image of `image_size` bytes
    async fn begin_write(&self, slot: Slot, image_size: u64) -> Result<()>;

    /// Append data to the write started by [`FlashDevice::begin_write`]
    async fn write(&self, slot: Slot, data: &[u8]) -> Result<()>;

    /// Complete the write and validate the slot contents
    async fn end_write(&self, slot: Slot) -> Result<()>;

    /// Abandon a write; the slot is left unbootable
    async fn abort_write(&self, slot: Slot) -> Result<()>;

    /// Point the bootloader at `slot`; the single commit point
    async fn set_boot_slot(&self, slot: Slot) -> Result<()>;

    /// Look up a fixed data region by label
    async fn find_region(&self, label: &str) -> Result<Option<RegionInfo>>;

    /// Erase `len` bytes of a region starting at `offset`
    async fn erase_region(&self, label: &str, offset: u64, len: u64) -> Result<()>;

    /// Write data into a region at `offset`
    async fn write_region(&self, label: &str, offset: u64, data: &[u8]) -> Result<()>;
}

/// Geometry of an emulated flash device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileFlashGeometry {
    /// Capacity of each firmware slot
    pub slot_size: u64,
    /// Asset region label and size, if the layout has one
    pub asset_region: Option<RegionInfo>,
}

impl Default for FileFlashGeometry {
    fn default() -> Self {
        Self {
            slot_size: 4 * 1024 * 1024,
            asset_region: Some(RegionInfo {
                label: "www".to_string(),
                size: 1024 * 1024,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlashState {
    geometry: FileFlashGeometry,
    running: Slot,
    boot: Slot,
    slot_a: SlotState,
    slot_b: SlotState,
}

impl FlashState {
    fn slot(&self, slot: Slot) -> &SlotState {
        match slot {
            Slot::A => &self.slot_a,
            Slot::B => &self.slot_b,
        }
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut SlotState {
        match slot {
            Slot::A => &mut self.slot_a,
            Slot::B => &mut self.slot_b,
        }
    }
}

struct WriteSession {
    slot: Slot,
    expected: u64,
    written: u64,
}

struct Inner {
    state: FlashState,
    session: Option<WriteSession>,
}

/// Directory-backed flash emulator
///
/// Layout: `slot_a.bin`, `slot_b.bin`, `<asset label>.bin` and `otadata.json`
/// (boot pointer and slot states). `otadata.json` is replaced atomically.
pub struct FileFlash {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

const OTADATA: &str = "otadata.json";

impl FileFlash {
    /// Create a fresh device with `image` in slot A, running and booted
    pub async fn provision(
        dir: impl Into<PathBuf>,
        geometry: FileFlashGeometry,
        image: &[u8],
    ) -> Result<Self> {
        let dir = dir.into();
        ensure!(
            image.len() as u64 <= geometry.slot_size,
            "initial image ({} bytes) exceeds slot size {}",
            image.len(),
            geometry.slot_size
        );

        tokio::fs::create_dir_all(&dir)
            .await
            .context("Failed to create flash directory")?;

        tokio::fs::write(dir.join(slot_file(Slot::A)), image)
            .await
            .context("Failed to write slot A")?;
        tokio::fs::write(dir.join(slot_file(Slot::B)), b"")
            .await
            .context("Failed to write slot B")?;

        if let Some(region) = &geometry.asset_region {
            tokio::fs::write(dir.join(region_file(&region.label)), vec![0xFF; region.size as usize])
                .await
                .context("Failed to write asset region")?;
        }

        let state = FlashState {
            geometry,
            running: Slot::A,
            boot: Slot::A,
            slot_a: SlotState::Finalized {
                size: image.len() as u64,
                sha256: compute_data_hash(image),
            },
            slot_b: SlotState::Empty,
        };
        persist(&dir, &state).await?;

        info!("Provisioned emulated flash at {}", dir.display());
        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                state,
                session: None,
            }),
        })
    }

    /// Open a previously provisioned device
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let path = dir.join(OTADATA);
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let state: FlashState =
            serde_json::from_str(&content).context("Failed to parse flash state")?;

        Ok(Self {
            dir,
            inner: Mutex::new(Inner {
                state,
                session: None,
            }),
        })
    }

    /// Device directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Emulate a reset: execution resumes from the slot the boot pointer names
    ///
    /// An interrupted write is discarded, as on hardware.
    pub async fn reset(&self) -> Result<Slot> {
        let mut inner = self.inner.lock().await;
        if let Some(session) = inner.session.take() {
            warn!("Reset during write to slot {}, discarding", session.slot);
            *inner.state.slot_mut(session.slot) = SlotState::Empty;
        }
        let boot = inner.state.boot;
        ensure!(
            inner.state.slot(boot).is_bootable(),
            "boot slot {} holds no finalized image",
            boot
        );
        inner.state.running = boot;
        persist(&self.dir, &inner.state).await?;
        info!("Emulated reset, now running slot {}", boot);
        Ok(boot)
    }

    /// Read the full image held by a slot
    pub async fn read_slot(&self, slot: Slot) -> Result<Vec<u8>> {
        tokio::fs::read(self.dir.join(slot_file(slot)))
            .await
            .with_context(|| format!("Failed to read slot {slot}"))
    }

    /// Read the asset region
    pub async fn read_region(&self, label: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.dir.join(region_file(label)))
            .await
            .with_context(|| format!("Failed to read region {label}"))
    }

    /// Version string embedded in the running slot
    pub async fn running_version(&self) -> Result<String> {
        let slot = self.running_slot().await?;
        self.slot_version(slot)
            .await?
            .ok_or_else(|| anyhow!("running slot {} has no readable image header", slot))
    }

    async fn slot_version(&self, slot: Slot) -> Result<Option<String>> {
        let data = self.read_slot(slot).await?;
        let header = data.get(..HEADER_LEN).unwrap_or(data.as_slice());
        Ok(ImageHeader::parse(header).ok().map(|h| h.version))
    }

    fn region<'a>(state: &'a FlashState, label: &str) -> Result<&'a RegionInfo> {
        state
            .geometry
            .asset_region
            .as_ref()
            .filter(|r| r.label == label)
            .ok_or_else(|| anyhow!("no region labelled {label:?}"))
    }
}

fn slot_file(slot: Slot) -> String {
    match slot {
        Slot::A => "slot_a.bin".to_string(),
        Slot::B => "slot_b.bin".to_string(),
    }
}

fn region_file(label: &str) -> String {
    format!("{label}.bin")
}

fn check_written_image(slot: Slot, data: &[u8], session: &WriteSession) -> Result<ImageHeader> {
    ensure!(
        data.len() as u64 == session.written,
        "slot holds {} bytes, {} were written",
        data.len(),
        session.written
    );
    if session.written != session.expected {
        bail!(
            "incomplete image: {} of {} bytes written",
            session.written,
            session.expected
        );
    }
    ImageHeader::parse(data).map_err(|e| anyhow!("slot {slot} image invalid: {e}"))
}

async fn persist(dir: &Path, state: &FlashState) -> Result<()> {
    let tmp = dir.join(format!("{OTADATA}.tmp"));
    let json = serde_json::to_vec_pretty(state).context("Failed to serialize flash state")?;
    tokio::fs::write(&tmp, json)
        .await
        .context("Failed to write flash state")?;
    tokio::fs::rename(&tmp, dir.join(OTADATA))
        .await
        .context("Failed to commit flash state")
}

#[async_trait::async_trait]
impl FlashDevice for FileFlash {
    async fn running_slot(&self) -> Result<Slot> {
        Ok(self.inner.lock().await.state.running)
    }

    async fn next_update_slot(&self) -> Result<Option<SlotInfo>> {
        let running = self.running_slot().await?;
        self.slot_info(running.other()).await.map(Some)
    }

    async fn slot_info(&self, slot: Slot) -> Result<SlotInfo> {
        let (capacity, running, boot, state) = {
            let inner = self.inner.lock().await;
            (
                inner.state.geometry.slot_size,
                inner.state.running == slot,
                inner.state.boot == slot,
                inner.state.slot(slot).clone(),
            )
        };
        let version = if state.is_bootable() {
            self.slot_version(slot).await?
        } else {
            None
        };
        Ok(SlotInfo {
            slot,
            capacity,
            running,
            boot,
            state,
            version,
        })
    }

    async fn begin_write(&self, slot: Slot, image_size: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure!(
            inner.state.running != slot,
            "refusing to write running slot {}",
            slot
        );
        ensure!(inner.session.is_none(), "a slot write is already open");
        ensure!(
            image_size <= inner.state.geometry.slot_size,
            "image of {} bytes does not fit slot of {} bytes",
            image_size,
            inner.state.geometry.slot_size
        );

        tokio::fs::write(self.dir.join(slot_file(slot)), b"")
            .await
            .context("Failed to erase slot")?;
        *inner.state.slot_mut(slot) = SlotState::Writing;
        if inner.state.boot == slot {
            // boot pointer must never name a half-written slot
            inner.state.boot = inner.state.running;
        }
        persist(&self.dir, &inner.state).await?;

        inner.session = Some(WriteSession {
            slot,
            expected: image_size,
            written: 0,
        });
        debug!("Began write of {} bytes to slot {}", image_size, slot);
        Ok(())
    }

    async fn write(&self, slot: Slot, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let capacity = inner.state.geometry.slot_size;
        let session = inner
            .session
            .as_mut()
            .filter(|s| s.slot == slot)
            .ok_or_else(|| anyhow!("no write open for slot {slot}"))?;

        let written = session.written + data.len() as u64;
        ensure!(written <= capacity, "write overflows slot {}", slot);

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(self.dir.join(slot_file(slot)))
            .await
            .context("Failed to open slot for writing")?;
        file.write_all(data)
            .await
            .context("Failed to write slot data")?;
        file.flush().await.context("Failed to flush slot data")?;

        session.written = written;
        Ok(())
    }

    async fn end_write(&self, slot: Slot) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let session = inner
            .session
            .take()
            .filter(|s| s.slot == slot)
            .ok_or_else(|| anyhow!("no write open for slot {slot}"))?;

        let data = self.read_slot(slot).await?;
        let result = check_written_image(slot, &data, &session);

        match result {
            Ok(header) => {
                *inner.state.slot_mut(slot) = SlotState::Finalized {
                    size: data.len() as u64,
                    sha256: compute_data_hash(&data),
                };
                persist(&self.dir, &inner.state).await?;
                debug!("Finalized slot {} with v{}", slot, header.version);
                Ok(())
            }
            Err(e) => {
                *inner.state.slot_mut(slot) = SlotState::Empty;
                persist(&self.dir, &inner.state).await?;
                Err(e)
            }
        }
    }

    async fn abort_write(&self, slot: Slot) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.session.as_ref().is_some_and(|s| s.slot == slot) {
            inner.session = None;
        }
        if inner.state.running != slot {
            *inner.state.slot_mut(slot) = SlotState::Empty;
            persist(&self.dir, &inner.state).await?;
        }
        debug!("Aborted write to slot {}", slot);
        Ok(())
    }

    async fn set_boot_slot(&self, slot: Slot) -> Result<()> {
        let mut inner = self.inner.lock().await;
        ensure!(
            inner.state.slot(slot).is_bootable(),
            "slot {} holds no finalized image",
            slot
        );
        inner.state.boot = slot;
        persist(&self.dir, &inner.state).await?;
        info!("Boot pointer set to slot {}", slot);
        Ok(())
    }

    async fn find_region(&self, label: &str) -> Result<Option<RegionInfo>> {
        let inner = self.inner.lock().await;
        Ok(Self::region(&inner.state, label).ok().cloned())
    }

    async fn erase_region(&self, label: &str, offset: u64, len: u64) -> Result<()> {
        let inner = self.inner.lock().await;
        let region = Self::region(&inner.state, label)?;
        ensure!(
            offset.checked_add(len).is_some_and(|end| end <= region.size),
            "erase range {}+{} outside region {} ({} bytes)",
            offset,
            len,
            label,
            region.size
        );

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.dir.join(region_file(label)))
            .await
            .context("Failed to open region")?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .context("Failed to seek region")?;
        file.write_all(&vec![0xFF; len as usize])
            .await
            .context("Failed to erase region")?;
        file.flush().await.context("Failed to flush region")?;
        Ok(())
    }

    async fn write_region(&self, label: &str, offset: u64, data: &[u8]) -> Result<()> {
        let inner = self.inner.lock().await;
        let region = Self::region(&inner.state, label)?;
        ensure!(
            offset
                .checked_add(data.len() as u64)
                .is_some_and(|end| end <= region.size),
            "write of {} bytes at {} outside region {}",
            data.len(),
            offset,
            label
        );

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(self.dir.join(region_file(label)))
            .await
            .context("Failed to open region")?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .context("Failed to seek region")?;
        file.write_all(data)
            .await
            .context("Failed to write region")?;
        file.flush().await.context("Failed to flush region")?;
        Ok(())
    }
}
