//! Shared fixtures: scripted transport, fault-injecting flash and a device rig

use anyhow::{Result, bail};
use ota_pipeline::prelude::*;
use ota_pipeline::{RegionInfo, RequestOptions, ResponseStream, SlotInfo, build_image};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;
use url::Url;

/// Build a plausible firmware image
pub fn firmware_image(version: &str, payload_len: usize) -> Vec<u8> {
    let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();
    build_image(&ImageHeader::new(version, "gateway"), &payload)
}

/// How a scripted response behaves
#[derive(Debug, Clone)]
pub struct Script {
    pub status: u16,
    pub body: Vec<u8>,
    pub content_length: Option<u64>,
    /// Largest chunk handed out per read
    pub chunk_size: usize,
    /// Fail the read once this many bytes were delivered
    pub disconnect_at: Option<usize>,
    /// Pause before each chunk
    pub delay: Duration,
    /// Refuse to connect
    pub refuse: bool,
}

impl Script {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_length: Some(body.len() as u64),
            body,
            chunk_size: 4096,
            disconnect_at: None,
            delay: Duration::ZERO,
            refuse: false,
        }
    }
}

/// Transport that replays a [`Script`]
pub struct ScriptedTransport {
    script: Script,
    pub opened: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            opened: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, _url: &Url, _options: &RequestOptions) -> Result<Box<dyn ResponseStream>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        if self.script.refuse {
            bail!("connection refused");
        }
        Ok(Box::new(ScriptedStream {
            script: self.script.clone(),
            pos: 0,
        }))
    }
}

struct ScriptedStream {
    script: Script,
    pos: usize,
}

#[async_trait::async_trait]
impl ResponseStream for ScriptedStream {
    fn status(&self) -> u16 {
        self.script.status
    }

    fn content_length(&self) -> Option<u64> {
        self.script.content_length
    }

    async fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.script.delay.is_zero() {
            tokio::time::sleep(self.script.delay).await;
        }

        let mut end = self.script.body.len();
        if let Some(limit) = self.script.disconnect_at {
            if self.pos >= limit {
                bail!("connection reset by peer");
            }
            end = end.min(limit);
        }

        let n = buf
            .len()
            .min(self.script.chunk_size)
            .min(end.saturating_sub(self.pos));
        let (Some(dst), Some(src)) = (buf.get_mut(..n), self.script.body.get(self.pos..self.pos + n))
        else {
            bail!("scripted read out of range");
        };
        dst.copy_from_slice(src);
        self.pos += n;
        Ok(n)
    }
}

/// Flash wrapper that counts writes and can fail part-way through a slot write
pub struct FaultyFlash {
    inner: Arc<FileFlash>,
    fail_after_bytes: Option<u64>,
    slot_bytes: AtomicU64,
    pub begin_calls: AtomicUsize,
    pub write_calls: AtomicUsize,
    pub region_writes: AtomicUsize,
}

impl FaultyFlash {
    pub fn new(inner: Arc<FileFlash>, fail_after_bytes: Option<u64>) -> Self {
        Self {
            inner,
            fail_after_bytes,
            slot_bytes: AtomicU64::new(0),
            begin_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            region_writes: AtomicUsize::new(0),
        }
    }

    pub fn total_writes(&self) -> usize {
        self.begin_calls.load(Ordering::SeqCst)
            + self.write_calls.load(Ordering::SeqCst)
            + self.region_writes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl FlashDevice for FaultyFlash {
    async fn running_slot(&self) -> Result<Slot> {
        self.inner.running_slot().await
    }

    async fn next_update_slot(&self) -> Result<Option<SlotInfo>> {
        self.inner.next_update_slot().await
    }

    async fn slot_info(&self, slot: Slot) -> Result<SlotInfo> {
        self.inner.slot_info(slot).await
    }

    async fn begin_write(&self, slot: Slot, image_size: u64) -> Result<()> {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        self.slot_bytes.store(0, Ordering::SeqCst);
        self.inner.begin_write(slot, image_size).await
    }

    async fn write(&self, slot: Slot, data: &[u8]) -> Result<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        let total = self.slot_bytes.fetch_add(data.len() as u64, Ordering::SeqCst) + data.len() as u64;
        if self.fail_after_bytes.is_some_and(|limit| total > limit) {
            bail!("injected flash fault at {total} bytes");
        }
        self.inner.write(slot, data).await
    }

    async fn end_write(&self, slot: Slot) -> Result<()> {
        self.inner.end_write(slot).await
    }

    async fn abort_write(&self, slot: Slot) -> Result<()> {
        self.inner.abort_write(slot).await
    }

    async fn set_boot_slot(&self, slot: Slot) -> Result<()> {
        self.inner.set_boot_slot(slot).await
    }

    async fn find_region(&self, label: &str) -> Result<Option<RegionInfo>> {
        self.inner.find_region(label).await
    }

    async fn erase_region(&self, label: &str, offset: u64, len: u64) -> Result<()> {
        self.inner.erase_region(label, offset, len).await
    }

    async fn write_region(&self, label: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.region_writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_region(label, offset, data).await
    }
}

/// Filesystem storage whose first `write` parks until released
#[derive(Default)]
pub struct GatedStorage {
    inner: FsStorage,
    armed: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

impl GatedStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            armed: AtomicBool::new(true),
            ..Self::default()
        })
    }
}

#[async_trait::async_trait]
impl Storage for GatedStorage {
    async fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        self.inner.create_dir_all(path).await
    }

    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn read_range(&self, path: &Path, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.inner.read_range(path, offset, len).await
    }

    async fn write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.write(path, data).await
    }

    async fn append(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.inner.append(path, data).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        self.inner.remove(path).await
    }

    async fn size(&self, path: &Path) -> io::Result<u64> {
        self.inner.size(path).await
    }
}

/// An emulated device with a staging directory
pub struct Device {
    _root: TempDir,
    pub config: OtaConfig,
    pub storage: Arc<dyn Storage>,
    pub flash: Arc<FileFlash>,
    pub faulty: Arc<FaultyFlash>,
    pub system: Arc<EmulatedSystem>,
}

pub const ASSET_REGION_SIZE: u64 = 64 * 1024;

impl Device {
    /// Device running `running_version` from slot A
    pub async fn new(running_version: &str) -> Result<Self> {
        Self::with_fault(running_version, None).await
    }

    /// Device whose slot writes fail after `fail_after_bytes`
    pub async fn with_fault(running_version: &str, fail_after_bytes: Option<u64>) -> Result<Self> {
        let dir = TempDir::new()?;

        let mut config = OtaConfig::default();
        config.staging.dir = dir.path().join("recovery");
        config.recovery.reboot_delay_ms = 0;

        let geometry = FileFlashGeometry {
            slot_size: 1 << 20,
            asset_region: Some(RegionInfo {
                label: "www".to_string(),
                size: ASSET_REGION_SIZE,
            }),
        };
        let flash = Arc::new(
            FileFlash::provision(
                dir.path().join("flash"),
                geometry,
                &firmware_image(running_version, 2048),
            )
            .await?,
        );
        let faulty = Arc::new(FaultyFlash::new(flash.clone(), fail_after_bytes));
        let system = Arc::new(EmulatedSystem::new(flash.clone()));

        Ok(Self {
            _root: dir,
            config,
            storage: Arc::new(FsStorage::new()),
            flash,
            faulty,
            system,
        })
    }

    pub fn layout(&self) -> StagingLayout {
        StagingLayout::from_config(&self.config.staging)
    }

    pub fn recovery(&self) -> RecoveryController {
        RecoveryController::new(
            &self.config,
            self.storage.clone(),
            self.faulty.clone(),
            self.system.clone(),
            ProgressReporter::default(),
        )
    }

    pub fn engine(&self, transport: Arc<ScriptedTransport>) -> AcquisitionEngine {
        self.engine_with_storage(transport, self.storage.clone())
    }

    pub fn engine_with_storage(
        &self,
        transport: Arc<ScriptedTransport>,
        storage: Arc<dyn Storage>,
    ) -> AcquisitionEngine {
        AcquisitionEngine::new(
            &self.config,
            storage,
            transport,
            self.faulty.clone(),
            self.system.clone(),
        )
    }

    pub async fn running_version(&self) -> Result<String> {
        self.system.running_version().await
    }

    /// Put a firmware image into staging without a manifest
    pub async fn stage_firmware(&self, version: &str, payload_len: usize) -> Result<Vec<u8>> {
        let image = firmware_image(version, payload_len);
        tokio::fs::create_dir_all(self.layout().dir()).await?;
        tokio::fs::write(self.layout().firmware(), &image).await?;
        Ok(image)
    }

    pub async fn stage_asset(&self, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(self.layout().dir()).await?;
        tokio::fs::write(self.layout().asset(), data).await?;
        Ok(())
    }

    pub async fn write_manifest(&self, manifest: serde_json::Value) -> Result<()> {
        tokio::fs::create_dir_all(self.layout().dir()).await?;
        tokio::fs::write(self.layout().manifest(), manifest.to_string()).await?;
        Ok(())
    }

    pub fn staged(&self) -> (bool, bool, bool) {
        let layout = self.layout();
        (
            layout.firmware().exists(),
            layout.asset().exists(),
            layout.manifest().exists(),
        )
    }
}
