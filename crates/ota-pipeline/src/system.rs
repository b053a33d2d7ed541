//! System control collaborator

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::flash::FileFlash;

/// Running-image identity and restart
#[async_trait::async_trait]
pub trait SystemControl: Send + Sync {
    /// Version string of the executing firmware
    async fn running_version(&self) -> Result<String>;

    /// Restart the system
    ///
    /// On hardware this does not return. Emulated systems return after
    /// switching execution to the boot slot.
    async fn restart(&self) -> Result<()>;
}

/// System control on top of the flash emulator
#[derive(Clone)]
pub struct EmulatedSystem {
    flash: Arc<FileFlash>,
}

impl EmulatedSystem {
    /// Wrap an emulated flash device
    pub fn new(flash: Arc<FileFlash>) -> Self {
        Self { flash }
    }
}

#[async_trait::async_trait]
impl SystemControl for EmulatedSystem {
    async fn running_version(&self) -> Result<String> {
        self.flash.running_version().await
    }

    async fn restart(&self) -> Result<()> {
        let slot = self.flash.reset().await?;
        info!("System restarted from slot {}", slot);
        Ok(())
    }
}
