//! Platform services shared by every component.
//!
//! Built once at startup and handed to whatever needs it; there is no global.

use crate::config::RuntimeConfig;
use crate::encryption::SymmetricEncryption;
use crate::error::RuntimeError;
use crate::scheduler::{CallbackScheduler, FileWakeBackend, NoopWakeBackend, WakeBackend};
use crate::sync::{MainLoop, MainThreadSynchronizer};
use crate::transparency::{create_shared_log, create_shared_log_with_persistence, SharedTransparencyLog};
use std::sync::Arc;

#[derive(Clone)]
pub struct RuntimeContext {
    device_id: String,
    scheduler: Arc<CallbackScheduler>,
    synchronizer: MainThreadSynchronizer,
    stats: SharedTransparencyLog,
    at_rest: SymmetricEncryption,
}

impl RuntimeContext {
    pub fn new(
        device_id: impl Into<String>,
        scheduler: Arc<CallbackScheduler>,
        synchronizer: MainThreadSynchronizer,
        stats: SharedTransparencyLog,
        at_rest: SymmetricEncryption,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            scheduler,
            synchronizer,
            stats,
            at_rest,
        }
    }

    /// Context for a desktop host whose calling thread acts as the main thread.
    ///
    /// Wakes are journaled and stats persisted under the configured data path.
    pub fn for_host(config: &RuntimeConfig) -> Result<(Self, MainLoop), RuntimeError> {
        config.ensure_directories()?;

        let backend: Arc<dyn WakeBackend> = Arc::new(
            FileWakeBackend::open(config.wake_journal_path())
                .map_err(RuntimeError::SchedulerPersistence)?,
        );
        let (synchronizer, main_loop) = MainThreadSynchronizer::for_current_thread();

        let context = Self::new(
            device_id(),
            Arc::new(CallbackScheduler::new(backend)?),
            synchronizer,
            create_shared_log_with_persistence(config.stats_path()),
            SymmetricEncryption::new(&config.at_rest_key),
        );
        Ok((context, main_loop))
    }

    /// In-memory context with a dedicated main thread. Nothing touches disk.
    pub fn ephemeral(device_id: &str) -> Result<Self, RuntimeError> {
        Ok(Self::new(
            device_id,
            Arc::new(CallbackScheduler::new(Arc::new(NoopWakeBackend))?),
            MainThreadSynchronizer::spawn_dedicated("main-thread")?,
            create_shared_log(),
            SymmetricEncryption::new(""),
        ))
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn scheduler(&self) -> &Arc<CallbackScheduler> {
        &self.scheduler
    }

    /// Bridge onto the host's main thread. Approved prompts are delivered through it.
    pub fn synchronizer(&self) -> &MainThreadSynchronizer {
        &self.synchronizer
    }

    pub fn stats(&self) -> &SharedTransparencyLog {
        &self.stats
    }

    /// Cipher for protocol documents stored on the device.
    pub fn at_rest(&self) -> &SymmetricEncryption {
        &self.at_rest
    }
}

/// Stable identifier for this device.
pub fn device_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-device".to_string())
}
