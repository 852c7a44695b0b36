//! Runtime context
//!
//! [`RuntimeContext`] is the explicit registry of device backends, the
//! devices they expose, the shared [`DeviceBufferManager`] and the kernel
//! compiler. The process entry point owns its lifecycle through
//! [`RuntimeContext::init`] and [`RuntimeContext::shutdown`]; plans hold an
//! `Arc` to it.

pub mod config;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{DeviceBackend, DeviceId, DeviceInfo};
use crate::error::{ForgeResult, TaskForgeError};
use crate::kernel::KernelCompiler;
use crate::memory::DeviceBufferManager;

pub use config::RuntimeConfig;

pub struct RuntimeContext {
    config: RuntimeConfig,
    backends: Vec<Arc<dyn DeviceBackend>>,
    devices: Vec<DeviceInfo>,
    buffers: DeviceBufferManager,
    compiler: Arc<dyn KernelCompiler>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backends: Vec<&str> = self.backends.iter().map(|b| b.name()).collect();
        f.debug_struct("RuntimeContext")
            .field("config", &self.config)
            .field("backends", &backends)
            .field("devices", &self.devices.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl RuntimeContext {
    /// Register `backends` and enumerate their devices.
    ///
    /// Backend `i` must report devices with driver index `i`.
    pub fn init(
        config: RuntimeConfig,
        backends: Vec<Arc<dyn DeviceBackend>>,
        compiler: Arc<dyn KernelCompiler>,
    ) -> ForgeResult<Arc<Self>> {
        config.validate()?;
        if backends.is_empty() {
            return Err(TaskForgeError::InvalidConfiguration(
                "runtime needs at least one device backend".to_string(),
            ));
        }

        let mut devices = Vec::new();
        let mut registered = Vec::new();
        for (driver, backend) in backends.iter().enumerate() {
            for info in backend.devices() {
                if info.id.driver != driver {
                    return Err(TaskForgeError::InvalidConfiguration(format!(
                        "backend '{}' registered as driver {} reports {}",
                        backend.name(),
                        driver,
                        info.id
                    )));
                }
                tracing::debug!(
                    device = %info.id,
                    name = %info.name,
                    memory_mb = info.global_memory_bytes / 1024 / 1024,
                    "device registered"
                );
                registered.push((backend.clone(), info.clone()));
                devices.push(info);
            }
        }
        if devices.is_empty() {
            return Err(TaskForgeError::InvalidConfiguration(
                "no devices reported by any backend".to_string(),
            ));
        }

        let buffers = DeviceBufferManager::new(config.heap_config(), registered);
        tracing::info!(
            backends = backends.len(),
            devices = devices.len(),
            "runtime initialised"
        );
        Ok(Arc::new(Self {
            config,
            backends,
            devices,
            buffers,
            compiler,
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> ForgeResult<&DeviceInfo> {
        self.devices
            .iter()
            .find(|info| info.id == id)
            .ok_or_else(|| TaskForgeError::DeviceNotFound(id.to_string()))
    }

    /// First device of the first backend
    pub fn default_device(&self) -> DeviceId {
        self.devices
            .first()
            .map(|info| info.id)
            .unwrap_or(DeviceId::new(0, 0))
    }

    pub fn backend_for(&self, id: DeviceId) -> ForgeResult<&Arc<dyn DeviceBackend>> {
        self.device(id)?;
        self.backends
            .get(id.driver)
            .ok_or_else(|| TaskForgeError::DeviceNotFound(id.to_string()))
    }

    pub fn buffers(&self) -> &DeviceBufferManager {
        &self.buffers
    }

    pub fn compiler(&self) -> &Arc<dyn KernelCompiler> {
        &self.compiler
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn ensure_active(&self) -> ForgeResult<()> {
        if self.is_shut_down() {
            return Err(TaskForgeError::InvalidConfiguration(
                "runtime has been shut down".to_string(),
            ));
        }
        Ok(())
    }

    /// Release every device heap. Later calls are no-ops.
    pub fn shutdown(&self) -> ForgeResult<()> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.buffers.shutdown()?;
        tracing::info!(devices = self.devices.len(), "runtime shut down");
        Ok(())
    }
}
