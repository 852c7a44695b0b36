//! Common test utilities for integration tests
//!
//! Every test gets its own [`HostFixture`]: a fresh emulated backend and a
//! runtime built on it, so backend counters start at zero. The kernel
//! registry is shared.
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::HostFixture;
//!
//! #[test]
//! fn my_test() -> anyhow::Result<()> {
//!     let fixture = HostFixture::new(1)?;
//!     let mut plan = ExecutionPlan::new(fixture.runtime(), graph)?;
//!     plan.execute()?;
//!     assert_eq!(fixture.stats()?.launch_count, 1);
//!     Ok(())
//! }
//! ```

#![allow(dead_code)]

mod tempfile_helpers;

use std::sync::Arc;

use once_cell::sync::Lazy;
use taskforge::backend::HostBackendStats;
use taskforge::{
    DeviceBackend, DeviceId, HostBackend, HostKernelCompiler, KernelCompiler, RuntimeConfig,
    RuntimeContext,
};

pub use serial_test::serial;
pub use tempfile_helpers::*;

/// Emulated memory per device (4 MiB)
pub const DEVICE_MEMORY: usize = 4 * 1024 * 1024;

/// Kernels available to every test runtime
pub static KERNELS: Lazy<Arc<HostKernelCompiler>> = Lazy::new(|| Arc::new(test_kernels()));

fn test_kernels() -> HostKernelCompiler {
    HostKernelCompiler::new()
        // c[i] = a[i] + b[i]
        .with_kernel("vector_add", |inv| {
            let a = inv.read::<f32>(0)?;
            let b = inv.read::<f32>(1)?;
            inv.update::<f32>(2, |i, c| *c = a[i] + b[i])
        })
        // a[i] *= factor
        .with_kernel("scale", |inv| {
            let factor = inv.scalar(1)?.as_f32();
            inv.update::<f32>(0, |_, v| *v *= factor)
        })
        // y[i] = alpha * x[i] + y[i]
        .with_kernel("saxpy", |inv| {
            let alpha = inv.scalar(0)?.as_f32();
            let x = inv.read::<f32>(1)?;
            inv.update::<f32>(2, |i, y| *y += alpha * x[i])
        })
        .with_kernel("increment", |inv| inv.update::<i32>(0, |_, v| *v += 1))
        .with_kernel("copy", |inv| {
            let src = inv.read::<f32>(0)?;
            inv.write(1, &src)
        })
        .with_kernel("fill", |inv| {
            let value = inv.scalar(1)?.as_f32();
            inv.update::<f32>(0, |_, v| *v = value)
        })
        // out[i] = global index, limited to the launched work items
        .with_kernel("iota", |inv| {
            let offset = inv.thread_offset();
            let threads = inv.global_size();
            inv.update::<i32>(0, |i, v| {
                if i < threads {
                    *v = (offset + i) as i32;
                }
            })
        })
        .with_kernel("fault", |_| Err("injected kernel fault".to_string()))
}

/// Backend plus runtime owned by one test
pub struct HostFixture {
    backend: Arc<HostBackend>,
    runtime: Arc<RuntimeContext>,
}

impl HostFixture {
    /// `devices` emulated devices with [`DEVICE_MEMORY`] each
    pub fn new(devices: usize) -> anyhow::Result<Self> {
        Self::with_config(devices, RuntimeConfig::default())
    }

    pub fn with_config(devices: usize, config: RuntimeConfig) -> anyhow::Result<Self> {
        Self::with_backend(HostBackend::new(0, devices, DEVICE_MEMORY), config)
    }

    pub fn with_backend(backend: HostBackend, config: RuntimeConfig) -> anyhow::Result<Self> {
        let backend = Arc::new(backend);
        let compiler: Arc<dyn KernelCompiler> = Arc::clone(&*KERNELS) as Arc<dyn KernelCompiler>;
        let runtime = RuntimeContext::init(
            config,
            vec![backend.clone() as Arc<dyn DeviceBackend>],
            compiler,
        )?;
        Ok(Self { backend, runtime })
    }

    pub fn runtime(&self) -> &Arc<RuntimeContext> {
        &self.runtime
    }

    pub fn backend(&self) -> &Arc<HostBackend> {
        &self.backend
    }

    pub fn device(&self, index: usize) -> DeviceId {
        DeviceId::new(0, index)
    }

    pub fn stats(&self) -> anyhow::Result<HostBackendStats> {
        Ok(self.backend.stats()?)
    }
}

/// `len` floats `start, start + 1, ...`
pub fn ramp(len: usize, start: f32) -> Vec<f32> {
    (0..len).map(|i| start + i as f32).collect()
}
