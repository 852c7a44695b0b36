//! Kernel compiler for host-emulated devices.
//!
//! Kernels are plain Rust closures registered by method name. "Compiling"
//! looks the method up and wraps it in a [`CompiledKernel`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::backend::DeviceInfo;
use crate::error::{ForgeResult, TaskForgeError};
use crate::kernel::{
    ArgumentShape, CompiledKernel, HostKernelFn, KernelCompiler, KernelInvocation, TaskDescriptor,
};

#[derive(Default)]
pub struct HostKernelCompiler {
    kernels: RwLock<HashMap<String, HostKernelFn>>,
    compilations: AtomicUsize,
}

impl std::fmt::Debug for HostKernelCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .kernels
            .read()
            .map(|k| k.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("HostKernelCompiler")
            .field("kernels", &names)
            .field("compilations", &self.compilations.load(Ordering::Relaxed))
            .finish()
    }
}

impl HostKernelCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration
    pub fn with_kernel<F>(self, method: impl Into<String>, kernel: F) -> Self
    where
        F: Fn(&mut KernelInvocation) -> Result<(), String> + Send + Sync + 'static,
    {
        if let Ok(mut kernels) = self.kernels.write() {
            kernels.insert(method.into(), Arc::new(kernel));
        }
        self
    }

    pub fn register<F>(&self, method: impl Into<String>, kernel: F) -> ForgeResult<()>
    where
        F: Fn(&mut KernelInvocation) -> Result<(), String> + Send + Sync + 'static,
    {
        self.kernels.write()?.insert(method.into(), Arc::new(kernel));
        Ok(())
    }

    /// Number of successful compile calls
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }
}

impl KernelCompiler for HostKernelCompiler {
    fn compile(
        &self,
        task: &TaskDescriptor,
        shapes: &[ArgumentShape],
        device: &DeviceInfo,
        flags: Option<&str>,
    ) -> ForgeResult<CompiledKernel> {
        let function = self
            .kernels
            .read()?
            .get(task.method())
            .cloned()
            .ok_or_else(|| TaskForgeError::KernelNotFound(task.method().to_string()))?;

        for capability in task.requirements() {
            if !device.supports(*capability) {
                return Err(TaskForgeError::UnsupportedConfiguration(format!(
                    "{} ({}) lacks {:?} required by '{}'",
                    device.id,
                    device.name,
                    capability,
                    task.method()
                )));
            }
        }

        self.compilations.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            method = task.method(),
            device = %device.id,
            args = shapes.len(),
            flags = flags.unwrap_or(""),
            "host kernel compiled"
        );
        Ok(CompiledKernel::host(task.method(), device.id, function).with_flags(flags))
    }
}
