//! Compiled-kernel cache keyed by task and device.
//!
//! A task is compiled at most once per device; later launches reuse the
//! cached kernel until the cache is invalidated (new compiler flags or a
//! device reset).

use std::collections::HashMap;

use crate::backend::DeviceId;
use crate::error::ForgeResult;
use crate::kernel::CompiledKernel;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    pub task: String,
    pub device: DeviceId,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelCacheStats {
    pub entries: usize,
    pub hits: usize,
    pub misses: usize,
}

#[derive(Debug, Default)]
pub struct KernelCache {
    entries: HashMap<KernelKey, CompiledKernel>,
    hits: usize,
    misses: usize,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached kernel or compile and insert it
    pub fn get_or_compile<F>(
        &mut self,
        task: &str,
        device: DeviceId,
        compile: F,
    ) -> ForgeResult<CompiledKernel>
    where
        F: FnOnce() -> ForgeResult<CompiledKernel>,
    {
        let key = KernelKey {
            task: task.to_string(),
            device,
        };
        if let Some(kernel) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(kernel.clone());
        }

        self.misses += 1;
        let kernel = compile()?;
        tracing::debug!(task, device = %device, method = kernel.method(), "kernel compiled");
        self.entries.insert(key, kernel.clone());
        Ok(kernel)
    }

    pub fn contains(&self, task: &str, device: DeviceId) -> bool {
        self.entries.contains_key(&KernelKey {
            task: task.to_string(),
            device,
        })
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    pub fn invalidate_device(&mut self, device: DeviceId) {
        self.entries.retain(|key, _| key.device != device);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> KernelCacheStats {
        KernelCacheStats {
            entries: self.entries.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}
