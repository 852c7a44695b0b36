//! Device buffer manager.
//!
//! Owns one [`DeviceHeap`] per device. A heap is created lazily on the
//! first allocation for its device: a single backend region sized from
//! the configured heap bytes, or a fraction of the device's global memory.
//! Each heap sits behind its own mutex, so allocations on different
//! devices never contend.
//!
//! Every heap carries a generation that moves forward whenever the heap is
//! reset or discarded. Handles remember the generation they were cut from,
//! so a handle that outlived its heap can be recognised and is never
//! released into a newer one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::{DeviceBackend, DeviceId, DeviceInfo, RegionId};
use crate::error::{ForgeResult, TaskForgeError};
use crate::memory::heap::{align_up, DeviceHeap, HeapStats};

/// Sizing of device heaps
#[derive(Debug, Clone, PartialEq)]
pub struct HeapConfig {
    /// Fixed heap size; overrides `heap_fraction`
    pub heap_bytes: Option<usize>,
    /// Fraction of device global memory reserved for the heap
    pub heap_fraction: f64,
    pub alignment: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            heap_bytes: None,
            heap_fraction: 0.75,
            alignment: 64,
        }
    }
}

/// Slice of a device heap backing one object on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    pub device: DeviceId,
    pub region: RegionId,
    pub offset: usize,
    /// Requested size in bytes
    pub size: usize,
    /// Reserved (aligned) size in bytes
    pub capacity: usize,
    /// Heap generation the slice was cut from
    pub generation: u64,
}

#[derive(Default)]
struct HeapCell {
    heap: Option<DeviceHeap>,
    /// Generation of the current heap, or of the last one discarded
    generation: u64,
}

impl HeapCell {
    fn holds(&self, handle: &BufferHandle) -> bool {
        self.generation == handle.generation
            && self.heap.as_ref().is_some_and(|heap| heap.region() == handle.region)
    }
}

struct DeviceEntry {
    backend: Arc<dyn DeviceBackend>,
    info: DeviceInfo,
    heap: Mutex<HeapCell>,
}

/// Shared per-device heaps; every plan on a device allocates from the
/// same heap
pub struct DeviceBufferManager {
    config: HeapConfig,
    devices: HashMap<DeviceId, DeviceEntry>,
}

impl std::fmt::Debug for DeviceBufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&DeviceId> = self.devices.keys().collect();
        ids.sort();
        f.debug_struct("DeviceBufferManager")
            .field("config", &self.config)
            .field("devices", &ids)
            .finish()
    }
}

impl DeviceBufferManager {
    pub fn new(
        config: HeapConfig,
        devices: impl IntoIterator<Item = (Arc<dyn DeviceBackend>, DeviceInfo)>,
    ) -> Self {
        let devices = devices
            .into_iter()
            .map(|(backend, info)| {
                (
                    info.id,
                    DeviceEntry {
                        backend,
                        info,
                        heap: Mutex::new(HeapCell::default()),
                    },
                )
            })
            .collect();
        Self { config, devices }
    }

    fn entry(&self, device: DeviceId) -> ForgeResult<&DeviceEntry> {
        self.devices
            .get(&device)
            .ok_or_else(|| TaskForgeError::DeviceNotFound(device.to_string()))
    }

    /// Heap size that would be reserved on `info`
    pub fn heap_capacity(&self, info: &DeviceInfo) -> usize {
        let wanted = self
            .config
            .heap_bytes
            .unwrap_or((info.global_memory_bytes as f64 * self.config.heap_fraction) as usize);
        let capped = wanted.min(info.global_memory_bytes);
        capped - capped % self.config.alignment
    }

    fn with_heap<R>(
        &self,
        device: DeviceId,
        f: impl FnOnce(&mut DeviceHeap, u64) -> ForgeResult<R>,
    ) -> ForgeResult<R> {
        let entry = self.entry(device)?;
        let mut cell = entry.heap.lock()?;
        if cell.heap.is_none() {
            let capacity = self.heap_capacity(&entry.info);
            let region = entry.backend.allocate_buffer(device, capacity)?;
            tracing::info!(
                device = %device,
                capacity_mb = capacity / 1024 / 1024,
                capacity,
                "device heap created"
            );
            cell.heap = Some(DeviceHeap::new(device, region, capacity, self.config.alignment)?);
            cell.generation += 1;
        }
        let generation = cell.generation;
        match cell.heap.as_mut() {
            Some(heap) => f(heap, generation),
            None => Err(TaskForgeError::InternalError(format!(
                "heap for {} missing after creation",
                device
            ))),
        }
    }

    pub fn allocate(&self, device: DeviceId, size: usize) -> ForgeResult<BufferHandle> {
        self.with_heap(device, |heap, generation| {
            let slot = heap.allocate(size)?;
            Ok(BufferHandle {
                device,
                region: heap.region(),
                offset: slot.offset,
                size,
                capacity: slot.class,
                generation,
            })
        })
    }

    /// Return `handle` to its heap. Handles from a reset or discarded heap
    /// are ignored: their slot is already gone.
    pub fn release(&self, handle: &BufferHandle) -> ForgeResult<()> {
        let entry = self.entry(handle.device)?;
        let mut cell = entry.heap.lock()?;
        if !cell.holds(handle) {
            tracing::trace!(
                device = %handle.device,
                offset = handle.offset,
                generation = handle.generation,
                current = cell.generation,
                "stale buffer release ignored"
            );
            return Ok(());
        }
        match cell.heap.as_mut() {
            Some(heap) => heap.release(handle.offset),
            None => Ok(()),
        }
    }

    /// Whether `handle` still refers to a slot of the current heap
    pub fn is_live(&self, handle: &BufferHandle) -> ForgeResult<bool> {
        let entry = self.entry(handle.device)?;
        let cell = entry.heap.lock()?;
        Ok(cell.holds(handle))
    }

    /// Generation of the heap on `device`; 0 before the first allocation
    pub fn generation(&self, device: DeviceId) -> ForgeResult<u64> {
        Ok(self.entry(device)?.heap.lock()?.generation)
    }

    /// Whether `size` bytes can currently be allocated on `device`
    pub fn can_allocate(&self, device: DeviceId, size: usize) -> ForgeResult<bool> {
        let entry = self.entry(device)?;
        let cell = entry.heap.lock()?;
        Ok(match cell.heap.as_ref() {
            Some(heap) => heap.can_allocate(size),
            None => align_up(size.max(1), self.config.alignment) <= self.heap_capacity(&entry.info),
        })
    }

    /// Bytes not held by live buffers on `device`
    pub fn available(&self, device: DeviceId) -> ForgeResult<usize> {
        let entry = self.entry(device)?;
        let cell = entry.heap.lock()?;
        Ok(match cell.heap.as_ref() {
            Some(heap) => heap.available(),
            None => self.heap_capacity(&entry.info),
        })
    }

    /// Drop every allocation on `device`, keeping the heap region. Handles
    /// issued before the reset become stale.
    pub fn reset_all(&self, device: DeviceId) -> ForgeResult<()> {
        let entry = self.entry(device)?;
        let mut cell = entry.heap.lock()?;
        if let Some(heap) = cell.heap.as_mut() {
            heap.reset();
            cell.generation += 1;
        }
        Ok(())
    }

    /// Forget the heap of `device` after its backend dropped the region
    pub fn discard_heap(&self, device: DeviceId) -> ForgeResult<()> {
        let entry = self.entry(device)?;
        let mut cell = entry.heap.lock()?;
        if cell.heap.take().is_some() {
            cell.generation += 1;
        }
        Ok(())
    }

    pub fn stats(&self, device: DeviceId) -> ForgeResult<Option<HeapStats>> {
        let entry = self.entry(device)?;
        let cell = entry.heap.lock()?;
        Ok(cell.heap.as_ref().map(DeviceHeap::stats))
    }

    /// Return every heap region to its backend
    pub fn shutdown(&self) -> ForgeResult<()> {
        for (device, entry) in &self.devices {
            let mut cell = entry.heap.lock()?;
            if let Some(heap) = cell.heap.take() {
                cell.generation += 1;
                entry.backend.free_buffer(*device, heap.region())?;
                tracing::debug!(device = %device, "device heap released");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;

    fn manager(memory: usize, config: HeapConfig) -> (Arc<HostBackend>, DeviceBufferManager) {
        let backend = Arc::new(HostBackend::new(0, 2, memory));
        let devices = backend
            .devices()
            .into_iter()
            .map(|info| (backend.clone() as Arc<dyn DeviceBackend>, info));
        let manager = DeviceBufferManager::new(config, devices);
        (backend, manager)
    }

    #[test]
    fn test_heap_created_lazily() {
        let (backend, manager) = manager(4096, HeapConfig::default());
        let d0 = DeviceId::new(0, 0);
        assert_eq!(backend.region_count().unwrap(), 0);
        assert!(manager.stats(d0).unwrap().is_none());

        let handle = manager.allocate(d0, 100).unwrap();
        assert_eq!(handle.capacity, 128);
        assert_eq!(backend.region_count().unwrap(), 1);
        assert_eq!(manager.stats(d0).unwrap().unwrap().capacity, 3072);
    }

    #[test]
    fn test_heap_bytes_override() {
        let config = HeapConfig {
            heap_bytes: Some(1024),
            ..HeapConfig::default()
        };
        let (_backend, manager) = manager(1 << 20, config);
        let d1 = DeviceId::new(0, 1);
        assert_eq!(manager.available(d1).unwrap(), 1024);
        assert!(manager.can_allocate(d1, 1024).unwrap());
        assert!(!manager.can_allocate(d1, 1025).unwrap());
    }

    #[test]
    fn test_devices_are_independent() {
        let config = HeapConfig {
            heap_bytes: Some(256),
            ..HeapConfig::default()
        };
        let (_backend, manager) = manager(4096, config);
        let d0 = DeviceId::new(0, 0);
        let d1 = DeviceId::new(0, 1);

        manager.allocate(d0, 256).unwrap();
        assert!(manager.allocate(d0, 1).is_err());
        assert!(manager.allocate(d1, 256).is_ok());
    }

    #[test]
    fn test_release_and_reset() {
        let (_backend, manager) = manager(4096, HeapConfig::default());
        let d0 = DeviceId::new(0, 0);
        let a = manager.allocate(d0, 64).unwrap();
        let _b = manager.allocate(d0, 64).unwrap();
        manager.release(&a).unwrap();
        assert_eq!(manager.stats(d0).unwrap().unwrap().used, 64);

        manager.reset_all(d0).unwrap();
        assert_eq!(manager.stats(d0).unwrap().unwrap().used, 0);
    }

    #[test]
    fn test_release_after_discard_is_noop() {
        let (_backend, manager) = manager(4096, HeapConfig::default());
        let d0 = DeviceId::new(0, 0);
        let a = manager.allocate(d0, 64).unwrap();
        manager.discard_heap(d0).unwrap();
        manager.release(&a).unwrap();
    }

    #[test]
    fn test_stale_release_after_reset_keeps_live_slot() {
        let (_backend, manager) = manager(4096, HeapConfig::default());
        let d0 = DeviceId::new(0, 0);
        let stale = manager.allocate(d0, 256).unwrap();
        manager.reset_all(d0).unwrap();

        let live = manager.allocate(d0, 256).unwrap();
        assert_eq!(live.offset, stale.offset);
        assert!(!manager.is_live(&stale).unwrap());
        assert!(manager.is_live(&live).unwrap());

        manager.release(&stale).unwrap();
        let next = manager.allocate(d0, 256).unwrap();
        assert_ne!(next.offset, live.offset);
        assert_eq!(manager.stats(d0).unwrap().unwrap().used, 512);
    }

    #[test]
    fn test_generation_moves_on_discard() {
        let (_backend, manager) = manager(4096, HeapConfig::default());
        let d0 = DeviceId::new(0, 0);
        assert_eq!(manager.generation(d0).unwrap(), 0);
        let old = manager.allocate(d0, 64).unwrap();
        assert_eq!(old.generation, 1);

        manager.discard_heap(d0).unwrap();
        let new = manager.allocate(d0, 64).unwrap();
        assert!(new.generation > old.generation);
        assert!(!manager.is_live(&old).unwrap());
        manager.release(&old).unwrap();
        assert_eq!(manager.stats(d0).unwrap().unwrap().used, 64);
    }

    #[test]
    fn test_unknown_device() {
        let (_backend, manager) = manager(4096, HeapConfig::default());
        let err = manager.allocate(DeviceId::new(3, 0), 8).unwrap_err();
        assert!(matches!(err, TaskForgeError::DeviceNotFound(_)));
    }

    #[test]
    fn test_shutdown_frees_regions() {
        let (backend, manager) = manager(4096, HeapConfig::default());
        manager.allocate(DeviceId::new(0, 0), 8).unwrap();
        manager.allocate(DeviceId::new(0, 1), 8).unwrap();
        assert_eq!(backend.region_count().unwrap(), 2);
        manager.shutdown().unwrap();
        assert_eq!(backend.region_count().unwrap(), 0);
    }
}
