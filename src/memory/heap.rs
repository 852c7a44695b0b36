//! Per-device heap carved out of one backend region.
//!
//! The heap hands out aligned slices with a bump pointer. Released slices
//! go into a free list keyed by their exact aligned size and are reused
//! before the bump pointer grows again. A release at the top of the heap
//! lowers the bump pointer instead.

use std::collections::HashMap;

use crate::backend::{DeviceId, RegionId};
use crate::error::{ForgeResult, TaskForgeError};

/// Slice handed out by a [`DeviceHeap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSlot {
    pub offset: usize,
    /// Aligned size actually reserved
    pub class: usize,
}

/// Heap statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub capacity: usize,
    pub used: usize,
    pub top: usize,
    pub peak_top: usize,
    pub free_slots: usize,
    pub allocations: usize,
    pub reuses: usize,
    pub releases: usize,
}

#[derive(Debug)]
pub struct DeviceHeap {
    device: DeviceId,
    region: RegionId,
    capacity: usize,
    alignment: usize,
    top: usize,
    /// Size class -> offsets of free slots
    free_slots: HashMap<usize, Vec<usize>>,
    /// Offset -> size class of live slots
    live: HashMap<usize, usize>,
    stats: HeapStats,
}

pub(crate) fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

impl DeviceHeap {
    pub fn new(device: DeviceId, region: RegionId, capacity: usize, alignment: usize) -> ForgeResult<Self> {
        if !alignment.is_power_of_two() {
            return Err(TaskForgeError::InvalidConfiguration(format!(
                "heap alignment must be a power of two, got {}",
                alignment
            )));
        }
        Ok(Self {
            device,
            region,
            capacity,
            alignment,
            top: 0,
            free_slots: HashMap::new(),
            live: HashMap::new(),
            stats: HeapStats {
                capacity,
                ..HeapStats::default()
            },
        })
    }

    pub fn region(&self) -> RegionId {
        self.region
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Aligned size reserved for a request of `size` bytes
    pub fn size_class(&self, size: usize) -> usize {
        align_up(size.max(1), self.alignment)
    }

    /// Bytes held by live slots
    pub fn used(&self) -> usize {
        self.live.values().sum()
    }

    /// Bytes not held by live slots (free-list slots included)
    pub fn available(&self) -> usize {
        self.capacity - self.used()
    }

    pub fn can_allocate(&self, size: usize) -> bool {
        let class = self.size_class(size);
        self.free_slots.get(&class).is_some_and(|slots| !slots.is_empty())
            || self.top + class <= self.capacity
    }

    pub fn allocate(&mut self, size: usize) -> ForgeResult<HeapSlot> {
        let class = self.size_class(size);

        if let Some(offset) = self.free_slots.get_mut(&class).and_then(Vec::pop) {
            self.live.insert(offset, class);
            self.stats.reuses += 1;
            self.stats.allocations += 1;
            tracing::trace!(device = %self.device, offset, class, "heap slot reused");
            return Ok(HeapSlot { offset, class });
        }

        if self.top + class > self.capacity {
            return Err(TaskForgeError::OutOfMemory {
                device: self.device,
                requested: size,
                available: self.capacity - self.top,
            });
        }

        let offset = self.top;
        self.top += class;
        self.stats.peak_top = self.stats.peak_top.max(self.top);
        self.live.insert(offset, class);
        self.stats.allocations += 1;
        tracing::trace!(device = %self.device, offset, class, "heap slot allocated");
        Ok(HeapSlot { offset, class })
    }

    pub fn release(&mut self, offset: usize) -> ForgeResult<()> {
        let class = self.live.remove(&offset).ok_or_else(|| {
            TaskForgeError::InternalError(format!(
                "release of unknown heap offset {} on {}",
                offset, self.device
            ))
        })?;
        self.stats.releases += 1;

        if offset + class == self.top {
            self.top = offset;
            self.shrink_top();
        } else {
            self.free_slots.entry(class).or_default().push(offset);
        }
        Ok(())
    }

    /// Pull the bump pointer down over free slots sitting at the top
    fn shrink_top(&mut self) {
        loop {
            let top = self.top;
            let found = self.free_slots.iter().find_map(|(class, offsets)| {
                offsets
                    .iter()
                    .position(|offset| offset + class == top)
                    .map(|index| (*class, index))
            });
            match found {
                Some((class, index)) => {
                    if let Some(offsets) = self.free_slots.get_mut(&class) {
                        let offset = offsets.swap_remove(index);
                        self.top = offset;
                    }
                }
                None => break,
            }
        }
        self.free_slots.retain(|_, offsets| !offsets.is_empty());
    }

    /// Forget every slot; the region itself is kept
    pub fn reset(&mut self) {
        self.top = 0;
        self.free_slots.clear();
        self.live.clear();
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            used: self.used(),
            top: self.top,
            free_slots: self.free_slots.values().map(Vec::len).sum(),
            ..self.stats
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn heap(capacity: usize) -> DeviceHeap {
        DeviceHeap::new(DeviceId::new(0, 0), RegionId(1), capacity, 64).unwrap()
    }

    #[test]
    fn test_alignment_validated() {
        let err = DeviceHeap::new(DeviceId::new(0, 0), RegionId(1), 1024, 48).unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_bump_allocation_is_aligned() {
        let mut heap = heap(1024);
        let a = heap.allocate(10).unwrap();
        let b = heap.allocate(100).unwrap();
        assert_eq!(a, HeapSlot { offset: 0, class: 64 });
        assert_eq!(b, HeapSlot { offset: 64, class: 128 });
        assert_eq!(heap.used(), 192);
    }

    #[test]
    fn test_free_slot_reused_for_same_class() {
        let mut heap = heap(1024);
        let a = heap.allocate(64).unwrap();
        let _b = heap.allocate(64).unwrap();
        heap.release(a.offset).unwrap();

        let c = heap.allocate(50).unwrap();
        assert_eq!(c.offset, a.offset);
        assert_eq!(heap.stats().reuses, 1);
    }

    #[test]
    fn test_release_at_top_lowers_bump_pointer() {
        let mut heap = heap(1024);
        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let c = heap.allocate(64).unwrap();

        heap.release(b.offset).unwrap();
        assert_eq!(heap.stats().free_slots, 1);
        heap.release(c.offset).unwrap();

        let stats = heap.stats();
        assert_eq!(stats.top, 64);
        assert_eq!(stats.free_slots, 0);
        heap.release(a.offset).unwrap();
        assert_eq!(heap.stats().top, 0);
    }

    #[test]
    fn test_out_of_memory() {
        let mut heap = heap(256);
        heap.allocate(200).unwrap();
        let err = heap.allocate(64).unwrap_err();
        match err {
            TaskForgeError::OutOfMemory {
                requested,
                available,
                ..
            } => {
                assert_eq!(requested, 64);
                assert_eq!(available, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!heap.can_allocate(1));
    }

    #[test]
    fn test_unknown_release_is_internal_error() {
        let mut heap = heap(256);
        assert!(heap.release(64).unwrap_err().is_internal_error());
    }

    #[test]
    fn test_reset() {
        let mut heap = heap(256);
        heap.allocate(128).unwrap();
        heap.reset();
        assert_eq!(heap.used(), 0);
        assert!(heap.can_allocate(256));
        assert_eq!(heap.stats().allocations, 1);
    }

    fn check_tiling(heap: &DeviceHeap) {
        let mut slots: Vec<(usize, usize)> = heap.live.iter().map(|(o, c)| (*o, *c)).collect();
        for (class, offsets) in &heap.free_slots {
            slots.extend(offsets.iter().map(|o| (*o, *class)));
        }
        slots.sort();
        let mut cursor = 0;
        for (offset, class) in slots {
            assert_eq!(offset, cursor, "gap or overlap at {}", offset);
            cursor += class;
        }
        assert_eq!(cursor, heap.top);
        assert!(heap.top <= heap.capacity);
    }

    proptest! {
        #[test]
        fn test_slots_tile_the_heap(
            ops in prop::collection::vec((any::<bool>(), 1..300usize), 1..64)
        ) {
            let mut heap = heap(8 * 1024);
            let mut live = Vec::new();
            for (release, size) in ops {
                if release && !live.is_empty() {
                    let offset = live.swap_remove(size % live.len());
                    heap.release(offset).unwrap();
                } else if let Ok(slot) = heap.allocate(size) {
                    prop_assert_eq!(slot.offset % 64, 0);
                    live.push(slot.offset);
                }
                check_tiling(&heap);
            }

            for offset in live {
                heap.release(offset).unwrap();
            }
            prop_assert_eq!(heap.used(), 0);
            prop_assert_eq!(heap.stats().top, 0);
        }
    }
}
