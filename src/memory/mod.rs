//! Device memory management.
//!
//! Each device gets one large backend region at first use, subdivided by a
//! [`DeviceHeap`]. Freed slices are kept in free lists keyed by aligned size
//! so repeated executions of the same plan reuse the same slices.

pub mod batch;
pub mod heap;
pub mod manager;

pub use batch::{parse_size, BatchChunk, BatchConfiguration};
pub use heap::{DeviceHeap, HeapSlot, HeapStats};
pub use manager::{BufferHandle, DeviceBufferManager, HeapConfig};
