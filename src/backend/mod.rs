//! Device backend contract.
//!
//! The execution engine never talks to a driver directly. Every native
//! operation (region allocation, host/device copies, kernel launches,
//! synchronisation) goes through a [`DeviceBackend`]. Operations are
//! enqueued and return an [`EventId`]; completion is only guaranteed after
//! [`DeviceBackend::await_all`].

pub mod host_backend;

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::ForgeResult;
use crate::kernel::{CompiledKernel, ScalarValue, WorkerGrid};

pub use host_backend::{HostBackend, HostBackendStats};

/// Identifies one device: the backend (driver) index and the device index
/// inside that backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId {
    pub driver: usize,
    pub device: usize,
}

impl DeviceId {
    pub const fn new(driver: usize, device: usize) -> Self {
        Self { driver, device }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device[{}:{}]", self.driver, self.device)
    }
}

/// Optional device features a task may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Capability {
    Fp64,
    Fp16,
    Atomics,
    LocalMemory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceType {
    Gpu,
    Fpga,
    Cpu,
    Emulated,
}

/// Static description of a device as reported by its backend.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    pub device_type: DeviceType,
    pub global_memory_bytes: usize,
    pub max_work_group_size: usize,
    pub capabilities: Vec<Capability>,
}

impl DeviceInfo {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }
}

/// Device memory region handed out by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId(pub u64);

/// Completion handle for an enqueued device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId(pub u64);

/// Timestamps of a completed operation, in nanoseconds since the backend epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EventTiming {
    pub submit_ns: u64,
    pub start_ns: u64,
    pub end_ns: u64,
}

impl EventTiming {
    pub fn elapsed_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }

    pub fn queued_ns(&self) -> u64 {
        self.start_ns.saturating_sub(self.submit_ns)
    }
}

/// Argument passed to a kernel launch.
#[derive(Debug, Clone, PartialEq)]
pub enum LaunchArg {
    /// Slice of a device region.
    Buffer {
        region: RegionId,
        offset: usize,
        size: usize,
        writable: bool,
    },
    /// Value passed by copy.
    Scalar(ScalarValue),
}

/// Native capability the engine calls into for one driver.
pub trait DeviceBackend: Send + Sync {
    /// Backend name, also the key for per-backend compiler flags.
    fn name(&self) -> &str;

    /// Devices exposed by this backend.
    fn devices(&self) -> Vec<DeviceInfo>;

    /// Allocate a raw device region of `size` bytes.
    fn allocate_buffer(&self, device: DeviceId, size: usize) -> ForgeResult<RegionId>;

    /// Return a region to the driver.
    fn free_buffer(&self, device: DeviceId, region: RegionId) -> ForgeResult<()>;

    /// Copy `host` into `region` starting at `device_offset`.
    fn enqueue_copy_in(
        &self,
        device: DeviceId,
        region: RegionId,
        device_offset: usize,
        host: &[u8],
    ) -> ForgeResult<EventId>;

    /// Copy `host.len()` bytes out of `region` starting at `device_offset`.
    fn enqueue_copy_out(
        &self,
        device: DeviceId,
        region: RegionId,
        device_offset: usize,
        host: &mut [u8],
    ) -> ForgeResult<EventId>;

    fn enqueue_launch(
        &self,
        device: DeviceId,
        kernel: &CompiledKernel,
        grid: &WorkerGrid,
        thread_offset: usize,
        args: &[LaunchArg],
    ) -> ForgeResult<EventId>;

    /// Block until every operation enqueued on `device` has completed.
    fn await_all(&self, device: DeviceId, timeout: Option<Duration>) -> ForgeResult<()>;

    /// Timing of a completed event, if the backend still remembers it.
    fn event_timing(&self, device: DeviceId, event: EventId) -> Option<EventTiming>;

    /// Drop all queued work and regions of `device`.
    fn reset(&self, device: DeviceId) -> ForgeResult<()>;
}
