//! Emulated device backend running kernels on the host.
//!
//! Every device exposed by a [`HostBackend`] owns a set of byte regions.
//! Operations execute synchronously at enqueue time but are still reported
//! through events, so the engine drives it exactly like a real accelerator.
//! An optional simulated latency delays completion to exercise barrier
//! timeouts.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::backend::{
    Capability, DeviceBackend, DeviceId, DeviceInfo, DeviceType, EventId, EventTiming, LaunchArg,
    RegionId,
};
use crate::error::{ForgeResult, TaskForgeError};
use crate::kernel::{CompiledKernel, KernelInvocation, KernelPayload, KernelValue, WorkerGrid};

/// Events kept per backend for timing queries.
const MAX_TRACKED_EVENTS: usize = 4096;

/// Default emulated device memory (256 MiB).
pub const DEFAULT_HOST_DEVICE_MEMORY: usize = 256 * 1024 * 1024;

/// Operation counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HostBackendStats {
    pub alloc_count: usize,
    pub free_count: usize,
    pub copy_in_count: usize,
    pub copy_out_count: usize,
    pub launch_count: usize,
    pub reset_count: usize,
    pub bytes_in: usize,
    pub bytes_out: usize,
}

#[derive(Debug, Default)]
struct HostState {
    regions: HashMap<(DeviceId, RegionId), Vec<u8>>,
    next_region: u64,
    next_event: u64,
    events: VecDeque<(DeviceId, EventId, EventTiming)>,
    /// Simulated completion time of the last enqueued operation
    busy_until: HashMap<DeviceId, Instant>,
    stats: HostBackendStats,
}

/// Host-emulated accelerator backend
#[derive(Debug)]
pub struct HostBackend {
    name: String,
    driver: usize,
    devices: Vec<DeviceInfo>,
    latency: Option<Duration>,
    epoch: Instant,
    state: Mutex<HostState>,
}

impl HostBackend {
    /// Create a backend exposing `device_count` devices of `memory_bytes` each
    pub fn new(driver: usize, device_count: usize, memory_bytes: usize) -> Self {
        let devices = (0..device_count)
            .map(|index| DeviceInfo {
                id: DeviceId::new(driver, index),
                name: format!("host-emulated-{}", index),
                device_type: DeviceType::Emulated,
                global_memory_bytes: memory_bytes,
                max_work_group_size: 1024,
                capabilities: vec![Capability::Fp64, Capability::Atomics, Capability::LocalMemory],
            })
            .collect();

        Self {
            name: "host".to_string(),
            driver,
            devices,
            latency: None,
            epoch: Instant::now(),
            state: Mutex::new(HostState::default()),
        }
    }

    /// Single device with the default memory size
    pub fn single() -> Self {
        Self::new(0, 1, DEFAULT_HOST_DEVICE_MEMORY)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Every enqueued operation completes `latency` after the previous one
    pub fn with_simulated_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Replace the capability list of every device
    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        for info in &mut self.devices {
            info.capabilities = capabilities.to_vec();
        }
        self
    }

    pub fn driver_index(&self) -> usize {
        self.driver
    }

    pub fn stats(&self) -> ForgeResult<HostBackendStats> {
        Ok(self.state.lock()?.stats.clone())
    }

    /// Number of live regions across all devices
    pub fn region_count(&self) -> ForgeResult<usize> {
        Ok(self.state.lock()?.regions.len())
    }

    fn check_device(&self, device: DeviceId) -> ForgeResult<()> {
        if device.driver == self.driver && device.device < self.devices.len() {
            Ok(())
        } else {
            Err(TaskForgeError::DeviceNotFound(format!(
                "{} is not exposed by backend '{}'",
                device, self.name
            )))
        }
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Record a completed operation and advance the simulated queue
    fn record_event(
        &self,
        state: &mut HostState,
        device: DeviceId,
        submit_ns: u64,
        start_ns: u64,
    ) -> EventId {
        let mut end_ns = self.now_ns();
        if let Some(latency) = self.latency {
            let now = Instant::now();
            let base = state
                .busy_until
                .get(&device)
                .copied()
                .filter(|until| *until > now)
                .unwrap_or(now);
            state.busy_until.insert(device, base + latency);
            end_ns += latency.as_nanos() as u64;
        }

        state.next_event += 1;
        let event = EventId(state.next_event);
        if state.events.len() == MAX_TRACKED_EVENTS {
            state.events.pop_front();
        }
        state.events.push_back((
            device,
            event,
            EventTiming {
                submit_ns,
                start_ns,
                end_ns,
            },
        ));
        event
    }
}

fn region_slice<'a>(
    state: &'a mut HostState,
    device: DeviceId,
    region: RegionId,
    offset: usize,
    len: usize,
) -> ForgeResult<&'a mut [u8]> {
    let bytes = state
        .regions
        .get_mut(&(device, region))
        .ok_or_else(|| TaskForgeError::ExecutionFailure(format!("unknown region {:?} on {}", region, device)))?;
    let end = offset
        .checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| {
            TaskForgeError::ExecutionFailure(format!(
                "access [{}, {}+{}) outside region of {} bytes on {}",
                offset,
                offset,
                len,
                bytes.len(),
                device
            ))
        })?;
    Ok(&mut bytes[offset..end])
}

impl DeviceBackend for HostBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.clone()
    }

    fn allocate_buffer(&self, device: DeviceId, size: usize) -> ForgeResult<RegionId> {
        self.check_device(device)?;
        let mut state = self.state.lock()?;
        state.next_region += 1;
        let region = RegionId(state.next_region);
        state.regions.insert((device, region), vec![0u8; size]);
        state.stats.alloc_count += 1;
        tracing::trace!(device = %device, region = region.0, size, "host region allocated");
        Ok(region)
    }

    fn free_buffer(&self, device: DeviceId, region: RegionId) -> ForgeResult<()> {
        self.check_device(device)?;
        let mut state = self.state.lock()?;
        if state.regions.remove(&(device, region)).is_none() {
            return Err(TaskForgeError::InternalError(format!(
                "double free of region {:?} on {}",
                region, device
            )));
        }
        state.stats.free_count += 1;
        Ok(())
    }

    fn enqueue_copy_in(
        &self,
        device: DeviceId,
        region: RegionId,
        device_offset: usize,
        host: &[u8],
    ) -> ForgeResult<EventId> {
        self.check_device(device)?;
        let submit = self.now_ns();
        let mut state = self.state.lock()?;
        let start = self.now_ns();
        region_slice(&mut state, device, region, device_offset, host.len())?.copy_from_slice(host);
        state.stats.copy_in_count += 1;
        state.stats.bytes_in += host.len();
        Ok(self.record_event(&mut state, device, submit, start))
    }

    fn enqueue_copy_out(
        &self,
        device: DeviceId,
        region: RegionId,
        device_offset: usize,
        host: &mut [u8],
    ) -> ForgeResult<EventId> {
        self.check_device(device)?;
        let submit = self.now_ns();
        let mut state = self.state.lock()?;
        let start = self.now_ns();
        host.copy_from_slice(region_slice(&mut state, device, region, device_offset, host.len())?);
        state.stats.copy_out_count += 1;
        state.stats.bytes_out += host.len();
        Ok(self.record_event(&mut state, device, submit, start))
    }

    fn enqueue_launch(
        &self,
        device: DeviceId,
        kernel: &CompiledKernel,
        grid: &WorkerGrid,
        thread_offset: usize,
        args: &[LaunchArg],
    ) -> ForgeResult<EventId> {
        self.check_device(device)?;
        let function = match kernel.payload() {
            KernelPayload::Host(function) => function.clone(),
            KernelPayload::Binary(_) => {
                return Err(TaskForgeError::UnsupportedConfiguration(format!(
                    "backend '{}' cannot run binary kernel '{}'",
                    self.name,
                    kernel.method()
                )))
            }
        };

        let submit = self.now_ns();
        let mut state = self.state.lock()?;

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            match arg {
                LaunchArg::Buffer {
                    region,
                    offset,
                    size,
                    ..
                } => {
                    let bytes = region_slice(&mut state, device, *region, *offset, *size)?;
                    values.push(KernelValue::Buffer(bytes.to_vec()));
                }
                LaunchArg::Scalar(value) => values.push(KernelValue::Scalar(*value)),
            }
        }

        let start = self.now_ns();
        let mut invocation = KernelInvocation::new(values, *grid, thread_offset);
        function(&mut invocation).map_err(|msg| {
            TaskForgeError::ExecutionFailure(format!(
                "kernel '{}' failed on {}: {}",
                kernel.method(),
                device,
                msg
            ))
        })?;

        for (arg, value) in args.iter().zip(invocation.into_values()) {
            if let (
                LaunchArg::Buffer {
                    region,
                    offset,
                    size,
                    writable: true,
                },
                KernelValue::Buffer(bytes),
            ) = (arg, value)
            {
                if bytes.len() != *size {
                    return Err(TaskForgeError::ExecutionFailure(format!(
                        "kernel '{}' resized argument buffer from {} to {} bytes",
                        kernel.method(),
                        size,
                        bytes.len()
                    )));
                }
                region_slice(&mut state, device, *region, *offset, *size)?.copy_from_slice(&bytes);
            }
        }

        state.stats.launch_count += 1;
        Ok(self.record_event(&mut state, device, submit, start))
    }

    fn await_all(&self, device: DeviceId, timeout: Option<Duration>) -> ForgeResult<()> {
        self.check_device(device)?;
        let pending = {
            let state = self.state.lock()?;
            state
                .busy_until
                .get(&device)
                .map(|until| until.saturating_duration_since(Instant::now()))
                .unwrap_or_default()
        };

        if pending.is_zero() {
            return Ok(());
        }

        if let Some(limit) = timeout {
            if pending > limit {
                std::thread::sleep(limit);
                return Err(TaskForgeError::ExecutionTimeout {
                    device,
                    timeout_ms: limit.as_millis() as u64,
                });
            }
        }

        std::thread::sleep(pending);
        Ok(())
    }

    fn event_timing(&self, device: DeviceId, event: EventId) -> Option<EventTiming> {
        let state = self.state.lock().ok()?;
        state
            .events
            .iter()
            .rev()
            .find(|(d, e, _)| *d == device && *e == event)
            .map(|(_, _, timing)| *timing)
    }

    fn reset(&self, device: DeviceId) -> ForgeResult<()> {
        self.check_device(device)?;
        let mut state = self.state.lock()?;
        state.regions.retain(|(d, _), _| *d != device);
        state.events.retain(|(d, _, _)| *d != device);
        state.busy_until.remove(&device);
        state.stats.reset_count += 1;
        tracing::debug!(device = %device, backend = %self.name, "host device reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{CompiledKernel, WorkerGrid};
    use std::sync::Arc;

    fn doubling_kernel(device: DeviceId) -> CompiledKernel {
        CompiledKernel::host(
            "double",
            device,
            Arc::new(|inv: &mut KernelInvocation| {
                let values: Vec<f32> = inv.read(0)?;
                let doubled: Vec<f32> = values.iter().map(|v| v * 2.0).collect();
                inv.write(0, &doubled)
            }),
        )
    }

    #[test]
    fn test_devices_are_enumerated() {
        let backend = HostBackend::new(2, 3, 1024);
        let devices = backend.devices();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[2].id, DeviceId::new(2, 2));
        assert_eq!(devices[0].global_memory_bytes, 1024);
    }

    #[test]
    fn test_unknown_device_rejected() {
        let backend = HostBackend::new(0, 1, 1024);
        let err = backend.allocate_buffer(DeviceId::new(0, 5), 16).unwrap_err();
        assert!(matches!(err, TaskForgeError::DeviceNotFound(_)));
    }

    #[test]
    fn test_copy_round_trip() {
        let backend = HostBackend::new(0, 1, 1024);
        let device = DeviceId::new(0, 0);
        let region = backend.allocate_buffer(device, 64).unwrap();

        backend.enqueue_copy_in(device, region, 8, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        backend.enqueue_copy_out(device, region, 8, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);

        let stats = backend.stats().unwrap();
        assert_eq!(stats.copy_in_count, 1);
        assert_eq!(stats.copy_out_count, 1);
        assert_eq!(stats.bytes_in, 4);
    }

    #[test]
    fn test_out_of_range_copy_fails() {
        let backend = HostBackend::new(0, 1, 1024);
        let device = DeviceId::new(0, 0);
        let region = backend.allocate_buffer(device, 8).unwrap();
        let err = backend.enqueue_copy_in(device, region, 6, &[0; 4]).unwrap_err();
        assert!(matches!(err, TaskForgeError::ExecutionFailure(_)));
    }

    #[test]
    fn test_launch_writes_back_writable_buffers() {
        let backend = HostBackend::new(0, 1, 1024);
        let device = DeviceId::new(0, 0);
        let region = backend.allocate_buffer(device, 16).unwrap();
        let input: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        backend.enqueue_copy_in(device, region, 0, &input).unwrap();

        let kernel = doubling_kernel(device);
        let args = [LaunchArg::Buffer {
            region,
            offset: 0,
            size: 16,
            writable: true,
        }];
        let event = backend
            .enqueue_launch(device, &kernel, &WorkerGrid::new_1d(4), 0, &args)
            .unwrap();
        backend.await_all(device, None).unwrap();

        let mut out = vec![0u8; 16];
        backend.enqueue_copy_out(device, region, 0, &mut out).unwrap();
        let result: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(result, vec![2.0, 4.0, 6.0, 8.0]);
        assert!(backend.event_timing(device, event).is_some());
    }

    #[test]
    fn test_read_only_buffers_untouched() {
        let backend = HostBackend::new(0, 1, 1024);
        let device = DeviceId::new(0, 0);
        let region = backend.allocate_buffer(device, 4).unwrap();
        backend
            .enqueue_copy_in(device, region, 0, &1.5f32.to_le_bytes())
            .unwrap();

        let kernel = doubling_kernel(device);
        let args = [LaunchArg::Buffer {
            region,
            offset: 0,
            size: 4,
            writable: false,
        }];
        backend
            .enqueue_launch(device, &kernel, &WorkerGrid::new_1d(1), 0, &args)
            .unwrap();

        let mut out = [0u8; 4];
        backend.enqueue_copy_out(device, region, 0, &mut out).unwrap();
        assert_eq!(f32::from_le_bytes(out), 1.5);
    }

    #[test]
    fn test_kernel_error_is_execution_failure() {
        let backend = HostBackend::new(0, 1, 1024);
        let device = DeviceId::new(0, 0);
        let kernel = CompiledKernel::host(
            "fault",
            device,
            Arc::new(|_: &mut KernelInvocation| Err("illegal address".to_string())),
        );
        let err = backend
            .enqueue_launch(device, &kernel, &WorkerGrid::new_1d(1), 0, &[])
            .unwrap_err();
        assert!(matches!(err, TaskForgeError::ExecutionFailure(_)));
        assert!(err.to_string().contains("illegal address"));
    }

    #[test]
    fn test_simulated_latency_times_out() {
        let backend = HostBackend::new(0, 1, 1024).with_simulated_latency(Duration::from_millis(200));
        let device = DeviceId::new(0, 0);
        let region = backend.allocate_buffer(device, 4).unwrap();
        backend.enqueue_copy_in(device, region, 0, &[0; 4]).unwrap();

        let err = backend
            .await_all(device, Some(Duration::from_millis(5)))
            .unwrap_err();
        assert!(matches!(err, TaskForgeError::ExecutionTimeout { timeout_ms: 5, .. }));
    }

    #[test]
    fn test_reset_drops_regions() {
        let backend = HostBackend::new(0, 2, 1024);
        let d0 = DeviceId::new(0, 0);
        let d1 = DeviceId::new(0, 1);
        backend.allocate_buffer(d0, 4).unwrap();
        backend.allocate_buffer(d1, 4).unwrap();
        assert_eq!(backend.region_count().unwrap(), 2);

        backend.reset(d0).unwrap();
        assert_eq!(backend.region_count().unwrap(), 1);
        assert_eq!(backend.stats().unwrap().reset_count, 1);
    }

    #[test]
    fn test_double_free_is_internal_error() {
        let backend = HostBackend::new(0, 1, 1024);
        let device = DeviceId::new(0, 0);
        let region = backend.allocate_buffer(device, 4).unwrap();
        backend.free_buffer(device, region).unwrap();
        assert!(backend
            .free_buffer(device, region)
            .unwrap_err()
            .is_internal_error());
    }
}
