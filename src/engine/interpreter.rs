//! Plan interpreter
//!
//! Walks a [`CompiledPlan`] once per invocation, issuing device operations
//! through the runtime's backends and keeping the plan's
//! [`ObjectStateTracker`] in step with what each device holds.
//!
//! Per invocation the engine moves `Idle -> Running -> {Completed, Failed}`.
//! Any error raised while running poisons the engine: later invocations
//! fail with [`TaskForgeError::PlanUnusable`] until [`Interpreter::reset`],
//! or [`Interpreter::recover_after_oom`] when a batched plan retries.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::backend::{DeviceBackend, DeviceId, EventId, LaunchArg};
use crate::error::{ForgeResult, TaskForgeError};
use crate::graph::{DataTransferMode, ImmutableTaskGraph, TaskArgument};
use crate::kernel::{CompiledKernel, CompilerFlags, KernelCache};
use crate::memory::BufferHandle;
use crate::object::{LogicalObject, ObjectId, ObjectStateTracker};
use crate::plan::{ArgRef, CompiledPlan, Instruction};
use crate::profiling::{KernelTimer, ProfileEvent, ProfileEventKind, ProfilerType, TimeProfiler};
use crate::runtime::RuntimeContext;
use crate::{config_error, internal_error};

use super::stats::EngineStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "IDLE",
            EngineState::Running => "RUNNING",
            EngineState::Completed => "COMPLETED",
            EngineState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

fn binding(bindings: &[LogicalObject], index: usize) -> ForgeResult<&LogicalObject> {
    bindings
        .get(index)
        .ok_or_else(|| internal_error!("object index {} out of range", index))
}

/// Replays a compiled plan against the runtime's devices and owns the
/// plan's object states, kernel cache and profiling records
pub struct Interpreter {
    runtime: Arc<RuntimeContext>,
    tracker: ObjectStateTracker,
    kernels: KernelCache,
    state: EngineState,
    poisoned: bool,
    events: Vec<ProfileEvent>,
    profiler: TimeProfiler,
    executions: u64,
    compiler_flags: CompilerFlags,
    memory_limit: Option<usize>,
    /// Bytes this engine holds per device
    allocated: HashMap<DeviceId, usize>,
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("state", &self.state)
            .field("poisoned", &self.poisoned)
            .field("executions", &self.executions)
            .field("objects", &self.tracker.len())
            .field("kernels", &self.kernels.len())
            .finish()
    }
}

impl Interpreter {
    pub fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self {
            runtime,
            tracker: ObjectStateTracker::new(),
            kernels: KernelCache::new(),
            state: EngineState::Idle,
            poisoned: false,
            events: Vec::new(),
            profiler: TimeProfiler::new(),
            executions: 0,
            compiler_flags: CompilerFlags::default(),
            memory_limit: None,
            allocated: HashMap::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn tracker(&self) -> &ObjectStateTracker {
        &self.tracker
    }

    pub fn profiles(&self) -> &[ProfileEvent] {
        &self.events
    }

    pub fn time_profiler(&self) -> &TimeProfiler {
        &self.profiler
    }

    pub fn clear_profiles(&mut self) {
        self.events.clear();
        self.profiler.clean();
    }

    pub fn allocated_bytes(&self, device: DeviceId) -> usize {
        self.allocated.get(&device).copied().unwrap_or(0)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.state,
            poisoned: self.poisoned,
            executions: self.executions,
            tracked_objects: self.tracker.len(),
            profile_events: self.events.len(),
            kernels: self.kernels.stats(),
            allocated_bytes: self.allocated.values().sum(),
        }
    }

    /// Replace the per-backend compiler flags; cached kernels are dropped
    pub fn set_compiler_flags(&mut self, backend: &str, flags: &str) {
        self.compiler_flags.set(backend, flags);
        self.kernels.invalidate_all();
    }

    pub fn set_memory_limit(&mut self, limit: Option<usize>) {
        self.memory_limit = limit;
    }

    fn transition(&mut self, to: EngineState) -> ForgeResult<()> {
        let allowed = matches!(
            (self.state, to),
            (EngineState::Idle, EngineState::Running)
                | (EngineState::Completed, EngineState::Running)
                | (EngineState::Failed, EngineState::Running)
                | (EngineState::Running, EngineState::Completed)
                | (EngineState::Running, EngineState::Failed)
                | (_, EngineState::Idle)
        );
        if !allowed {
            return Err(TaskForgeError::InvalidStateTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        self.state = to;
        Ok(())
    }

    fn ensure_usable(&self) -> ForgeResult<()> {
        if self.poisoned {
            return Err(TaskForgeError::PlanUnusable);
        }
        self.runtime.ensure_active()
    }

    fn resolve_all(&mut self, bindings: &[LogicalObject]) -> ForgeResult<()> {
        for object in bindings {
            self.tracker.resolve(object)?;
        }
        Ok(())
    }

    /// Forget buffers whose device heap was reset behind this engine's back
    fn drop_stale_buffers(&mut self) -> ForgeResult<()> {
        let stale = self.tracker.forget_stale_buffers(self.runtime.buffers())?;
        for handle in &stale {
            self.adjust_allocated(handle.device, handle.size, 0);
        }
        if !stale.is_empty() {
            tracing::warn!(
                buffers = stale.len(),
                "device heap was reset, buffers will be re-materialised"
            );
        }
        Ok(())
    }

    /// Run every instruction of `plan` once.
    pub fn execute(
        &mut self,
        graph: &ImmutableTaskGraph,
        bindings: &[LogicalObject],
        plan: &CompiledPlan,
        profile: bool,
    ) -> ForgeResult<()> {
        self.ensure_usable()?;
        self.transition(EngineState::Running)?;
        self.executions += 1;
        if profile {
            self.profiler.clean();
        }

        let mut timer = KernelTimer::for_phase("execute");
        timer.start();
        let result = self.run(graph, bindings, plan, profile);
        timer.stop();

        match result {
            Ok(()) => {
                if profile {
                    self.profiler.add(ProfilerType::TotalTime, timer.elapsed_ns().unwrap_or(0));
                }
                self.transition(EngineState::Completed)?;
                tracing::debug!(
                    graph = %graph.name(),
                    invocation = self.executions,
                    elapsed_ms = timer.elapsed_ms().unwrap_or(0.0),
                    "plan executed"
                );
                Ok(())
            }
            Err(err) => {
                self.transition(EngineState::Failed)?;
                if err.poisons_plan() {
                    self.poisoned = true;
                }
                tracing::warn!(
                    graph = %graph.name(),
                    invocation = self.executions,
                    poisoned = self.poisoned,
                    error = %err,
                    "plan execution failed"
                );
                Err(err)
            }
        }
    }

    fn run(
        &mut self,
        graph: &ImmutableTaskGraph,
        bindings: &[LogicalObject],
        plan: &CompiledPlan,
        profile: bool,
    ) -> ForgeResult<()> {
        self.resolve_all(bindings)?;
        self.drop_stale_buffers()?;
        for (pc, instruction) in plan.instructions().iter().enumerate() {
            tracing::trace!(pc, op = instruction.mnemonic(), device = %instruction.device(), "dispatch");
            self.dispatch(graph, bindings, plan, instruction, profile)?;
        }
        Ok(())
    }

    fn dispatch(
        &mut self,
        graph: &ImmutableTaskGraph,
        bindings: &[LogicalObject],
        plan: &CompiledPlan,
        instruction: &Instruction,
        profile: bool,
    ) -> ForgeResult<()> {
        match instruction {
            Instruction::ContextSwitch { device } => {
                self.runtime.backend_for(*device)?;
                Ok(())
            }
            Instruction::Allocate {
                device,
                objects,
                batch_bytes,
            } => {
                for &object in objects {
                    let binding = binding(bindings, object)?;
                    let size = match batch_bytes {
                        Some(bytes) if plan.metadata().is_batched(object) => *bytes,
                        _ => binding.byte_size()?,
                    };
                    self.ensure_buffer(binding.id(), *device, size)?;
                }
                Ok(())
            }
            Instruction::CopyIn {
                object,
                device,
                mode,
                offset,
                size,
            } => self.copy_in(binding(bindings, *object)?, *device, *mode, *offset, *size, profile),
            Instruction::Launch {
                task,
                device,
                args,
                element_offset,
                threads,
                chunk_bytes,
            } => self.launch(
                graph,
                bindings,
                plan,
                *task,
                *device,
                args,
                *element_offset,
                *threads,
                *chunk_bytes,
                profile,
            ),
            Instruction::CopyOut {
                object,
                device,
                mode,
                offset,
                size,
                blocking,
            } => self.copy_out(
                binding(bindings, *object)?,
                *device,
                *mode,
                *offset,
                *size,
                *blocking,
                profile,
            ),
            Instruction::Persist { object, device } => {
                let id = binding(bindings, *object)?.id();
                self.tracker
                    .get_mut(id)?
                    .device_state_mut(*device)
                    .set_locked(true);
                Ok(())
            }
            Instruction::Barrier { device } => {
                let backend = self.runtime.backend_for(*device)?;
                backend.await_all(*device, self.runtime.config().barrier_timeout)
            }
            Instruction::Deallocate { object, device } => {
                let id = binding(bindings, *object)?.id();
                self.deallocate(id, *device)
            }
        }
    }

    fn buffer(&self, object: ObjectId, device: DeviceId) -> ForgeResult<BufferHandle> {
        self.tracker
            .get(object)
            .and_then(|state| state.device_state(device))
            .and_then(|ds| ds.buffer().copied())
            .ok_or_else(|| {
                internal_error!("{} has no buffer on {}", object, device)
            })
    }

    /// Make sure `object` has a buffer of at least `size` bytes on `device`
    fn ensure_buffer(&mut self, object: ObjectId, device: DeviceId, size: usize) -> ForgeResult<()> {
        let existing = self
            .tracker
            .get(object)
            .and_then(|state| state.device_state(device))
            .and_then(|ds| ds.buffer().copied());

        if let Some(handle) = existing {
            if handle.capacity >= size {
                if handle.size != size {
                    self.tracker
                        .get_mut(object)?
                        .device_state_mut(device)
                        .set_buffer(BufferHandle { size, ..handle });
                    self.adjust_allocated(device, handle.size, size);
                }
                return Ok(());
            }
            self.tracker
                .get_mut(object)?
                .device_state_mut(device)
                .set_locked(false);
            self.deallocate(object, device)?;
        }

        if let Some(limit) = self.memory_limit {
            let used = self.allocated_bytes(device);
            if used + size > limit {
                return Err(TaskForgeError::OutOfMemory {
                    device,
                    requested: size,
                    available: limit.saturating_sub(used),
                });
            }
        }

        let handle = self.runtime.buffers().allocate(device, size)?;
        *self.allocated.entry(device).or_insert(0) += size;
        self.tracker
            .get_mut(object)?
            .device_state_mut(device)
            .set_buffer(handle);
        tracing::trace!(
            object = %object,
            device = %device,
            offset = handle.offset,
            size,
            "buffer materialised"
        );
        Ok(())
    }

    fn adjust_allocated(&mut self, device: DeviceId, old: usize, new: usize) {
        let entry = self.allocated.entry(device).or_insert(0);
        *entry = entry.saturating_sub(old) + new;
    }

    fn deallocate(&mut self, object: ObjectId, device: DeviceId) -> ForgeResult<()> {
        let state = self.tracker.get_mut(object)?.device_state_mut(device);
        if state.is_locked() {
            return Ok(());
        }
        if let Some(handle) = state.take_buffer() {
            self.runtime.buffers().release(&handle)?;
            self.adjust_allocated(device, handle.size, 0);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn record_event(
        &mut self,
        backend: &Arc<dyn DeviceBackend>,
        kind: ProfileEventKind,
        label: String,
        device: DeviceId,
        bytes: usize,
        event: EventId,
        profile: bool,
    ) {
        let timing = backend.event_timing(device, event).unwrap_or_default();
        if profile {
            let elapsed = timing.elapsed_ns();
            match kind {
                ProfileEventKind::CopyIn => {
                    self.profiler.add(ProfilerType::CopyInTime, elapsed);
                    self.profiler.add(ProfilerType::TotalCopyInSizeBytes, bytes as u64);
                }
                ProfileEventKind::CopyOut => {
                    self.profiler.add(ProfilerType::CopyOutTime, elapsed);
                    self.profiler.add(ProfilerType::TotalCopyOutSizeBytes, bytes as u64);
                }
                ProfileEventKind::Launch => {
                    self.profiler.add(ProfilerType::TotalKernelTime, elapsed);
                    self.profiler.add_task(&label, ProfilerType::KernelTime, elapsed);
                }
            }
        }
        self.events.push(ProfileEvent {
            kind,
            label,
            device,
            bytes,
            timing,
            invocation: self.executions,
        });
    }

    fn copy_in(
        &mut self,
        object: &LogicalObject,
        device: DeviceId,
        mode: DataTransferMode,
        offset: usize,
        size: Option<usize>,
        profile: bool,
    ) -> ForgeResult<()> {
        let id = object.id();
        let handle = self.buffer(id, device)?;

        if mode == DataTransferMode::FirstExecution {
            let resident = self
                .tracker
                .get(id)
                .and_then(|state| state.device_state(device))
                .map(|ds| ds.is_valid() && !ds.is_first_execution())
                .unwrap_or(false);
            if resident {
                tracing::trace!(object = %id, device = %device, "copy-in skipped, already resident");
                return Ok(());
            }
        }

        let len = match size {
            Some(len) => len,
            None => object.byte_size()?,
        };
        if len > handle.size {
            return Err(TaskForgeError::InternalError(format!(
                "copy of {} bytes into {}-byte buffer of {}",
                len, handle.size, id
            )));
        }

        let backend = self.runtime.backend_for(device)?.clone();
        let event = object.read_bytes(|host| -> ForgeResult<EventId> {
            let slice = host.get(offset..offset + len).ok_or_else(|| {
                TaskForgeError::InternalError(format!(
                    "host range {}..{} outside {}",
                    offset,
                    offset + len,
                    id
                ))
            })?;
            backend.enqueue_copy_in(device, handle.region, handle.offset, slice)
        })??;

        self.tracker.get_mut(id)?.record_copy_in(device);
        self.record_event(&backend, ProfileEventKind::CopyIn, id.to_string(), device, len, event, profile);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_out(
        &mut self,
        object: &LogicalObject,
        device: DeviceId,
        mode: DataTransferMode,
        offset: usize,
        size: Option<usize>,
        blocking: bool,
        profile: bool,
    ) -> ForgeResult<()> {
        let id = object.id();
        if mode == DataTransferMode::FirstExecution
            && self.tracker.get(id).map(|s| s.first_copy_out_done()).unwrap_or(false)
        {
            tracing::trace!(object = %id, "copy-out skipped, already delivered");
            return Ok(());
        }

        let handle = self.buffer(id, device)?;
        let len = match size {
            Some(len) => len,
            None => object.byte_size()?,
        };
        if len > handle.size {
            return Err(TaskForgeError::InternalError(format!(
                "copy of {} bytes out of {}-byte buffer of {}",
                len, handle.size, id
            )));
        }

        let backend = self.runtime.backend_for(device)?.clone();
        let event = object.write_bytes(|host| -> ForgeResult<EventId> {
            let slice = host.get_mut(offset..offset + len).ok_or_else(|| {
                TaskForgeError::InternalError(format!(
                    "host range {}..{} outside {}",
                    offset,
                    offset + len,
                    id
                ))
            })?;
            backend.enqueue_copy_out(device, handle.region, handle.offset, slice)
        })??;
        if blocking {
            backend.await_all(device, self.runtime.config().barrier_timeout)?;
        }

        let state = self.tracker.get_mut(id)?;
        state.record_copy_out(device);
        if mode == DataTransferMode::FirstExecution {
            state.set_first_copy_out_done();
        }
        self.record_event(&backend, ProfileEventKind::CopyOut, id.to_string(), device, len, event, profile);
        Ok(())
    }

    /// Cached kernel for `task` on `device`, compiling on first use
    fn kernel_for(
        &mut self,
        graph: &ImmutableTaskGraph,
        bindings: &[LogicalObject],
        task: usize,
        device: DeviceId,
        profile: bool,
    ) -> ForgeResult<CompiledKernel> {
        let spec = graph
            .tasks()
            .get(task)
            .ok_or_else(|| internal_error!("task index {} out of range", task))?;
        let miss = !self.kernels.contains(&spec.name, device);
        let info = self.runtime.device(device)?.clone();
        let backend = self.runtime.backend_for(device)?;
        let flags = self.compiler_flags.get(backend.name()).map(str::to_string);
        let compiler = self.runtime.compiler().clone();
        let shapes = graph.argument_shapes(task, bindings)?;

        let mut timer = KernelTimer::for_phase(spec.name.as_str());
        timer.start();
        let kernel = self.kernels.get_or_compile(&spec.name, device, || {
            compiler.compile(&spec.descriptor, &shapes, &info, flags.as_deref())
        })?;
        timer.stop();

        if profile && miss {
            let elapsed = timer.elapsed_ns().unwrap_or(0);
            self.profiler.add(ProfilerType::CompileTime, elapsed);
            self.profiler.add_task(&spec.name, ProfilerType::TaskCompileTime, elapsed);
        }
        Ok(kernel)
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &mut self,
        graph: &ImmutableTaskGraph,
        bindings: &[LogicalObject],
        plan: &CompiledPlan,
        task: usize,
        device: DeviceId,
        args: &[ArgRef],
        element_offset: usize,
        threads: usize,
        chunk_bytes: Option<usize>,
        profile: bool,
    ) -> ForgeResult<()> {
        let kernel = self.kernel_for(graph, bindings, task, device, profile)?;
        let spec = graph
            .tasks()
            .get(task)
            .ok_or_else(|| internal_error!("task index {} out of range", task))?;

        let mut launch_args = Vec::with_capacity(args.len());
        let mut written = Vec::new();
        for (arg, declared) in args.iter().zip(&spec.args) {
            match (*arg, declared) {
                (ArgRef::Object(index), TaskArgument::Object { access, .. }) => {
                    let id = binding(bindings, index)?.id();
                    let handle = self.buffer(id, device)?;
                    let size = match chunk_bytes {
                        Some(bytes) if plan.metadata().is_batched(index) => bytes,
                        _ => handle.size,
                    };
                    launch_args.push(LaunchArg::Buffer {
                        region: handle.region,
                        offset: handle.offset,
                        size,
                        writable: access.writes(),
                    });
                    if access.writes() {
                        written.push(id);
                    }
                }
                (ArgRef::Constant(index), _) => {
                    let value = graph.constants().get(index).copied().ok_or_else(|| {
                        internal_error!("constant index {} out of range", index)
                    })?;
                    launch_args.push(LaunchArg::Scalar(value));
                }
                (ArgRef::Object(index), TaskArgument::Constant(_)) => {
                    return Err(TaskForgeError::InternalError(format!(
                        "task '{}' argument for object {} is declared as a constant",
                        spec.name, index
                    )));
                }
            }
        }

        let grid = plan
            .metadata()
            .task_grids
            .get(task)
            .map(|grid| grid.with_threads(threads))
            .ok_or_else(|| internal_error!("no grid for task '{}'", spec.name))?;

        let backend = self.runtime.backend_for(device)?.clone();
        let event = backend.enqueue_launch(device, &kernel, &grid, element_offset, &launch_args)?;
        for id in written {
            self.tracker.get_mut(id)?.record_write(device);
        }
        tracing::debug!(
            task = %spec.name,
            device = %device,
            grid = %grid,
            element_offset,
            "kernel launched"
        );
        self.record_event(&backend, ProfileEventKind::Launch, spec.name.clone(), device, 0, event, profile);
        Ok(())
    }

    /// Compile every kernel and materialise every buffer of `plan` without
    /// moving data or launching.
    pub fn warm_up(
        &mut self,
        graph: &ImmutableTaskGraph,
        bindings: &[LogicalObject],
        plan: &CompiledPlan,
    ) -> ForgeResult<()> {
        self.ensure_usable()?;
        self.resolve_all(bindings)?;
        self.drop_stale_buffers()?;
        for instruction in plan.instructions() {
            match instruction {
                Instruction::Allocate { .. } => {
                    self.dispatch(graph, bindings, plan, instruction, false)?
                }
                Instruction::Launch { task, device, .. } => {
                    self.kernel_for(graph, bindings, *task, *device, false)?;
                }
                _ => {}
            }
        }
        tracing::debug!(
            graph = %graph.name(),
            kernels = self.kernels.len(),
            "plan warmed up"
        );
        Ok(())
    }

    /// Copy `objects` (binding indices) back from the device that holds
    /// their latest value, for outputs the plan does not copy back itself.
    pub fn transfer_to_host(&mut self, bindings: &[LogicalObject], objects: &[usize]) -> ForgeResult<()> {
        self.ensure_usable()?;
        self.drop_stale_buffers()?;
        for &index in objects {
            let object = binding(bindings, index)?;
            let id = object.id();
            let state = self.tracker.get(id).ok_or(TaskForgeError::ObjectNotFound(id.0))?;
            let source = state
                .owner()
                .filter(|owner| state.device_state(*owner).map(|ds| ds.is_valid()).unwrap_or(false))
                .or_else(|| {
                    state
                        .devices()
                        .find(|(_, ds)| ds.is_valid() && ds.has_buffer())
                        .map(|(device, _)| *device)
                })
                .ok_or_else(|| {
                    config_error!("{} has no valid device copy", id)
                })?;
            self.copy_out(object, source, DataTransferMode::EveryExecution, 0, None, true, false)?;
        }
        Ok(())
    }

    /// Copy back every object whose exclusive owner holds data newer than
    /// the host
    pub fn write_back_dirty(&mut self, bindings: &[LogicalObject]) -> ForgeResult<usize> {
        let mut copied = 0;
        for object in bindings {
            let Some(owner) = self.tracker.get(object.id()).and_then(|s| s.dirty_owner()) else {
                continue;
            };
            tracing::warn!(object = %object.id(), device = %owner, "writing back unconsumed device result");
            self.copy_out(object, owner, DataTransferMode::EveryExecution, 0, None, true, false)?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Move the plan's objects off their current devices: write back dirty
    /// results, then release every buffer so the next execution
    /// re-materialises (FIRST_EXECUTION transfers included).
    pub fn migrate(&mut self, bindings: &[LogicalObject]) -> ForgeResult<()> {
        if !self.poisoned {
            self.write_back_dirty(bindings)?;
        }
        self.tracker.release_all(self.runtime.buffers())?;
        self.allocated.clear();
        tracing::info!(objects = self.tracker.len(), "plan state invalidated for migration");
        Ok(())
    }

    /// Release every buffer this engine holds
    pub fn free_device_memory(&mut self) -> ForgeResult<()> {
        self.tracker.release_all(self.runtime.buffers())?;
        self.allocated.clear();
        Ok(())
    }

    /// Reset `devices`: drop queued work and the device heaps, forget the
    /// buffers that lived there and make the engine usable again.
    pub fn reset(&mut self, devices: &[DeviceId]) -> ForgeResult<()> {
        for device in devices {
            self.runtime.backend_for(*device)?.reset(*device)?;
            self.runtime.buffers().discard_heap(*device)?;
            self.tracker.forget_buffers(*device);
            self.kernels.invalidate_device(*device);
            self.allocated.remove(device);
        }
        self.poisoned = false;
        self.transition(EngineState::Idle)?;
        tracing::info!(devices = devices.len(), "devices reset");
        Ok(())
    }

    /// Prepare for a retry with smaller batches after running out of memory
    pub fn recover_after_oom(&mut self) -> ForgeResult<()> {
        self.free_device_memory()?;
        self.poisoned = false;
        self.transition(EngineState::Idle)
    }

    /// Move the state tracked for `old` to `new`
    pub fn rebind(&mut self, old: ObjectId, new: ObjectId) {
        self.tracker.rebind(old, new);
    }
}

impl Drop for Interpreter {
    fn drop(&mut self) {
        if let Err(err) = self.tracker.release_all(self.runtime.buffers()) {
            tracing::warn!(error = %err, "failed to release plan buffers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::graph::{TaskArg, TaskGraph};
    use crate::kernel::{HostKernelCompiler, KernelCompiler, TaskDescriptor};
    use crate::plan::{DeviceAssignment, PlanCompiler};
    use crate::runtime::RuntimeConfig;

    fn runtime(memory: usize, config: RuntimeConfig) -> (Arc<HostBackend>, Arc<RuntimeContext>) {
        let backend = Arc::new(HostBackend::new(0, 2, memory));
        let compiler = HostKernelCompiler::new()
            .with_kernel("add", |inv| {
                let a = inv.read::<f32>(0)?;
                let b = inv.read::<f32>(1)?;
                inv.update::<f32>(2, |i, c| *c = a[i] + b[i])
            })
            .with_kernel("double", |inv| inv.update::<f32>(0, |_, v| *v *= 2.0))
            .with_kernel("fail", |_| Err("device fault".to_string()));
        let runtime = RuntimeContext::init(
            config,
            vec![backend.clone() as Arc<dyn DeviceBackend>],
            Arc::new(compiler) as Arc<dyn KernelCompiler>,
        )
        .unwrap();
        (backend, runtime)
    }

    fn compile(runtime: &RuntimeContext, graph: &ImmutableTaskGraph) -> CompiledPlan {
        let assignment = DeviceAssignment::new(runtime.default_device());
        PlanCompiler::new(graph, graph.objects(), runtime.devices(), &assignment)
            .compile()
            .unwrap()
    }

    fn add_graph(n: usize) -> (ImmutableTaskGraph, LogicalObject) {
        let a = LogicalObject::filled(1.0f32, &[n]);
        let b = LogicalObject::filled(2.0f32, &[n]);
        let c = LogicalObject::filled(0.0f32, &[n]);
        let graph = TaskGraph::new("s0")
            .transfer_to_device(DataTransferMode::FirstExecution, &[&a, &b])
            .task(
                "t0",
                TaskDescriptor::new("add"),
                [TaskArg::read(&a), TaskArg::read(&b), TaskArg::write(&c)],
            )
            .transfer_to_host(DataTransferMode::EveryExecution, &[&c])
            .snapshot()
            .unwrap();
        (graph, c)
    }

    #[test]
    fn test_execute_runs_plan() {
        let (backend, runtime) = runtime(1 << 20, RuntimeConfig::default());
        let (graph, c) = add_graph(64);
        let plan = compile(&runtime, &graph);
        let mut engine = Interpreter::new(runtime);

        engine.execute(&graph, graph.objects(), &plan, false).unwrap();
        assert_eq!(engine.state(), EngineState::Completed);
        assert_eq!(c.to_vec::<f32>().unwrap(), vec![3.0; 64]);
        assert_eq!(backend.stats().unwrap().launch_count, 1);
    }

    #[test]
    fn test_first_execution_copies_once() {
        let (backend, runtime) = runtime(1 << 20, RuntimeConfig::default());
        let (graph, _) = add_graph(16);
        let plan = compile(&runtime, &graph);
        let mut engine = Interpreter::new(runtime);

        engine.execute(&graph, graph.objects(), &plan, false).unwrap();
        engine.execute(&graph, graph.objects(), &plan, false).unwrap();
        assert_eq!(backend.stats().unwrap().copy_in_count, 2);
        assert_eq!(engine.executions(), 2);
    }

    #[test]
    fn test_profile_events_recorded() {
        let (_backend, runtime) = runtime(1 << 20, RuntimeConfig::default());
        let (graph, _) = add_graph(16);
        let plan = compile(&runtime, &graph);
        let mut engine = Interpreter::new(runtime);

        engine.execute(&graph, graph.objects(), &plan, true).unwrap();
        let kinds: Vec<ProfileEventKind> = engine.profiles().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ProfileEventKind::CopyIn,
                ProfileEventKind::CopyIn,
                ProfileEventKind::Launch,
                ProfileEventKind::CopyOut
            ]
        );
        let profiler = engine.time_profiler();
        assert_eq!(profiler.get(ProfilerType::TotalCopyInSizeBytes), 128);
        assert_eq!(profiler.get(ProfilerType::TotalCopyOutSizeBytes), 64);

        engine.clear_profiles();
        assert!(engine.profiles().is_empty());
        assert!(engine.time_profiler().is_empty());
    }

    #[test]
    fn test_device_fault_poisons() {
        let (_backend, runtime) = runtime(1 << 20, RuntimeConfig::default());
        let a = LogicalObject::filled(1.0f32, &[8]);
        let graph = TaskGraph::new("s0")
            .transfer_to_device(DataTransferMode::EveryExecution, &[&a])
            .task("t0", TaskDescriptor::new("fail"), [TaskArg::read_write(&a)])
            .snapshot()
            .unwrap();
        let plan = compile(&runtime, &graph);
        let mut engine = Interpreter::new(runtime.clone());

        let err = engine.execute(&graph, graph.objects(), &plan, false).unwrap_err();
        assert!(matches!(err, TaskForgeError::ExecutionFailure(_)));
        assert_eq!(engine.state(), EngineState::Failed);
        assert!(engine.is_poisoned());

        let err = engine.execute(&graph, graph.objects(), &plan, false).unwrap_err();
        assert!(matches!(err, TaskForgeError::PlanUnusable));

        engine.reset(&[runtime.default_device()]).unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(!engine.is_poisoned());
    }

    #[test]
    fn test_memory_limit() {
        let (backend, runtime) = runtime(1 << 20, RuntimeConfig::default());
        let (graph, _) = add_graph(256);
        let plan = compile(&runtime, &graph);
        let mut engine = Interpreter::new(runtime);
        engine.set_memory_limit(Some(2048));

        let err = engine.execute(&graph, graph.objects(), &plan, false).unwrap_err();
        assert!(matches!(err, TaskForgeError::OutOfMemory { .. }));
        assert_eq!(backend.stats().unwrap().launch_count, 0);
    }

    #[test]
    fn test_warm_up_compiles_and_allocates() {
        let (backend, runtime) = runtime(1 << 20, RuntimeConfig::default());
        let (graph, _) = add_graph(16);
        let plan = compile(&runtime, &graph);
        let mut engine = Interpreter::new(runtime.clone());

        engine.warm_up(&graph, graph.objects(), &plan).unwrap();
        assert_eq!(engine.stats().kernels.entries, 1);
        assert_eq!(engine.allocated_bytes(runtime.default_device()), 64 * 3);
        assert_eq!(backend.stats().unwrap().launch_count, 0);
    }

    #[test]
    fn test_migrate_writes_back_dirty() {
        let (_backend, runtime) = runtime(1 << 20, RuntimeConfig::default());
        let a = LogicalObject::filled(1.0f32, &[8]);
        let graph = TaskGraph::new("s0")
            .transfer_to_device(DataTransferMode::FirstExecution, &[&a])
            .task("t0", TaskDescriptor::new("double"), [TaskArg::read_write(&a)])
            .persist_on_device(&[&a])
            .snapshot()
            .unwrap();
        let plan = compile(&runtime, &graph);
        let mut engine = Interpreter::new(runtime);

        engine.execute(&graph, graph.objects(), &plan, false).unwrap();
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![1.0; 8]);

        engine.migrate(graph.objects()).unwrap();
        assert_eq!(a.to_vec::<f32>().unwrap(), vec![2.0; 8]);
        let state = engine.tracker().get(a.id()).unwrap();
        assert!(state.devices().all(|(_, ds)| !ds.has_buffer() && ds.is_first_execution()));
    }

    #[test]
    fn test_invalid_transition() {
        let (_backend, runtime) = runtime(1 << 20, RuntimeConfig::default());
        let mut engine = Interpreter::new(runtime);
        let err = engine.transition(EngineState::Completed).unwrap_err();
        assert!(matches!(err, TaskForgeError::InvalidStateTransition { .. }));
    }
}
