//! Execution plan façade
//!
//! An [`ExecutionPlan`] owns one snapshot of a task graph, the configuration
//! attached to it (devices, grids, batching, profiler, compiler flags) and
//! the engine that replays the compiled plan on every [`ExecutionPlan::execute`].
//!
//! ```ignore
//! let graph = TaskGraph::new("s0")
//!     .transfer_to_device(DataTransferMode::FirstExecution, &[&a, &b])
//!     .task("t0", TaskDescriptor::new("vector_add"),
//!           [TaskArg::read(&a), TaskArg::read(&b), TaskArg::write(&c)])
//!     .transfer_to_host(DataTransferMode::EveryExecution, &[&c])
//!     .snapshot()?;
//!
//! let mut plan = ExecutionPlan::new(&runtime, graph)?;
//! plan.with_profiler().with_batch("64MB")?;
//! let result = plan.execute()?;
//! ```

use std::sync::{Arc, Mutex};

use crate::backend::DeviceId;
use crate::engine::{EngineState, EngineStats, Interpreter};
use crate::error::{ForgeResult, TaskForgeError};
use crate::graph::ImmutableTaskGraph;
use crate::kernel::GridScheduler;
use crate::memory::parse_size;
use crate::object::LogicalObject;
use crate::plan::{CompiledPlan, DeviceAssignment, PlanCompiler};
use crate::profiling::{ProfileEvent, ProfilerType, TimeProfiler};
use crate::runtime::RuntimeContext;

/// A frozen task graph bound to a runtime, compiled on demand and replayed
/// on every [`ExecutionPlan::execute`]
pub struct ExecutionPlan {
    runtime: Arc<RuntimeContext>,
    graph: ImmutableTaskGraph,
    bindings: Vec<LogicalObject>,
    assignment: DeviceAssignment,
    grids: Option<GridScheduler>,
    batch_bytes: Option<usize>,
    profiler_enabled: bool,
    compiled: Option<Arc<CompiledPlan>>,
    engine: Arc<Mutex<Interpreter>>,
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("graph", &self.graph.name())
            .field("assignment", &self.assignment)
            .field("batch_bytes", &self.batch_bytes)
            .field("profiler_enabled", &self.profiler_enabled)
            .field("compiled", &self.compiled.is_some())
            .finish()
    }
}

impl ExecutionPlan {
    pub fn new(runtime: &Arc<RuntimeContext>, graph: ImmutableTaskGraph) -> ForgeResult<Self> {
        runtime.ensure_active()?;
        let bindings = graph.objects().to_vec();
        Ok(Self {
            runtime: runtime.clone(),
            assignment: DeviceAssignment::new(runtime.default_device()),
            graph,
            bindings,
            grids: None,
            batch_bytes: None,
            profiler_enabled: runtime.config().profiler_enabled,
            compiled: None,
            engine: Arc::new(Mutex::new(Interpreter::new(runtime.clone()))),
        })
    }

    pub fn graph(&self) -> &ImmutableTaskGraph {
        &self.graph
    }

    /// Objects the plan currently operates on, in graph order
    pub fn bindings(&self) -> &[LogicalObject] {
        &self.bindings
    }

    pub fn batch_bytes(&self) -> Option<usize> {
        self.batch_bytes
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.assignment.devices()
    }

    /// Enable batching with slices of at most `size` (e.g. "512MB")
    pub fn with_batch(&mut self, size: &str) -> ForgeResult<&mut Self> {
        let bytes = parse_size(size)?;
        self.with_batch_bytes(bytes)
    }

    pub fn with_batch_bytes(&mut self, bytes: usize) -> ForgeResult<&mut Self> {
        if bytes == 0 {
            return Err(TaskForgeError::InvalidBatchSize("batch size must be positive".to_string()));
        }
        self.batch_bytes = Some(bytes);
        self.compiled = None;
        Ok(self)
    }

    pub fn without_batch(&mut self) -> &mut Self {
        self.batch_bytes = None;
        self.compiled = None;
        self
    }

    pub fn with_grid_scheduler(&mut self, grids: GridScheduler) -> &mut Self {
        self.grids = Some(grids);
        self.compiled = None;
        self
    }

    /// Flags handed to the kernel compiler for devices of `backend`
    pub fn with_compiler_flags(&mut self, backend: &str, flags: &str) -> ForgeResult<&mut Self> {
        self.engine.lock()?.set_compiler_flags(backend, flags);
        Ok(self)
    }

    pub fn with_profiler(&mut self) -> &mut Self {
        self.profiler_enabled = true;
        self
    }

    pub fn without_profiler(&mut self) -> &mut Self {
        self.profiler_enabled = false;
        self
    }

    /// Cap the device bytes this plan may hold per device (e.g. "1GB")
    pub fn with_memory_limit(&mut self, limit: &str) -> ForgeResult<&mut Self> {
        let bytes = parse_size(limit)?;
        self.engine.lock()?.set_memory_limit(Some(bytes));
        Ok(self)
    }

    pub fn without_memory_limit(&mut self) -> ForgeResult<&mut Self> {
        self.engine.lock()?.set_memory_limit(None);
        Ok(self)
    }

    /// Run every task on `device`. Results still on the old devices are
    /// written back first; the next execution re-materialises everything.
    pub fn with_device(&mut self, device: DeviceId) -> ForgeResult<&mut Self> {
        self.runtime.device(device)?;
        if self.assignment.devices() != [device] {
            self.engine.lock()?.migrate(&self.bindings)?;
            tracing::info!(graph = %self.graph.name(), device = %device, "plan mapped to device");
        }
        self.assignment.map_all_to(device);
        self.compiled = None;
        Ok(self)
    }

    pub fn map_all_to(&mut self, device: DeviceId) -> ForgeResult<&mut Self> {
        self.with_device(device)
    }

    /// Run task `task` on `device`
    pub fn with_task_device(&mut self, task: &str, device: DeviceId) -> ForgeResult<&mut Self> {
        if self.graph.task_index(task).is_none() {
            return Err(TaskForgeError::InvalidConfiguration(format!(
                "graph '{}' has no task '{}'",
                self.graph.name(),
                task
            )));
        }
        self.runtime.device(device)?;
        if self.assignment.device_for(task) != device {
            self.engine.lock()?.migrate(&self.bindings)?;
        }
        self.assignment.set_task(task, device);
        self.compiled = None;
        Ok(self)
    }

    /// Compile kernels and materialise buffers now instead of on the first
    /// execution
    pub fn with_warm_up(&mut self) -> ForgeResult<&mut Self> {
        let plan = self.compiled_plan()?;
        self.engine.lock()?.warm_up(&self.graph, &self.bindings, &plan)?;
        Ok(self)
    }

    /// The compiled plan for the current configuration
    pub fn compiled_plan(&mut self) -> ForgeResult<Arc<CompiledPlan>> {
        if let Some(plan) = &self.compiled {
            return Ok(plan.clone());
        }
        let plan = PlanCompiler::new(
            &self.graph,
            &self.bindings,
            self.runtime.devices(),
            &self.assignment,
        )
        .with_grids(self.grids.as_ref())
        .with_batch(self.batch_bytes)
        .compile()?;
        if self.runtime.config().print_bytecodes {
            tracing::info!(graph = %self.graph.name(), "plan bytecodes\n{}", plan.disassemble());
        }
        let plan = Arc::new(plan);
        self.compiled = Some(plan.clone());
        Ok(plan)
    }

    /// Run the plan once.
    ///
    /// With batching enabled an out-of-memory failure is retried with half
    /// the batch size until `min_batch_bytes` is reached.
    pub fn execute(&mut self) -> ForgeResult<ExecutionResult> {
        self.runtime.ensure_active()?;
        loop {
            let plan = self.compiled_plan()?;
            let outcome = self
                .engine
                .lock()?
                .execute(&self.graph, &self.bindings, &plan, self.profiler_enabled);

            match outcome {
                Ok(()) => return self.result(),
                Err(err @ TaskForgeError::OutOfMemory { .. }) => {
                    let Some(current) = self.batch_bytes else {
                        return Err(err);
                    };
                    let floor = self.runtime.config().min_batch_bytes;
                    if current <= floor {
                        return Err(err);
                    }
                    let next = (current / 2).max(floor);
                    tracing::warn!(
                        graph = %self.graph.name(),
                        from = current,
                        to = next,
                        error = %err,
                        "out of device memory, retrying with a smaller batch"
                    );
                    self.engine.lock()?.recover_after_oom()?;
                    self.batch_bytes = Some(next);
                    self.compiled = None;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn result(&self) -> ForgeResult<ExecutionResult> {
        let profiler = self.engine.lock()?.time_profiler().clone();
        Ok(ExecutionResult {
            engine: self.engine.clone(),
            bindings: self.bindings.clone(),
            profiler,
            profiler_enabled: self.profiler_enabled,
        })
    }

    /// Swap `old` for `new` without recompiling. Both must have the same
    /// shape, and `new` must not already be bound in this plan.
    pub fn update_data(&mut self, old: &LogicalObject, new: &LogicalObject) -> ForgeResult<()> {
        let index = self
            .bindings
            .iter()
            .position(|b| b.id() == old.id())
            .ok_or(TaskForgeError::ObjectNotFound(old.id().0))?;
        if new.id() == old.id() {
            return Ok(());
        }
        if self.bindings.iter().any(|b| b.id() == new.id()) {
            return Err(TaskForgeError::InvalidConfiguration(format!(
                "{} is already bound in graph '{}'",
                new.id(),
                self.graph.name()
            )));
        }
        let expected = old.shape()?;
        let found = new.shape()?;
        if expected != found {
            return Err(TaskForgeError::ShapeMismatch {
                object: old.id().0,
                expected: expected.to_string(),
                found: found.to_string(),
            });
        }
        self.engine.lock()?.rebind(old.id(), new.id());
        self.bindings[index] = new.clone();
        tracing::debug!(graph = %self.graph.name(), old = %old.id(), new = %new.id(), "object rebound");
        Ok(())
    }

    /// Release every device buffer held by this plan
    pub fn free_device_memory(&mut self) -> ForgeResult<()> {
        self.engine.lock()?.free_device_memory()
    }

    /// Reset every device this plan targets and make it usable again after
    /// a failure
    pub fn reset_device(&mut self) -> ForgeResult<()> {
        let devices = self.assignment.devices();
        self.engine.lock()?.reset(&devices)
    }

    pub fn profiles(&self) -> ForgeResult<Vec<ProfileEvent>> {
        Ok(self.engine.lock()?.profiles().to_vec())
    }

    pub fn clear_profiles(&mut self) -> ForgeResult<()> {
        self.engine.lock()?.clear_profiles();
        Ok(())
    }

    pub fn engine_state(&self) -> ForgeResult<EngineState> {
        Ok(self.engine.lock()?.state())
    }

    pub fn engine_stats(&self) -> ForgeResult<EngineStats> {
        Ok(self.engine.lock()?.stats())
    }
}

/// Outcome of one [`ExecutionPlan::execute`]
#[derive(Debug)]
pub struct ExecutionResult {
    engine: Arc<Mutex<Interpreter>>,
    bindings: Vec<LogicalObject>,
    profiler: TimeProfiler,
    profiler_enabled: bool,
}

impl ExecutionResult {
    /// Copy `objects` back from the device holding their latest value.
    /// Used for outputs declared with `DataTransferMode::UserManaged`.
    pub fn transfer_to_host(&self, objects: &[&LogicalObject]) -> ForgeResult<()> {
        let indices = objects
            .iter()
            .map(|object| {
                self.bindings
                    .iter()
                    .position(|b| b.id() == object.id())
                    .ok_or(TaskForgeError::ObjectNotFound(object.id().0))
            })
            .collect::<ForgeResult<Vec<usize>>>()?;
        self.engine.lock()?.transfer_to_host(&self.bindings, &indices)
    }

    pub fn is_profiler_enabled(&self) -> bool {
        self.profiler_enabled
    }

    pub fn profiler(&self) -> &TimeProfiler {
        &self.profiler
    }

    pub fn total_time(&self) -> u64 {
        self.profiler.get(ProfilerType::TotalTime)
    }

    pub fn total_kernel_time(&self) -> u64 {
        self.profiler.get(ProfilerType::TotalKernelTime)
    }

    pub fn task_kernel_time(&self, task: &str) -> u64 {
        self.profiler.task_value(task, ProfilerType::KernelTime)
    }

    pub fn profile_log(&self) -> ForgeResult<String> {
        self.profiler.profile_log()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceBackend, HostBackend};
    use crate::graph::{DataTransferMode, TaskArg, TaskGraph};
    use crate::kernel::{HostKernelCompiler, KernelCompiler, TaskDescriptor};
    use crate::object::ElementType;
    use crate::runtime::RuntimeConfig;

    fn runtime() -> Arc<RuntimeContext> {
        let compiler = HostKernelCompiler::new().with_kernel("inc", |inv| {
            inv.update::<i32>(0, |_, v| *v += 1)
        });
        RuntimeContext::init(
            RuntimeConfig::default(),
            vec![Arc::new(HostBackend::new(0, 2, 1 << 20)) as Arc<dyn DeviceBackend>],
            Arc::new(compiler) as Arc<dyn KernelCompiler>,
        )
        .unwrap()
    }

    fn inc_graph(a: &LogicalObject) -> ImmutableTaskGraph {
        TaskGraph::new("s0")
            .transfer_to_device(DataTransferMode::EveryExecution, &[a])
            .task("t0", TaskDescriptor::new("inc"), [TaskArg::read_write(a)])
            .transfer_to_host(DataTransferMode::EveryExecution, &[a])
            .snapshot()
            .unwrap()
    }

    #[test]
    fn test_execute_and_recompile_on_config_change() {
        let runtime = runtime();
        let a = LogicalObject::filled(1i32, &[32]);
        let mut plan = ExecutionPlan::new(&runtime, inc_graph(&a)).unwrap();

        let first = plan.compiled_plan().unwrap();
        assert!(Arc::ptr_eq(&first, &plan.compiled_plan().unwrap()));

        plan.execute().unwrap();
        assert_eq!(a.to_vec::<i32>().unwrap(), vec![2; 32]);

        plan.with_batch("64B").unwrap();
        assert!(!Arc::ptr_eq(&first, &plan.compiled_plan().unwrap()));
        plan.execute().unwrap();
        assert_eq!(a.to_vec::<i32>().unwrap(), vec![3; 32]);
    }

    #[test]
    fn test_batch_rejects_garbage() {
        let runtime = runtime();
        let a = LogicalObject::filled(1i32, &[4]);
        let mut plan = ExecutionPlan::new(&runtime, inc_graph(&a)).unwrap();
        assert!(matches!(
            plan.with_batch("lots").unwrap_err(),
            TaskForgeError::InvalidBatchSize(_)
        ));
        assert!(plan.with_batch_bytes(0).is_err());
    }

    #[test]
    fn test_update_data_requires_same_shape() {
        let runtime = runtime();
        let a = LogicalObject::filled(1i32, &[4]);
        let mut plan = ExecutionPlan::new(&runtime, inc_graph(&a)).unwrap();

        let wrong = LogicalObject::zeros(ElementType::I32, &[5]);
        assert!(matches!(
            plan.update_data(&a, &wrong).unwrap_err(),
            TaskForgeError::ShapeMismatch { .. }
        ));

        let stranger = LogicalObject::zeros(ElementType::I32, &[4]);
        assert!(matches!(
            plan.update_data(&stranger, &a).unwrap_err(),
            TaskForgeError::ObjectNotFound(_)
        ));
    }

    #[test]
    fn test_with_task_device_unknown_task() {
        let runtime = runtime();
        let a = LogicalObject::filled(1i32, &[4]);
        let mut plan = ExecutionPlan::new(&runtime, inc_graph(&a)).unwrap();
        assert!(plan.with_task_device("missing", DeviceId::new(0, 1)).is_err());
        assert!(matches!(
            plan.with_device(DeviceId::new(4, 0)).unwrap_err(),
            TaskForgeError::DeviceNotFound(_)
        ));
    }

    #[test]
    fn test_profiler_toggle() {
        let runtime = runtime();
        let a = LogicalObject::filled(1i32, &[16]);
        let mut plan = ExecutionPlan::new(&runtime, inc_graph(&a)).unwrap();

        let result = plan.execute().unwrap();
        assert!(!result.is_profiler_enabled());
        assert!(result.profiler().is_empty());

        let result = plan.with_profiler().execute().unwrap();
        assert!(result.is_profiler_enabled());
        assert_eq!(result.profiler().get(ProfilerType::TotalCopyInSizeBytes), 64);
        assert!(result.profile_log().unwrap().contains("TOTAL_TIME"));
    }
}
