//! Plan compiler.
//!
//! Lowers an [`ImmutableTaskGraph`] into a linear [`CompiledPlan`]:
//!
//! 1. Prologue: per device, a CONTEXT_SWITCH and one ALLOCATE for every
//!    object the device touches. All allocation happens here, so heap
//!    exhaustion surfaces before any LAUNCH.
//! 2. Body: a walk in dependency order emitting COPY_IN, LAUNCH and COPY_OUT,
//!    repeated per chunk when batching is enabled.
//! 3. BARRIER per device, then PERSIST and DEALLOCATE.

use std::collections::HashMap;

use crate::backend::{DeviceId, DeviceInfo};
use crate::error::{ForgeResult, TaskForgeError};
use crate::graph::{
    DataTransferMode, ImmutableTaskGraph, NodeId, NodeKind, TaskArgument, TaskSpec,
    TransferDirection,
};
use crate::internal_error;
use crate::kernel::{GridScheduler, WorkerGrid};
use crate::memory::{BatchChunk, BatchConfiguration};
use crate::object::LogicalObject;
use crate::plan::instruction::{ArgRef, Instruction};

/// Task to device mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAssignment {
    default: DeviceId,
    per_task: HashMap<String, DeviceId>,
}

impl DeviceAssignment {
    pub fn new(default: DeviceId) -> Self {
        Self {
            default,
            per_task: HashMap::new(),
        }
    }

    /// Map every task to `device`, dropping per-task overrides
    pub fn map_all_to(&mut self, device: DeviceId) {
        self.default = device;
        self.per_task.clear();
    }

    pub fn set_task(&mut self, task: impl Into<String>, device: DeviceId) {
        self.per_task.insert(task.into(), device);
    }

    pub fn default_device(&self) -> DeviceId {
        self.default
    }

    pub fn device_for(&self, task: &str) -> DeviceId {
        self.per_task.get(task).copied().unwrap_or(self.default)
    }

    /// Every device this assignment can target
    pub fn devices(&self) -> Vec<DeviceId> {
        let mut devices = vec![self.default];
        for device in self.per_task.values() {
            if !devices.contains(device) {
                devices.push(*device);
            }
        }
        devices
    }
}

/// Side tables produced alongside the instruction list
#[derive(Debug, Clone, PartialEq)]
pub struct PlanMetadata {
    pub graph_name: String,
    /// Devices in order of first use
    pub devices: Vec<DeviceId>,
    pub task_names: Vec<String>,
    pub task_devices: Vec<DeviceId>,
    pub task_grids: Vec<WorkerGrid>,
    /// Devices each object is materialised on, home device first
    pub object_devices: Vec<Vec<DeviceId>>,
    pub input_modes: Vec<Option<DataTransferMode>>,
    pub output_modes: Vec<Option<DataTransferMode>>,
    pub batch: Option<BatchConfiguration>,
    pub batched_objects: Vec<bool>,
}

impl PlanMetadata {
    pub fn is_batched(&self, object: usize) -> bool {
        self.batch.is_some() && self.batched_objects.get(object).copied().unwrap_or(false)
    }
}

/// Replayable instruction list
#[derive(Debug, Clone)]
pub struct CompiledPlan {
    instructions: Vec<Instruction>,
    metadata: PlanMetadata,
}

impl CompiledPlan {
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn metadata(&self) -> &PlanMetadata {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    pub fn launch_count(&self) -> usize {
        self.instructions.iter().filter(|i| i.is_launch()).count()
    }

    /// Human-readable listing of the plan
    pub fn disassemble(&self) -> String {
        let mut out = format!(
            "plan '{}': {} instructions on {} device(s)\n",
            self.metadata.graph_name,
            self.instructions.len(),
            self.metadata.devices.len()
        );
        for (index, instruction) in self.instructions.iter().enumerate() {
            let line = match instruction {
                Instruction::Launch { task, .. } => {
                    let name = self
                        .metadata
                        .task_names
                        .get(*task)
                        .map(String::as_str)
                        .unwrap_or("?");
                    format!("{} <{}>", instruction, name)
                }
                _ => instruction.to_string(),
            };
            out.push_str(&format!("{:4}: {}\n", index, line));
        }
        out
    }
}

/// Tracks the active device while emitting
struct Emitter {
    instructions: Vec<Instruction>,
    current: Option<DeviceId>,
}

impl Emitter {
    fn switch(&mut self, device: DeviceId) {
        if self.current != Some(device) {
            self.instructions.push(Instruction::ContextSwitch { device });
            self.current = Some(device);
        }
    }

    fn push(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }
}

fn push_unique(devices: &mut Vec<DeviceId>, device: DeviceId) {
    if !devices.contains(&device) {
        devices.push(device);
    }
}

/// Lowers an immutable task graph and its device assignment to a
/// [`CompiledPlan`]
pub struct PlanCompiler<'a> {
    graph: &'a ImmutableTaskGraph,
    bindings: &'a [LogicalObject],
    devices: &'a [DeviceInfo],
    assignment: &'a DeviceAssignment,
    grids: Option<&'a GridScheduler>,
    batch_bytes: Option<usize>,
}

impl<'a> PlanCompiler<'a> {
    pub fn new(
        graph: &'a ImmutableTaskGraph,
        bindings: &'a [LogicalObject],
        devices: &'a [DeviceInfo],
        assignment: &'a DeviceAssignment,
    ) -> Self {
        Self {
            graph,
            bindings,
            devices,
            assignment,
            grids: None,
            batch_bytes: None,
        }
    }

    pub fn with_grids(mut self, grids: Option<&'a GridScheduler>) -> Self {
        self.grids = grids;
        self
    }

    pub fn with_batch(mut self, batch_bytes: Option<usize>) -> Self {
        self.batch_bytes = batch_bytes;
        self
    }

    fn device_info(&self, device: DeviceId) -> ForgeResult<&DeviceInfo> {
        self.devices
            .iter()
            .find(|info| info.id == device)
            .ok_or_else(|| TaskForgeError::DeviceNotFound(device.to_string()))
    }

    fn binding(&self, object: usize) -> ForgeResult<&LogicalObject> {
        self.bindings.get(object).ok_or_else(|| {
            internal_error!("no binding for object index {}", object)
        })
    }

    /// One work item per element of the largest object argument
    fn default_threads(&self, task: &TaskSpec) -> ForgeResult<usize> {
        let mut threads = 1;
        for arg in &task.args {
            if let TaskArgument::Object { index, .. } = arg {
                threads = threads.max(self.binding(*index)?.shape()?.element_count());
            }
        }
        Ok(threads)
    }

    fn plan_batch(
        &self,
        batch_bytes: usize,
        devices: &[DeviceId],
        object_devices: &[Vec<DeviceId>],
        batched: &mut [bool],
    ) -> ForgeResult<Option<BatchConfiguration>> {
        if devices.len() > 1 {
            return Err(TaskForgeError::UnsupportedConfiguration(format!(
                "batched execution needs a single device, graph '{}' uses {}",
                self.graph.name(),
                devices.len()
            )));
        }

        let mut sizes = Vec::with_capacity(object_devices.len());
        for (object, on_devices) in object_devices.iter().enumerate() {
            if on_devices.is_empty() {
                sizes.push(None);
            } else {
                let binding = self.binding(object)?;
                sizes.push(Some((binding.byte_size()?, binding.element_type()?.size())));
            }
        }

        let largest = match sizes.iter().flatten().map(|(bytes, _)| *bytes).max() {
            Some(largest) => largest,
            None => return Ok(None),
        };

        let mut element_size = None;
        for (object, size) in sizes.iter().enumerate() {
            let Some((bytes, elem)) = size else { continue };
            if *bytes != largest {
                continue;
            }
            match element_size {
                None => element_size = Some(*elem),
                Some(expected) if expected != *elem => {
                    return Err(TaskForgeError::UnsupportedConfiguration(format!(
                        "batched objects of graph '{}' mix {}-byte and {}-byte elements",
                        self.graph.name(),
                        expected,
                        elem
                    )))
                }
                Some(_) => {}
            }
            if self.graph.is_persisted(object)
                || self.graph.output_mode(object) == Some(DataTransferMode::UserManaged)
            {
                return Err(TaskForgeError::UnsupportedConfiguration(format!(
                    "{} is batched and cannot stay on the device after execution",
                    self.binding(object)?.id()
                )));
            }
            batched[object] = true;
        }

        let element_size = element_size.unwrap_or(1);
        Ok(Some(BatchConfiguration::compute(largest, element_size, batch_bytes)?))
    }

    pub fn compile(&self) -> ForgeResult<CompiledPlan> {
        let graph = self.graph;
        let tasks = graph.tasks();
        let object_count = graph.objects().len();
        if self.bindings.len() != object_count {
            return Err(TaskForgeError::InternalError(format!(
                "graph '{}' has {} objects but {} bindings",
                graph.name(),
                object_count,
                self.bindings.len()
            )));
        }

        let mut task_devices = Vec::with_capacity(tasks.len());
        let mut task_grids = Vec::with_capacity(tasks.len());
        for task in tasks {
            let device = self.assignment.device_for(&task.name);
            let info = self.device_info(device)?;
            for capability in task.descriptor.requirements() {
                if !info.supports(*capability) {
                    return Err(TaskForgeError::UnsupportedConfiguration(format!(
                        "task '{}' requires {:?}, which {} ({}) lacks",
                        task.name, capability, device, info.name
                    )));
                }
            }
            task_devices.push(device);

            let grid = match self.grids.and_then(|g| g.get(&task.name)) {
                Some(grid) => *grid,
                None => WorkerGrid::new_1d(self.default_threads(task)?),
            };
            task_grids.push(grid);
        }

        // Node ids follow declaration order, which is topological and keeps
        // readers of a value ahead of its next writer
        graph.topological_order()?;
        let order: Vec<NodeId> = graph.nodes().iter().map(|n| n.id).collect();

        // Devices each object lives on, in order of first use
        let mut object_devices: Vec<Vec<DeviceId>> = vec![Vec::new(); object_count];
        let mut devices: Vec<DeviceId> = Vec::new();
        let mut on_device = vec![false; object_count];
        for id in &order {
            let Some(node) = graph.node(*id) else { continue };
            match &node.kind {
                NodeKind::Task { task } => {
                    let device = task_devices[*task];
                    push_unique(&mut devices, device);
                    for arg in &tasks[*task].args {
                        if let TaskArgument::Object { index, .. } = arg {
                            push_unique(&mut object_devices[*index], device);
                        }
                    }
                }
                NodeKind::Transfer { object, .. }
                | NodeKind::Allocate { object }
                | NodeKind::Persist { object } => on_device[*object] = true,
                _ => {}
            }
        }
        let default = self.assignment.default_device();
        for object in 0..object_count {
            if on_device[object] && object_devices[object].is_empty() {
                self.device_info(default)?;
                object_devices[object].push(default);
                push_unique(&mut devices, default);
            }
        }

        let mut batched = vec![false; object_count];
        let batch = match self.batch_bytes {
            Some(bytes) => self.plan_batch(bytes, &devices, &object_devices, &mut batched)?,
            None => None,
        };

        let metadata = PlanMetadata {
            graph_name: graph.name().to_string(),
            devices: devices.clone(),
            task_names: tasks.iter().map(|t| t.name.clone()).collect(),
            task_devices: task_devices.clone(),
            task_grids: task_grids.clone(),
            object_devices: object_devices.clone(),
            input_modes: (0..object_count).map(|o| graph.input_mode(o)).collect(),
            output_modes: (0..object_count).map(|o| graph.output_mode(o)).collect(),
            batch,
            batched_objects: batched.clone(),
        };

        if graph.is_empty() {
            return Ok(CompiledPlan {
                instructions: Vec::new(),
                metadata,
            });
        }

        let mut em = Emitter {
            instructions: Vec::new(),
            current: None,
        };

        for device in &devices {
            em.switch(*device);
            let objects: Vec<usize> = (0..object_count)
                .filter(|o| object_devices[*o].contains(device))
                .collect();
            if !objects.is_empty() {
                em.push(Instruction::Allocate {
                    device: *device,
                    objects,
                    batch_bytes: batch.map(|b| b.device_bytes()),
                });
            }
        }

        let chunks: Vec<Option<BatchChunk>> = match &batch {
            Some(config) => config.chunks().into_iter().map(Some).collect(),
            None => vec![None],
        };
        let element_size = batch.map(|b| b.element_size).unwrap_or(1);
        let range = |object: usize, chunk: Option<BatchChunk>| match chunk {
            Some(c) if batched[object] => (c.byte_offset, Some(c.byte_len)),
            _ => (0, None),
        };
        let home = |object: usize| object_devices[object].first().copied().unwrap_or(default);

        let mut location: Vec<Option<DeviceId>> = vec![None; object_count];
        for (chunk_index, chunk) in chunks.iter().copied().enumerate() {
            let first = chunk_index == 0;
            let last = chunk_index + 1 == chunks.len();

            for id in &order {
                let Some(node) = graph.node(*id) else { continue };
                match &node.kind {
                    NodeKind::Transfer {
                        object,
                        direction: TransferDirection::ToDevice,
                        mode,
                    } => {
                        let object = *object;
                        let device = home(object);
                        location[object] = Some(device);
                        let sliced = chunk.is_some() && batched[object];
                        if !sliced && !first {
                            continue;
                        }
                        let (offset, size) = range(object, chunk);
                        em.switch(device);
                        em.push(Instruction::CopyIn {
                            object,
                            device,
                            mode: if sliced { DataTransferMode::EveryExecution } else { *mode },
                            offset,
                            size,
                        });
                    }
                    NodeKind::Allocate { object } => location[*object] = Some(home(*object)),
                    NodeKind::Task { task } => {
                        let spec = &tasks[*task];
                        let device = task_devices[*task];
                        let touches_batched = chunk.is_some()
                            && spec.args.iter().any(|a| {
                                matches!(a, TaskArgument::Object { index, .. } if batched[*index])
                            });
                        if chunk.is_some() && !touches_batched && !first {
                            continue;
                        }

                        for arg in &spec.args {
                            let TaskArgument::Object { index, access } = *arg else { continue };
                            match location[index] {
                                Some(source) if source != device && access.reads() => {
                                    let (offset, size) = range(index, chunk);
                                    em.switch(source);
                                    em.push(Instruction::CopyOut {
                                        object: index,
                                        device: source,
                                        mode: DataTransferMode::EveryExecution,
                                        offset,
                                        size,
                                        blocking: true,
                                    });
                                    em.switch(device);
                                    em.push(Instruction::CopyIn {
                                        object: index,
                                        device,
                                        mode: DataTransferMode::EveryExecution,
                                        offset,
                                        size,
                                    });
                                    location[index] = Some(device);
                                }
                                _ if access.writes() => location[index] = Some(device),
                                _ => {}
                            }
                        }

                        let args = spec
                            .args
                            .iter()
                            .map(|a| match *a {
                                TaskArgument::Object { index, .. } => ArgRef::Object(index),
                                TaskArgument::Constant(c) => ArgRef::Constant(c),
                            })
                            .collect();
                        em.switch(device);
                        let grid = task_grids[*task];
                        let (element_offset, threads, chunk_bytes) = match chunk {
                            Some(c) if touches_batched => (
                                c.element_offset(element_size),
                                grid.with_threads(c.elements(element_size)).total_threads(),
                                Some(c.byte_len),
                            ),
                            _ => (0, grid.total_threads(), None),
                        };
                        em.push(Instruction::Launch {
                            task: *task,
                            device,
                            args,
                            element_offset,
                            threads,
                            chunk_bytes,
                        });
                    }
                    NodeKind::Transfer {
                        object,
                        direction: TransferDirection::ToHost,
                        mode,
                    } => {
                        let object = *object;
                        if *mode == DataTransferMode::UserManaged {
                            continue;
                        }
                        let sliced = chunk.is_some() && batched[object];
                        if !sliced && !last {
                            continue;
                        }
                        let device = location[object].unwrap_or_else(|| home(object));
                        let (offset, size) = range(object, chunk);
                        em.switch(device);
                        em.push(Instruction::CopyOut {
                            object,
                            device,
                            mode: if sliced { DataTransferMode::EveryExecution } else { *mode },
                            offset,
                            size,
                            blocking: false,
                        });
                    }
                    _ => {}
                }
            }

            if chunk.is_some() && !last {
                for device in &devices {
                    em.push(Instruction::Barrier { device: *device });
                }
            }
        }

        for device in &devices {
            em.push(Instruction::Barrier { device: *device });
        }

        for id in &order {
            let Some(node) = graph.node(*id) else { continue };
            match &node.kind {
                NodeKind::Persist { object } => {
                    for device in &object_devices[*object] {
                        em.push(Instruction::Persist {
                            object: *object,
                            device: *device,
                        });
                    }
                }
                NodeKind::Deallocate { object } => {
                    for device in &object_devices[*object] {
                        em.push(Instruction::Deallocate {
                            object: *object,
                            device: *device,
                        });
                    }
                }
                _ => {}
            }
        }

        let plan = CompiledPlan {
            instructions: em.instructions,
            metadata,
        };
        tracing::debug!(
            graph = %graph.name(),
            instructions = plan.len(),
            launches = plan.launch_count(),
            devices = plan.metadata.devices.len(),
            batched = plan.metadata.batch.is_some(),
            "plan compiled"
        );
        Ok(plan)
    }
}
