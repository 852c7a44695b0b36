//! Mutable task-graph builder.
//!
//! Operations are recorded in call order and only validated by
//! [`TaskGraph::snapshot`], which lowers them into the node IR of an
//! [`ImmutableTaskGraph`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{ForgeResult, TaskForgeError};
use crate::graph::immutable::{GraphInner, ImmutableTaskGraph};
use crate::graph::node::{NodeArena, NodeId, NodeKind, TransferDirection};
use crate::kernel::{Access, ScalarValue, TaskDescriptor};
use crate::object::{LogicalObject, ObjectId};

/// When a transfer happens across repeated executions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DataTransferMode {
    /// Only on the first execution (and after the object is invalidated)
    FirstExecution,
    EveryExecution,
    /// Only on explicit request through the execution result
    UserManaged,
}

/// Argument passed to [`TaskGraph::task`]
#[derive(Debug, Clone)]
pub enum TaskArg {
    Object(LogicalObject, Access),
    Scalar(ScalarValue),
}

impl TaskArg {
    pub fn read(object: &LogicalObject) -> Self {
        TaskArg::Object(object.clone(), Access::Read)
    }

    pub fn write(object: &LogicalObject) -> Self {
        TaskArg::Object(object.clone(), Access::Write)
    }

    pub fn read_write(object: &LogicalObject) -> Self {
        TaskArg::Object(object.clone(), Access::ReadWrite)
    }

    pub fn scalar(value: impl Into<ScalarValue>) -> Self {
        TaskArg::Scalar(value.into())
    }
}

/// Task argument after interning into the graph's tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskArgument {
    Object { index: usize, access: Access },
    Constant(usize),
}

#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub descriptor: TaskDescriptor,
    pub args: Vec<TaskArgument>,
}

#[derive(Debug, Clone)]
enum GraphOp {
    TransferToDevice {
        mode: DataTransferMode,
        objects: Vec<usize>,
    },
    Task(usize),
    TransferToHost {
        mode: DataTransferMode,
        objects: Vec<usize>,
    },
    Persist(Vec<usize>),
}

#[derive(Debug, Clone)]
pub struct TaskGraph {
    name: String,
    objects: Vec<LogicalObject>,
    object_index: HashMap<ObjectId, usize>,
    constants: Vec<ScalarValue>,
    tasks: Vec<TaskSpec>,
    ops: Vec<GraphOp>,
}

impl TaskGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: Vec::new(),
            object_index: HashMap::new(),
            constants: Vec::new(),
            tasks: Vec::new(),
            ops: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn intern(&mut self, object: &LogicalObject) -> usize {
        if let Some(index) = self.object_index.get(&object.id()) {
            return *index;
        }
        let index = self.objects.len();
        self.objects.push(object.clone());
        self.object_index.insert(object.id(), index);
        index
    }

    /// Declare objects whose host contents the device needs
    pub fn transfer_to_device(mut self, mode: DataTransferMode, objects: &[&LogicalObject]) -> Self {
        let objects = objects.iter().map(|o| self.intern(o)).collect();
        self.ops.push(GraphOp::TransferToDevice { mode, objects });
        self
    }

    pub fn task(
        mut self,
        name: impl Into<String>,
        descriptor: TaskDescriptor,
        args: impl IntoIterator<Item = TaskArg>,
    ) -> Self {
        let args = args
            .into_iter()
            .map(|arg| match arg {
                TaskArg::Object(object, access) => TaskArgument::Object {
                    index: self.intern(&object),
                    access,
                },
                TaskArg::Scalar(value) => {
                    self.constants.push(value);
                    TaskArgument::Constant(self.constants.len() - 1)
                }
            })
            .collect();
        self.tasks.push(TaskSpec {
            name: name.into(),
            descriptor,
            args,
        });
        self.ops.push(GraphOp::Task(self.tasks.len() - 1));
        self
    }

    /// Declare objects whose final contents must reach the host
    pub fn transfer_to_host(mut self, mode: DataTransferMode, objects: &[&LogicalObject]) -> Self {
        let objects = objects.iter().map(|o| self.intern(o)).collect();
        self.ops.push(GraphOp::TransferToHost { mode, objects });
        self
    }

    /// Keep objects on the device after execution
    pub fn persist_on_device(mut self, objects: &[&LogicalObject]) -> Self {
        let objects = objects.iter().map(|o| self.intern(o)).collect();
        self.ops.push(GraphOp::Persist(objects));
        self
    }

    /// Validate and freeze the graph
    pub fn snapshot(&self) -> ForgeResult<ImmutableTaskGraph> {
        let mut names = HashSet::new();
        for task in &self.tasks {
            if !names.insert(task.name.as_str()) {
                return Err(TaskForgeError::InvalidConfiguration(format!(
                    "duplicate task name '{}' in graph '{}'",
                    task.name, self.name
                )));
            }
        }

        let count = self.objects.len();
        let mut arena = NodeArena::new();
        arena.add(NodeKind::Context, vec![]);
        let object_nodes: Vec<NodeId> = (0..count)
            .map(|object| arena.add(NodeKind::Object { object }, vec![]))
            .collect();
        let constant_nodes: Vec<NodeId> = (0..self.constants.len())
            .map(|constant| arena.add(NodeKind::Constant { constant }, vec![]))
            .collect();

        let mut latest: Vec<Option<NodeId>> = vec![None; count];
        let mut touched: Vec<Vec<NodeId>> = vec![Vec::new(); count];
        let mut input_modes: Vec<Option<DataTransferMode>> = vec![None; count];
        let mut output_modes: Vec<Option<DataTransferMode>> = vec![None; count];
        let mut persisted = vec![false; count];

        for op in &self.ops {
            match op {
                GraphOp::TransferToDevice { mode, objects } => {
                    if *mode == DataTransferMode::UserManaged {
                        return Err(TaskForgeError::InvalidConfiguration(format!(
                            "graph '{}': user-managed mode only applies to transfers to the host",
                            self.name
                        )));
                    }
                    for &object in objects {
                        if latest[object].is_some() {
                            return Err(TaskForgeError::InvalidConfiguration(format!(
                                "graph '{}': {} is transferred to the device after it was already placed there",
                                self.name,
                                self.objects[object].id()
                            )));
                        }
                        let node = arena.add(
                            NodeKind::Transfer {
                                object,
                                direction: TransferDirection::ToDevice,
                                mode: *mode,
                            },
                            vec![object_nodes[object]],
                        );
                        latest[object] = Some(node);
                        touched[object].push(node);
                        input_modes[object] = Some(*mode);
                    }
                }
                GraphOp::Task(task) => {
                    let spec = &self.tasks[*task];
                    let mut inputs = Vec::with_capacity(spec.args.len());
                    for (position, arg) in spec.args.iter().enumerate() {
                        match *arg {
                            TaskArgument::Constant(constant) => inputs.push(constant_nodes[constant]),
                            TaskArgument::Object { index, access } => {
                                let value = match (latest[index], access) {
                                    (Some(node), _) => node,
                                    (None, Access::Write) => {
                                        let node = arena.add(
                                            NodeKind::Allocate { object: index },
                                            vec![object_nodes[index]],
                                        );
                                        latest[index] = Some(node);
                                        touched[index].push(node);
                                        node
                                    }
                                    (None, _) => {
                                        return Err(TaskForgeError::UndeclaredDependency {
                                            task: spec.name.clone(),
                                            detail: format!(
                                                "argument {} ({}) is read before any transfer to the device or producing task",
                                                position,
                                                self.objects[index].id()
                                            ),
                                        })
                                    }
                                };
                                inputs.push(value);
                            }
                        }
                    }

                    let task_node = arena.add(NodeKind::Task { task: *task }, inputs);
                    for arg in &spec.args {
                        if let TaskArgument::Object { index, access } = *arg {
                            touched[index].push(task_node);
                            if access.writes() {
                                let read = arena.add(
                                    NodeKind::DependentRead {
                                        object: index,
                                        task: *task,
                                    },
                                    vec![task_node],
                                );
                                latest[index] = Some(read);
                                touched[index].push(read);
                            }
                        }
                    }
                }
                GraphOp::TransferToHost { mode, objects } => {
                    for &object in objects {
                        output_modes[object] = Some(*mode);
                    }
                }
                GraphOp::Persist(objects) => {
                    for &object in objects {
                        persisted[object] = true;
                    }
                }
            }
        }

        for object in 0..count {
            if let Some(mode) = output_modes[object] {
                let value = latest[object].ok_or_else(|| self.never_on_device(object, "transfer_to_host"))?;
                let node = arena.add(
                    NodeKind::Transfer {
                        object,
                        direction: TransferDirection::ToHost,
                        mode,
                    },
                    vec![value],
                );
                touched[object].push(node);
            }
        }

        for object in 0..count {
            if persisted[object] {
                let value = latest[object].ok_or_else(|| self.never_on_device(object, "persist_on_device"))?;
                let node = arena.add(NodeKind::Persist { object }, vec![value]);
                touched[object].push(node);
            }
        }

        for object in 0..count {
            let keep = persisted[object]
                || input_modes[object] == Some(DataTransferMode::FirstExecution)
                || output_modes[object] == Some(DataTransferMode::UserManaged);
            if latest[object].is_some() && !keep {
                arena.add(NodeKind::Deallocate { object }, touched[object].clone());
            }
        }

        tracing::debug!(
            graph = %self.name,
            tasks = self.tasks.len(),
            objects = count,
            nodes = arena.len(),
            "task graph snapshot"
        );

        Ok(ImmutableTaskGraph::from_inner(Arc::new(GraphInner {
            name: self.name.clone(),
            objects: self.objects.clone(),
            constants: self.constants.clone(),
            tasks: self.tasks.clone(),
            arena,
            input_modes,
            output_modes,
            persisted,
        })))
    }

    fn never_on_device(&self, object: usize, operation: &str) -> TaskForgeError {
        TaskForgeError::UndeclaredDependency {
            task: operation.to_string(),
            detail: format!(
                "{} is never transferred to or produced on a device in graph '{}'",
                self.objects[object].id(),
                self.name
            ),
        }
    }
}
