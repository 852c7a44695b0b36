//! Frozen task graph.

use std::sync::Arc;

use crate::error::ForgeResult;
use crate::graph::builder::{DataTransferMode, TaskArgument, TaskSpec};
use crate::graph::node::{GraphNode, NodeArena, NodeId};
use crate::kernel::{ArgumentShape, ScalarValue};
use crate::internal_error;
use crate::object::{LogicalObject, ObjectId};

#[derive(Debug)]
pub(crate) struct GraphInner {
    pub(crate) name: String,
    pub(crate) objects: Vec<LogicalObject>,
    pub(crate) constants: Vec<ScalarValue>,
    pub(crate) tasks: Vec<TaskSpec>,
    pub(crate) arena: NodeArena,
    pub(crate) input_modes: Vec<Option<DataTransferMode>>,
    pub(crate) output_modes: Vec<Option<DataTransferMode>>,
    pub(crate) persisted: Vec<bool>,
}

/// Validated, read-only task graph; cheap to clone
#[derive(Debug, Clone)]
pub struct ImmutableTaskGraph {
    inner: Arc<GraphInner>,
}

impl ImmutableTaskGraph {
    pub(crate) fn from_inner(inner: Arc<GraphInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Objects as bound at snapshot time, indexed by graph object index
    pub fn objects(&self) -> &[LogicalObject] {
        &self.inner.objects
    }

    pub fn object_index(&self, id: ObjectId) -> Option<usize> {
        self.inner.objects.iter().position(|o| o.id() == id)
    }

    pub fn constants(&self) -> &[ScalarValue] {
        &self.inner.constants
    }

    pub fn tasks(&self) -> &[TaskSpec] {
        &self.inner.tasks
    }

    pub fn task_index(&self, name: &str) -> Option<usize> {
        self.inner.tasks.iter().position(|t| t.name == name)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        self.inner.arena.nodes()
    }

    pub fn node(&self, id: NodeId) -> Option<&GraphNode> {
        self.inner.arena.get(id)
    }

    pub fn topological_order(&self) -> ForgeResult<Vec<NodeId>> {
        self.inner.arena.topological_order()
    }

    pub fn input_mode(&self, object: usize) -> Option<DataTransferMode> {
        self.inner.input_modes.get(object).copied().flatten()
    }

    pub fn output_mode(&self, object: usize) -> Option<DataTransferMode> {
        self.inner.output_modes.get(object).copied().flatten()
    }

    pub fn is_persisted(&self, object: usize) -> bool {
        self.inner.persisted.get(object).copied().unwrap_or(false)
    }

    /// No tasks and no data movement
    pub fn is_empty(&self) -> bool {
        self.inner.arena.nodes().iter().all(|n| !n.kind.is_context_op())
    }

    /// Argument signature of `task` for the given object bindings
    pub fn argument_shapes(&self, task: usize, bindings: &[LogicalObject]) -> ForgeResult<Vec<ArgumentShape>> {
        let spec = self
            .inner
            .tasks
            .get(task)
            .ok_or_else(|| internal_error!("task index {} out of range", task))?;

        spec.args
            .iter()
            .map(|arg| match *arg {
                TaskArgument::Object { index, access } => {
                    let object = bindings.get(index).ok_or_else(|| {
                        internal_error!("object index {} out of range", index)
                    })?;
                    let shape = object.shape()?;
                    Ok(ArgumentShape::Buffer {
                        element: shape.element,
                        elements: shape.element_count(),
                        access,
                    })
                }
                TaskArgument::Constant(constant) => {
                    let value = self.inner.constants.get(constant).ok_or_else(|| {
                        internal_error!("constant index {} out of range", constant)
                    })?;
                    Ok(ArgumentShape::Scalar(value.element_type()))
                }
            })
            .collect()
    }
}
