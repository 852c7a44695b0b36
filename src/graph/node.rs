//! Graph IR nodes.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. A node's
//! inputs are the nodes it depends on; every input has a smaller id than
//! the node itself, so id order is already a valid execution order.

use std::collections::VecDeque;
use std::fmt;

use crate::error::{ForgeResult, TaskForgeError};
use crate::graph::DataTransferMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    ToDevice,
    ToHost,
}

/// Object and task fields index into the owning graph's tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Device context every data-movement and task node belongs to
    Context,
    Object { object: usize },
    Constant { constant: usize },
    Task { task: usize },
    /// Device buffer for an object first produced by a task
    Allocate { object: usize },
    Transfer {
        object: usize,
        direction: TransferDirection,
        mode: DataTransferMode,
    },
    /// Value of `object` after `task` wrote it
    DependentRead { object: usize, task: usize },
    Persist { object: usize },
    Deallocate { object: usize },
}

impl NodeKind {
    /// Nodes that turn into device work
    pub fn is_context_op(&self) -> bool {
        !matches!(
            self,
            NodeKind::Context | NodeKind::Object { .. } | NodeKind::Constant { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Context => "context",
            NodeKind::Object { .. } => "object",
            NodeKind::Constant { .. } => "constant",
            NodeKind::Task { .. } => "task",
            NodeKind::Allocate { .. } => "allocate",
            NodeKind::Transfer {
                direction: TransferDirection::ToDevice,
                ..
            } => "copy-in",
            NodeKind::Transfer {
                direction: TransferDirection::ToHost,
                ..
            } => "copy-out",
            NodeKind::DependentRead { .. } => "dependent-read",
            NodeKind::Persist { .. } => "persist",
            NodeKind::Deallocate { .. } => "deallocate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub inputs: Vec<NodeId>,
    pub context: Option<NodeId>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeArena {
    nodes: Vec<GraphNode>,
    context: Option<NodeId>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: NodeKind, inputs: Vec<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len());
        let context = if kind.is_context_op() { self.context } else { None };
        if kind == NodeKind::Context && self.context.is_none() {
            self.context = Some(id);
        }
        self.nodes.push(GraphNode {
            id,
            kind,
            inputs,
            context,
        });
        id
    }

    pub fn get(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes that list `id` among their inputs
    pub fn users(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.inputs.contains(&id))
            .map(|node| node.id)
            .collect()
    }

    /// Kahn ordering, ties broken by node id
    pub fn topological_order(&self) -> ForgeResult<Vec<NodeId>> {
        let mut pending: Vec<usize> = vec![0; self.nodes.len()];
        let mut users: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for node in &self.nodes {
            for input in &node.inputs {
                if input.0 >= self.nodes.len() {
                    return Err(TaskForgeError::InternalError(format!(
                        "{} depends on missing node {}",
                        node.id, input
                    )));
                }
                pending[node.id.0] += 1;
                users[input.0].push(node.id.0);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.nodes.len()).filter(|i| pending[*i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(index) = ready.pop_front() {
            order.push(NodeId(index));
            for &user in &users[index] {
                pending[user] -= 1;
                if pending[user] == 0 {
                    ready.push_back(user);
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(TaskForgeError::InternalError(
                "task graph contains a dependency cycle".to_string(),
            ));
        }
        Ok(order)
    }
}
