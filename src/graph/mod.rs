//! Task graphs: the fluent builder and the validated node IR it lowers to.

pub mod builder;
pub mod immutable;
pub mod node;

pub use builder::{DataTransferMode, TaskArg, TaskArgument, TaskGraph, TaskSpec};
pub use immutable::ImmutableTaskGraph;
pub use node::{GraphNode, NodeArena, NodeId, NodeKind, TransferDirection};
