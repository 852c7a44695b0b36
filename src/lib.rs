//! TaskForge - Task-Graph Execution Engine
//!
//! Describe a graph of tasks over host arrays, compile it once into a
//! replayable instruction plan and execute it repeatedly on accelerator
//! devices reached through a [`DeviceBackend`].

#![allow(clippy::too_many_arguments)] // Instruction dispatch carries full operand lists

pub mod backend;
pub mod engine;
pub mod error;
pub mod execution_plan;
pub mod graph;
pub mod kernel;
pub mod logging;
pub mod memory;
pub mod object;
pub mod plan;
pub mod profiling;
pub mod runtime;

pub use backend::{Capability, DeviceBackend, DeviceId, DeviceInfo, HostBackend};
pub use engine::{EngineState, Interpreter};
pub use error::{ErrorCategory, ForgeResult, TaskForgeError};
pub use execution_plan::{ExecutionPlan, ExecutionResult};
pub use graph::{DataTransferMode, ImmutableTaskGraph, TaskArg, TaskGraph};
pub use kernel::{
    Access, GridScheduler, HostKernelCompiler, KernelCompiler, KernelInvocation, ScalarValue,
    TaskDescriptor, WorkerGrid,
};
pub use object::{ElementType, LogicalObject, ObjectShape};
pub use plan::{CompiledPlan, Instruction};
pub use profiling::{ProfileEvent, ProfilerType};
pub use runtime::{RuntimeConfig, RuntimeContext};
