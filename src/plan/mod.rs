//! Plan compiler: task graph to replayable instruction list.

pub mod compiler;
pub mod instruction;

pub use compiler::{CompiledPlan, DeviceAssignment, PlanCompiler, PlanMetadata};
pub use instruction::{ArgRef, Instruction};
