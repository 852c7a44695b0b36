//! Execution engine
//!
//! - [`interpreter`] - Instruction dispatch and per-plan device state
//! - [`stats`] - Engine statistics

pub mod interpreter;
pub mod stats;

pub use interpreter::{EngineState, Interpreter};
pub use stats::EngineStats;
