//! Per-instruction profiling events.

use serde::Serialize;

use crate::backend::{DeviceId, EventTiming};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProfileEventKind {
    CopyIn,
    CopyOut,
    Launch,
}

/// Timestamps of one COPY or LAUNCH instruction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileEvent {
    pub kind: ProfileEventKind,
    /// Task name for launches, object id for copies
    pub label: String,
    pub device: DeviceId,
    /// Bytes moved (zero for launches)
    pub bytes: usize,
    pub timing: EventTiming,
    /// Execution count of the plan when the event was recorded
    pub invocation: u64,
}

impl ProfileEvent {
    pub fn elapsed_ns(&self) -> u64 {
        self.timing.elapsed_ns()
    }
}
