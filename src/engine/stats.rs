//! Engine statistics

use crate::engine::EngineState;
use crate::kernel::KernelCacheStats;

/// Snapshot of an [`Interpreter`](crate::engine::Interpreter)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub state: EngineState,

    /// Whether a previous failure left the plan unusable
    pub poisoned: bool,

    /// Invocations started so far
    pub executions: u64,

    /// Objects with a state record
    pub tracked_objects: usize,

    /// Profiling events not yet cleared
    pub profile_events: usize,

    pub kernels: KernelCacheStats,

    /// Device bytes held across all devices
    pub allocated_bytes: usize,
}
