//! Profiling for plan executions.
//!
//! - [`events`]: per-instruction timestamps recorded on every execution
//! - [`time_profiler`]: aggregated metrics, enabled per plan
//! - [`kernel_timer`]: host wall-clock timer used by the profiler

pub mod events;
pub mod kernel_timer;
pub mod time_profiler;

pub use events::{ProfileEvent, ProfileEventKind};
pub use kernel_timer::KernelTimer;
pub use time_profiler::{ProfilerType, TimeProfiler};
