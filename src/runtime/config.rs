//! Runtime configuration
//!
//! [`RuntimeConfig`] controls device heap sizing, barrier timeouts, the
//! batch retry floor and diagnostics. Values come from the builder methods
//! and can be overridden from the environment with [`RuntimeConfig::from_env`].

use std::time::Duration;

use crate::error::{ForgeResult, TaskForgeError};
use crate::memory::{parse_size, HeapConfig};

/// Fixed per-device heap size, e.g. `256MB`
pub const HEAP_SIZE_ENV: &str = "TASKFORGE_HEAP_SIZE";
/// Fraction of device memory used when no fixed heap size is set
pub const HEAP_FRACTION_ENV: &str = "TASKFORGE_HEAP_FRACTION";
pub const BARRIER_TIMEOUT_ENV: &str = "TASKFORGE_BARRIER_TIMEOUT_MS";
pub const PRINT_BYTECODES_ENV: &str = "TASKFORGE_PRINT_BYTECODES";
pub const PROFILER_ENV: &str = "TASKFORGE_PROFILER";

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Fixed heap size per device; overrides `heap_fraction`
    pub device_heap_bytes: Option<usize>,

    /// Fraction of device global memory reserved for the heap
    pub heap_fraction: f64,

    /// Sub-allocation alignment in bytes (power of two)
    pub alignment: usize,

    /// Upper bound for a BARRIER wait
    pub barrier_timeout: Option<Duration>,

    /// Smallest batch the out-of-memory retry loop will try
    pub min_batch_bytes: usize,

    /// Log the disassembled plan whenever a plan is compiled
    pub print_bytecodes: bool,

    /// Default for new plans' aggregated profiler
    pub profiler_enabled: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            device_heap_bytes: None,
            heap_fraction: 0.75,
            alignment: 64,
            barrier_timeout: None,
            min_batch_bytes: 4096,
            print_bytecodes: false,
            profiler_enabled: false,
        }
    }
}

fn parse_flag(name: &str, value: &str) -> ForgeResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(TaskForgeError::InvalidConfiguration(format!(
            "{} must be a boolean, got '{}'",
            name, other
        ))),
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device_heap_bytes(mut self, bytes: usize) -> Self {
        self.device_heap_bytes = Some(bytes);
        self
    }

    pub fn with_heap_fraction(mut self, fraction: f64) -> Self {
        self.heap_fraction = fraction;
        self
    }

    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = Some(timeout);
        self
    }

    pub fn with_min_batch_bytes(mut self, bytes: usize) -> Self {
        self.min_batch_bytes = bytes;
        self
    }

    pub fn with_print_bytecodes(mut self, enabled: bool) -> Self {
        self.print_bytecodes = enabled;
        self
    }

    pub fn with_profiler(mut self, enabled: bool) -> Self {
        self.profiler_enabled = enabled;
        self
    }

    /// Defaults overridden by `TASKFORGE_*` environment variables
    pub fn from_env() -> ForgeResult<Self> {
        Self::default().apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value
    pub fn apply_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> ForgeResult<Self> {
        if let Some(value) = lookup(HEAP_SIZE_ENV) {
            let bytes = parse_size(&value).map_err(|e| {
                TaskForgeError::InvalidConfiguration(format!("{}: {}", HEAP_SIZE_ENV, e))
            })?;
            self.device_heap_bytes = Some(bytes);
        }
        if let Some(value) = lookup(HEAP_FRACTION_ENV) {
            self.heap_fraction = value.trim().parse().map_err(|_| {
                TaskForgeError::InvalidConfiguration(format!(
                    "{} must be a number, got '{}'",
                    HEAP_FRACTION_ENV, value
                ))
            })?;
        }
        if let Some(value) = lookup(BARRIER_TIMEOUT_ENV) {
            let ms: u64 = value.trim().parse().map_err(|_| {
                TaskForgeError::InvalidConfiguration(format!(
                    "{} must be milliseconds, got '{}'",
                    BARRIER_TIMEOUT_ENV, value
                ))
            })?;
            self.barrier_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(value) = lookup(PRINT_BYTECODES_ENV) {
            self.print_bytecodes = parse_flag(PRINT_BYTECODES_ENV, &value)?;
        }
        if let Some(value) = lookup(PROFILER_ENV) {
            self.profiler_enabled = parse_flag(PROFILER_ENV, &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> ForgeResult<()> {
        if !(self.heap_fraction > 0.0 && self.heap_fraction <= 1.0) {
            return Err(TaskForgeError::InvalidConfiguration(format!(
                "heap fraction must be in (0, 1], got {}",
                self.heap_fraction
            )));
        }
        if !self.alignment.is_power_of_two() {
            return Err(TaskForgeError::InvalidConfiguration(format!(
                "alignment must be a power of two, got {}",
                self.alignment
            )));
        }
        if self.device_heap_bytes == Some(0) {
            return Err(TaskForgeError::InvalidConfiguration(
                "device heap size must be positive".to_string(),
            ));
        }
        if self.min_batch_bytes == 0 {
            return Err(TaskForgeError::InvalidConfiguration(
                "minimum batch size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn heap_config(&self) -> HeapConfig {
        HeapConfig {
            heap_bytes: self.device_heap_bytes,
            heap_fraction: self.heap_fraction,
            alignment: self.alignment,
        }
    }
}
