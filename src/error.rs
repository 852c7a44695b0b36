//! Unified error handling for TaskForge
//!
//! Every fallible operation in the crate returns [`ForgeResult`]. Errors are
//! grouped into categories so callers can decide whether to fix their input,
//! retry, or reset the device:
//! - User errors (graph construction, configuration)
//! - Recoverable errors (memory pressure)
//! - Backend errors (device faults, timeouts)
//! - Internal errors (bugs)

use std::fmt;

use crate::backend::DeviceId;

/// Unified error type for TaskForge
#[derive(Debug, thiserror::Error)]
pub enum TaskForgeError {
    // ========== Graph Build Errors ==========
    /// A task argument references an object that no earlier node defines
    #[error("Undeclared dependency in task '{task}': {detail}")]
    UndeclaredDependency { task: String, detail: String },

    /// Object shape differs from the shape recorded at last resolution
    #[error("Shape mismatch for object {object}: expected {expected}, found {found}")]
    ShapeMismatch {
        object: u64,
        expected: String,
        found: String,
    },

    // ========== Memory Errors ==========
    /// Device heap cannot satisfy an allocation
    #[error("Out of device memory on {device}: requested {requested} bytes, {available} available")]
    OutOfMemory {
        device: DeviceId,
        requested: usize,
        available: usize,
    },

    /// Malformed batch or memory-limit size string
    #[error("Invalid batch size: {0}")]
    InvalidBatchSize(String),

    // ========== Execution Errors ==========
    /// BARRIER wait exceeded the configured timeout
    #[error("Execution timed out on {device} after {timeout_ms} ms")]
    ExecutionTimeout { device: DeviceId, timeout_ms: u64 },

    /// Device-level fault while running a plan
    #[error("Execution failed: {0}")]
    ExecutionFailure(String),

    /// Device lacks a capability the plan requires
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Plan failed earlier and must be reset before reuse
    #[error("Execution plan is unusable after a failure; call reset_device() first")]
    PlanUnusable,

    /// Engine state machine was asked to make an illegal move
    #[error("Invalid engine state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    // ========== Lookup Errors ==========
    /// Device index outside the runtime's device table
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Kernel compiler has no entry for a method reference
    #[error("Kernel not found: {0}")]
    KernelNotFound(String),

    /// Object is not part of this plan
    #[error("Object not found in plan: {0}")]
    ObjectNotFound(u64),

    // ========== Configuration Errors ==========
    /// Invalid runtime or plan configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    // ========== Internal Errors ==========
    /// Lock poisoned (a panic happened while the lock was held)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),

    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl TaskForgeError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            TaskForgeError::UndeclaredDependency { .. }
            | TaskForgeError::ShapeMismatch { .. }
            | TaskForgeError::InvalidBatchSize(_)
            | TaskForgeError::InvalidConfiguration(_)
            | TaskForgeError::DeviceNotFound(_)
            | TaskForgeError::KernelNotFound(_)
            | TaskForgeError::ObjectNotFound(_)
            | TaskForgeError::UnsupportedConfiguration(_) => ErrorCategory::User,

            TaskForgeError::OutOfMemory { .. } => ErrorCategory::Recoverable,

            TaskForgeError::ExecutionTimeout { .. }
            | TaskForgeError::ExecutionFailure(_)
            | TaskForgeError::PlanUnusable => ErrorCategory::Backend,

            TaskForgeError::InvalidStateTransition { .. }
            | TaskForgeError::LockPoisoned(_)
            | TaskForgeError::InternalError(_) => ErrorCategory::Internal,
        }
    }

    /// Recoverable errors may succeed on retry (smaller batches, freed memory)
    pub fn is_recoverable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Recoverable)
    }

    /// User errors indicate an invalid graph or configuration
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Internal errors should be reported as bugs
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }

    /// Errors after which the plan must be reset before it can run again.
    /// Any failure raised while a plan runs qualifies; only the refusal to
    /// run an already unusable plan does not.
    pub fn poisons_plan(&self) -> bool {
        !matches!(self, TaskForgeError::PlanUnusable)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid graph, input or configuration
    User,
    /// Temporary condition, retry may succeed
    Recoverable,
    /// Device fault or timeout
    Backend,
    /// Indicates a bug
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Recoverable => write!(f, "Recoverable"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for TaskForgeError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        TaskForgeError::LockPoisoned(err.to_string())
    }
}

/// Result alias used across the crate
pub type ForgeResult<T> = std::result::Result<T, TaskForgeError>;

/// Create an internal error with context
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::TaskForgeError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::TaskForgeError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Create a configuration error with context
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::TaskForgeError::InvalidConfiguration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::TaskForgeError::InvalidConfiguration(format!($fmt, $($arg)*))
    };
}
