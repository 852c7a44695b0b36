//! Plan instructions.
//!
//! Objects, tasks and constants are referenced by their index in the
//! owning graph, never by buffer address, so a plan stays valid when an
//! object binding is swapped between executions.

use std::fmt;

use crate::backend::DeviceId;
use crate::graph::DataTransferMode;

/// Launch argument reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgRef {
    Object(usize),
    Constant(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    ContextSwitch {
        device: DeviceId,
    },
    /// Materialise device buffers. With batching, batched objects get
    /// `batch_bytes` instead of their full size.
    Allocate {
        device: DeviceId,
        objects: Vec<usize>,
        batch_bytes: Option<usize>,
    },
    /// Copy `size` bytes (whole object when `None`) starting at host byte
    /// `offset` into the start of the device buffer
    CopyIn {
        object: usize,
        device: DeviceId,
        mode: DataTransferMode,
        offset: usize,
        size: Option<usize>,
    },
    Launch {
        task: usize,
        device: DeviceId,
        args: Vec<ArgRef>,
        /// First global work-item index (batch chunk start)
        element_offset: usize,
        threads: usize,
        /// Live bytes of batched buffers for this chunk
        chunk_bytes: Option<usize>,
    },
    CopyOut {
        object: usize,
        device: DeviceId,
        mode: DataTransferMode,
        offset: usize,
        size: Option<usize>,
        blocking: bool,
    },
    Persist {
        object: usize,
        device: DeviceId,
    },
    Barrier {
        device: DeviceId,
    },
    Deallocate {
        object: usize,
        device: DeviceId,
    },
}

impl Instruction {
    /// Mnemonic used in disassembly
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Instruction::ContextSwitch { .. } => "CONTEXT_SWITCH",
            Instruction::Allocate { .. } => "ALLOCATE",
            Instruction::CopyIn {
                mode: DataTransferMode::FirstExecution,
                ..
            } => "COPY_IN_ONCE",
            Instruction::CopyIn { .. } => "COPY_IN_ALWAYS",
            Instruction::Launch { .. } => "LAUNCH",
            Instruction::CopyOut { blocking: true, .. } => "COPY_OUT_BLOCKING",
            Instruction::CopyOut {
                mode: DataTransferMode::FirstExecution,
                ..
            } => "COPY_OUT_ONCE",
            Instruction::CopyOut { .. } => "COPY_OUT_ALWAYS",
            Instruction::Persist { .. } => "PERSIST",
            Instruction::Barrier { .. } => "BARRIER",
            Instruction::Deallocate { .. } => "DEALLOCATE",
        }
    }

    pub fn device(&self) -> DeviceId {
        match self {
            Instruction::ContextSwitch { device }
            | Instruction::Allocate { device, .. }
            | Instruction::CopyIn { device, .. }
            | Instruction::Launch { device, .. }
            | Instruction::CopyOut { device, .. }
            | Instruction::Persist { device, .. }
            | Instruction::Barrier { device }
            | Instruction::Deallocate { device, .. } => *device,
        }
    }

    pub fn is_launch(&self) -> bool {
        matches!(self, Instruction::Launch { .. })
    }
}

fn fmt_range(f: &mut fmt::Formatter<'_>, offset: usize, size: Option<usize>) -> fmt::Result {
    match size {
        Some(size) => write!(f, " [{}..{})", offset, offset + size),
        None => Ok(()),
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<18}", self.mnemonic())?;
        match self {
            Instruction::ContextSwitch { device } | Instruction::Barrier { device } => {
                write!(f, "{}", device)
            }
            Instruction::Allocate {
                device,
                objects,
                batch_bytes,
            } => {
                let list: Vec<String> = objects.iter().map(|o| format!("obj{}", o)).collect();
                write!(f, "{} [{}]", device, list.join(", "))?;
                if let Some(bytes) = batch_bytes {
                    write!(f, " batch={}", bytes)?;
                }
                Ok(())
            }
            Instruction::CopyIn {
                object,
                device,
                offset,
                size,
                ..
            }
            | Instruction::CopyOut {
                object,
                device,
                offset,
                size,
                ..
            } => {
                write!(f, "obj{} {}", object, device)?;
                fmt_range(f, *offset, *size)
            }
            Instruction::Launch {
                task,
                device,
                args,
                element_offset,
                threads,
                ..
            } => {
                let list: Vec<String> = args
                    .iter()
                    .map(|a| match a {
                        ArgRef::Object(o) => format!("obj{}", o),
                        ArgRef::Constant(c) => format!("const{}", c),
                    })
                    .collect();
                write!(
                    f,
                    "task{} {} ({}) threads={} offset={}",
                    task,
                    device,
                    list.join(", "),
                    threads,
                    element_offset
                )
            }
            Instruction::Persist { object, device } | Instruction::Deallocate { object, device } => {
                write!(f, "obj{} {}", object, device)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mnemonics() {
        let d = DeviceId::new(0, 0);
        let copy_in = Instruction::CopyIn {
            object: 0,
            device: d,
            mode: DataTransferMode::FirstExecution,
            offset: 0,
            size: None,
        };
        assert_eq!(copy_in.mnemonic(), "COPY_IN_ONCE");
        let copy_out = Instruction::CopyOut {
            object: 0,
            device: d,
            mode: DataTransferMode::EveryExecution,
            offset: 0,
            size: None,
            blocking: true,
        };
        assert_eq!(copy_out.mnemonic(), "COPY_OUT_BLOCKING");
        assert_eq!(Instruction::Barrier { device: d }.mnemonic(), "BARRIER");
    }

    #[test]
    fn test_display() {
        let d = DeviceId::new(0, 1);
        let launch = Instruction::Launch {
            task: 2,
            device: d,
            args: vec![ArgRef::Object(0), ArgRef::Constant(1)],
            element_offset: 64,
            threads: 32,
            chunk_bytes: Some(128),
        };
        let text = launch.to_string();
        assert!(text.starts_with("LAUNCH"));
        assert!(text.contains("task2 device[0:1] (obj0, const1) threads=32 offset=64"));

        let copy = Instruction::CopyIn {
            object: 3,
            device: d,
            mode: DataTransferMode::EveryExecution,
            offset: 16,
            size: Some(16),
        };
        assert!(copy.to_string().ends_with("obj3 device[0:1] [16..32)"));
        assert_eq!(copy.device(), d);
        assert!(!copy.is_launch());
    }
}
