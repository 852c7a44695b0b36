//! Task descriptors, worker grids and compiled kernels.
//!
//! A task names a kernel method plus the capabilities it needs. The
//! [`KernelCompiler`] turns a task and the shapes of its arguments into a
//! [`CompiledKernel`] for one device; compiled kernels are cached per
//! (task, device) by [`KernelCache`].

pub mod cache;
pub mod host_compiler;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::backend::{Capability, DeviceId, DeviceInfo};
use crate::error::ForgeResult;
use crate::object::element::{self, Element, ElementType};

pub use cache::{KernelCache, KernelCacheStats};
pub use host_compiler::HostKernelCompiler;

/// How a task uses one of its object arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn reads(&self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(&self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

/// Value passed to a kernel by copy
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum ScalarValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl ScalarValue {
    pub fn element_type(&self) -> ElementType {
        match self {
            ScalarValue::I32(_) => ElementType::I32,
            ScalarValue::I64(_) => ElementType::I64,
            ScalarValue::F32(_) => ElementType::F32,
            ScalarValue::F64(_) => ElementType::F64,
        }
    }

    pub fn as_f32(&self) -> f32 {
        match *self {
            ScalarValue::I32(v) => v as f32,
            ScalarValue::I64(v) => v as f32,
            ScalarValue::F32(v) => v,
            ScalarValue::F64(v) => v as f32,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            ScalarValue::I32(v) => v as f64,
            ScalarValue::I64(v) => v as f64,
            ScalarValue::F32(v) => v as f64,
            ScalarValue::F64(v) => v,
        }
    }

    pub fn as_i64(&self) -> i64 {
        match *self {
            ScalarValue::I32(v) => v as i64,
            ScalarValue::I64(v) => v,
            ScalarValue::F32(v) => v as i64,
            ScalarValue::F64(v) => v as i64,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::I32(v) => write!(f, "{}i32", v),
            ScalarValue::I64(v) => write!(f, "{}i64", v),
            ScalarValue::F32(v) => write!(f, "{}f32", v),
            ScalarValue::F64(v) => write!(f, "{}f64", v),
        }
    }
}

impl From<i32> for ScalarValue {
    fn from(v: i32) -> Self {
        ScalarValue::I32(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::I64(v)
    }
}

impl From<f32> for ScalarValue {
    fn from(v: f32) -> Self {
        ScalarValue::F32(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::F64(v)
    }
}

/// Reference to a kernel method plus the device features it needs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskDescriptor {
    method: String,
    requirements: Vec<Capability>,
}

impl TaskDescriptor {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            requirements: Vec::new(),
        }
    }

    /// Require a device capability; plans targeting devices without it fail to compile
    pub fn requires(mut self, capability: Capability) -> Self {
        if !self.requirements.contains(&capability) {
            self.requirements.push(capability);
        }
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn requirements(&self) -> &[Capability] {
        &self.requirements
    }
}

/// Argument signature handed to the kernel compiler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentShape {
    Buffer {
        element: ElementType,
        elements: usize,
        access: Access,
    },
    Scalar(ElementType),
}

/// Global (and optional local) work size of a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerGrid {
    global: [usize; 3],
    local: Option<[usize; 3]>,
    dimensions: u8,
}

impl WorkerGrid {
    pub fn new_1d(x: usize) -> Self {
        Self {
            global: [x, 1, 1],
            local: None,
            dimensions: 1,
        }
    }

    pub fn new_2d(x: usize, y: usize) -> Self {
        Self {
            global: [x, y, 1],
            local: None,
            dimensions: 2,
        }
    }

    pub fn new_3d(x: usize, y: usize, z: usize) -> Self {
        Self {
            global: [x, y, z],
            local: None,
            dimensions: 3,
        }
    }

    pub fn with_local_work(mut self, local: [usize; 3]) -> Self {
        self.local = Some(local);
        self
    }

    pub fn global(&self) -> [usize; 3] {
        self.global
    }

    pub fn local(&self) -> Option<[usize; 3]> {
        self.local
    }

    pub fn dimensions(&self) -> u8 {
        self.dimensions
    }

    pub fn total_threads(&self) -> usize {
        self.global.iter().product()
    }

    /// Grid restricted to `threads` work items, used for batch chunks.
    /// Multi-dimensional grids are kept as configured.
    pub fn with_threads(&self, threads: usize) -> Self {
        if self.dimensions == 1 {
            Self {
                global: [threads, 1, 1],
                ..*self
            }
        } else {
            *self
        }
    }
}

impl fmt::Display for WorkerGrid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dimensions {
            1 => write!(f, "[{}]", self.global[0]),
            2 => write!(f, "[{}, {}]", self.global[0], self.global[1]),
            _ => write!(f, "[{}, {}, {}]", self.global[0], self.global[1], self.global[2]),
        }
    }
}

/// Per-task worker grids keyed by task name
#[derive(Debug, Clone, Default)]
pub struct GridScheduler {
    grids: HashMap<String, WorkerGrid>,
}

impl GridScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, task: impl Into<String>, grid: WorkerGrid) -> Self {
        self.grids.insert(task.into(), grid);
        self
    }

    pub fn set(&mut self, task: impl Into<String>, grid: WorkerGrid) {
        self.grids.insert(task.into(), grid);
    }

    pub fn get(&self, task: &str) -> Option<&WorkerGrid> {
        self.grids.get(task)
    }

    pub fn len(&self) -> usize {
        self.grids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grids.is_empty()
    }
}

/// Compiler flags per backend name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompilerFlags {
    flags: HashMap<String, String>,
}

impl CompilerFlags {
    pub fn set(&mut self, backend: impl Into<String>, flags: impl Into<String>) {
        self.flags.insert(backend.into(), flags.into());
    }

    pub fn get(&self, backend: &str) -> Option<&str> {
        self.flags.get(backend).map(String::as_str)
    }
}

/// Host-executable kernel body
pub type HostKernelFn = Arc<dyn Fn(&mut KernelInvocation) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub enum KernelPayload {
    Host(HostKernelFn),
    /// Device binary produced by an external compiler
    Binary(Arc<[u8]>),
}

impl fmt::Debug for KernelPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelPayload::Host(_) => f.write_str("Host(<fn>)"),
            KernelPayload::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
        }
    }
}

/// Kernel compiled for one device
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    method: String,
    device: DeviceId,
    payload: KernelPayload,
    flags: Option<String>,
}

impl CompiledKernel {
    pub fn host(method: impl Into<String>, device: DeviceId, function: HostKernelFn) -> Self {
        Self {
            method: method.into(),
            device,
            payload: KernelPayload::Host(function),
            flags: None,
        }
    }

    pub fn binary(method: impl Into<String>, device: DeviceId, binary: Arc<[u8]>) -> Self {
        Self {
            method: method.into(),
            device,
            payload: KernelPayload::Binary(binary),
            flags: None,
        }
    }

    pub fn with_flags(mut self, flags: Option<&str>) -> Self {
        self.flags = flags.map(str::to_string);
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn payload(&self) -> &KernelPayload {
        &self.payload
    }

    pub fn flags(&self) -> Option<&str> {
        self.flags.as_deref()
    }
}

/// One launch argument as seen by a host kernel
#[derive(Debug, Clone, PartialEq)]
pub enum KernelValue {
    Buffer(Vec<u8>),
    Scalar(ScalarValue),
}

/// Arguments and launch geometry of a single host kernel call
#[derive(Debug)]
pub struct KernelInvocation {
    values: Vec<KernelValue>,
    grid: WorkerGrid,
    thread_offset: usize,
}

impl KernelInvocation {
    pub fn new(values: Vec<KernelValue>, grid: WorkerGrid, thread_offset: usize) -> Self {
        Self {
            values,
            grid,
            thread_offset,
        }
    }

    pub fn arg_count(&self) -> usize {
        self.values.len()
    }

    pub fn grid(&self) -> &WorkerGrid {
        &self.grid
    }

    /// Global index of the first work item (non-zero for batch chunks)
    pub fn thread_offset(&self) -> usize {
        self.thread_offset
    }

    pub fn global_size(&self) -> usize {
        self.grid.total_threads()
    }

    pub fn bytes(&self, index: usize) -> Result<&[u8], String> {
        match self.values.get(index) {
            Some(KernelValue::Buffer(bytes)) => Ok(bytes),
            Some(KernelValue::Scalar(_)) => Err(format!("argument {} is a scalar", index)),
            None => Err(format!("argument {} out of range", index)),
        }
    }

    pub fn bytes_mut(&mut self, index: usize) -> Result<&mut [u8], String> {
        match self.values.get_mut(index) {
            Some(KernelValue::Buffer(bytes)) => Ok(bytes),
            Some(KernelValue::Scalar(_)) => Err(format!("argument {} is a scalar", index)),
            None => Err(format!("argument {} out of range", index)),
        }
    }

    /// Decode a buffer argument
    pub fn read<T: Element>(&self, index: usize) -> Result<Vec<T>, String> {
        Ok(element::decode(self.bytes(index)?))
    }

    /// Overwrite a buffer argument; the length must match
    pub fn write<T: Element>(&mut self, index: usize, values: &[T]) -> Result<(), String> {
        let out = self.bytes_mut(index)?;
        let len = out.len();
        if element::encode_into(values, out) {
            Ok(())
        } else {
            Err(format!(
                "argument {} holds {} bytes, got {} {} values",
                index,
                len,
                values.len(),
                T::TYPE
            ))
        }
    }

    /// Apply `f` to every element of a buffer argument
    pub fn update<T: Element>(
        &mut self,
        index: usize,
        mut f: impl FnMut(usize, &mut T),
    ) -> Result<(), String> {
        let mut values = self.read::<T>(index)?;
        for (i, value) in values.iter_mut().enumerate() {
            f(i, value);
        }
        self.write(index, &values)
    }

    pub fn scalar(&self, index: usize) -> Result<ScalarValue, String> {
        match self.values.get(index) {
            Some(KernelValue::Scalar(value)) => Ok(*value),
            Some(KernelValue::Buffer(_)) => Err(format!("argument {} is a buffer", index)),
            None => Err(format!("argument {} out of range", index)),
        }
    }

    pub fn into_values(self) -> Vec<KernelValue> {
        self.values
    }
}

/// Turns a task into a device-specific kernel
pub trait KernelCompiler: Send + Sync {
    fn compile(
        &self,
        task: &TaskDescriptor,
        shapes: &[ArgumentShape],
        device: &DeviceInfo,
        flags: Option<&str>,
    ) -> ForgeResult<CompiledKernel>;
}
