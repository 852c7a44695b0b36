//! Host-side logical objects.
//!
//! A [`LogicalObject`] is a shared handle to a typed host array. Clones
//! refer to the same storage and the same [`ObjectId`]; the engine reads
//! and writes the storage when it moves data to and from devices.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::error::{ForgeResult, TaskForgeError};
use crate::object::element::{self, Element, ElementType};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Element type plus dimensions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectShape {
    pub element: ElementType,
    pub dims: Vec<usize>,
}

impl ObjectShape {
    pub fn new(element: ElementType, dims: Vec<usize>) -> Self {
        Self { element, dims }
    }

    pub fn element_count(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn byte_size(&self) -> usize {
        self.element_count() * self.element.size()
    }
}

impl fmt::Display for ObjectShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(ToString::to_string).collect();
        write!(f, "{}[{}]", self.element, dims.join("x"))
    }
}

#[derive(Debug)]
struct HostStorage {
    shape: ObjectShape,
    bytes: Vec<u8>,
}

#[derive(Clone)]
pub struct LogicalObject {
    id: ObjectId,
    storage: Arc<RwLock<HostStorage>>,
}

impl LogicalObject {
    fn with_storage(shape: ObjectShape, bytes: Vec<u8>) -> Self {
        Self {
            id: ObjectId(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)),
            storage: Arc::new(RwLock::new(HostStorage { shape, bytes })),
        }
    }

    /// Zero-filled object
    pub fn zeros(element: ElementType, dims: &[usize]) -> Self {
        let shape = ObjectShape::new(element, dims.to_vec());
        let bytes = vec![0u8; shape.byte_size()];
        Self::with_storage(shape, bytes)
    }

    /// One-dimensional object holding `values`
    pub fn from_slice<T: Element>(values: &[T]) -> Self {
        let shape = ObjectShape::new(T::TYPE, vec![values.len()]);
        Self::with_storage(shape, element::encode(values))
    }

    /// Object filled with `value`
    pub fn filled<T: Element>(value: T, dims: &[usize]) -> Self {
        let shape = ObjectShape::new(T::TYPE, dims.to_vec());
        let bytes = element::encode(&vec![value; shape.element_count()]);
        Self::with_storage(shape, bytes)
    }

    pub fn from_bytes(shape: ObjectShape, bytes: Vec<u8>) -> ForgeResult<Self> {
        if bytes.len() != shape.byte_size() {
            return Err(TaskForgeError::InvalidConfiguration(format!(
                "{} bytes do not match shape {} ({} bytes)",
                bytes.len(),
                shape,
                shape.byte_size()
            )));
        }
        Ok(Self::with_storage(shape, bytes))
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn shape(&self) -> ForgeResult<ObjectShape> {
        Ok(self.storage.read()?.shape.clone())
    }

    pub fn byte_size(&self) -> ForgeResult<usize> {
        Ok(self.storage.read()?.bytes.len())
    }

    pub fn element_type(&self) -> ForgeResult<ElementType> {
        Ok(self.storage.read()?.shape.element)
    }

    /// Copy the host contents out as `T`
    pub fn to_vec<T: Element>(&self) -> ForgeResult<Vec<T>> {
        let storage = self.storage.read()?;
        if storage.shape.element != T::TYPE {
            return Err(TaskForgeError::ShapeMismatch {
                object: self.id.0,
                expected: storage.shape.to_string(),
                found: format!("{}[..]", T::TYPE),
            });
        }
        Ok(element::decode(&storage.bytes))
    }

    /// Overwrite the host contents; element type and length must match
    pub fn write<T: Element>(&self, values: &[T]) -> ForgeResult<()> {
        let mut storage = self.storage.write()?;
        let expected = storage.shape.to_string();
        if storage.shape.element != T::TYPE || !element::encode_into(values, &mut storage.bytes) {
            return Err(TaskForgeError::ShapeMismatch {
                object: self.id.0,
                expected,
                found: format!("{}[{}]", T::TYPE, values.len()),
            });
        }
        Ok(())
    }

    /// Change the dimensions in place. Existing contents are kept up to the
    /// new length and new elements are zero.
    pub fn resize(&self, dims: &[usize]) -> ForgeResult<()> {
        let mut storage = self.storage.write()?;
        storage.shape.dims = dims.to_vec();
        let size = storage.shape.byte_size();
        storage.bytes.resize(size, 0);
        Ok(())
    }

    pub(crate) fn read_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> ForgeResult<R> {
        let storage = self.storage.read()?;
        Ok(f(&storage.bytes))
    }

    pub(crate) fn write_bytes<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> ForgeResult<R> {
        let mut storage = self.storage.write()?;
        Ok(f(&mut storage.bytes))
    }
}

impl PartialEq for LogicalObject {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LogicalObject {}

impl fmt::Debug for LogicalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = self
            .storage
            .read()
            .map(|s| s.shape.to_string())
            .unwrap_or_else(|_| "<poisoned>".to_string());
        f.debug_struct("LogicalObject")
            .field("id", &self.id)
            .field("shape", &shape)
            .finish()
    }
}
