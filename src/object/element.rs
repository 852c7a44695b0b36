//! Element types and little-endian encoding of host data.

use std::fmt;

use serde::Serialize;

/// Scalar element stored in a logical object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    U8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl ElementType {
    /// Size in bytes of one element
    pub fn size(&self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::I16 => 2,
            ElementType::I32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::F64 => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ElementType::U8 => "u8",
            ElementType::I16 => "i16",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Rust type that can live inside a logical object
pub trait Element: Copy + Send + Sync + 'static {
    const TYPE: ElementType;

    fn write_le(self, out: &mut [u8]);

    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const TYPE: ElementType = ElementType::$variant;

            fn write_le(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }

            fn read_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(bytes);
                <$ty>::from_le_bytes(buf)
            }
        }
    };
}

impl_element!(u8, U8);
impl_element!(i16, I16);
impl_element!(i32, I32);
impl_element!(i64, I64);
impl_element!(f32, F32);
impl_element!(f64, F64);

/// Encode a slice into little-endian bytes
pub fn encode<T: Element>(values: &[T]) -> Vec<u8> {
    let size = T::TYPE.size();
    let mut bytes = vec![0u8; values.len() * size];
    for (value, out) in values.iter().zip(bytes.chunks_exact_mut(size)) {
        value.write_le(out);
    }
    bytes
}

/// Decode little-endian bytes; a trailing partial element is ignored
pub fn decode<T: Element>(bytes: &[u8]) -> Vec<T> {
    bytes.chunks_exact(T::TYPE.size()).map(T::read_le).collect()
}

/// Encode into an existing buffer of exactly matching length
pub fn encode_into<T: Element>(values: &[T], out: &mut [u8]) -> bool {
    let size = T::TYPE.size();
    if out.len() != values.len() * size {
        return false;
    }
    for (value, chunk) in values.iter().zip(out.chunks_exact_mut(size)) {
        value.write_le(chunk);
    }
    true
}
