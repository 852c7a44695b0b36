//! Batch sizing for objects larger than device memory.
//!
//! A batched plan processes the largest objects in fixed-size chunks. The
//! last chunk carries the remainder when the object size is not a multiple
//! of the batch size.

use crate::error::{ForgeResult, TaskForgeError};

const KB: usize = 1000;
const MB: usize = 1000 * KB;
const GB: usize = 1000 * MB;

/// Parse a human size string: `"512MB"`, `"2GB"`, `"64KB"` or plain bytes
pub fn parse_size(input: &str) -> ForgeResult<usize> {
    let trimmed = input.trim();
    let upper = trimmed.to_ascii_uppercase();

    let (digits, unit) = if let Some(n) = upper.strip_suffix("GB") {
        (n, GB)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, MB)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, KB)
    } else if let Some(n) = upper.strip_suffix('B') {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };

    let digits = digits.trim();
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TaskForgeError::InvalidBatchSize(format!(
            "'{}' is not a size (expected e.g. 512MB, 2GB, 4096)",
            input
        )));
    }

    let value: usize = digits
        .parse()
        .map_err(|_| TaskForgeError::InvalidBatchSize(format!("'{}' is out of range", input)))?;
    let bytes = value
        .checked_mul(unit)
        .ok_or_else(|| TaskForgeError::InvalidBatchSize(format!("'{}' is out of range", input)))?;

    if bytes == 0 {
        return Err(TaskForgeError::InvalidBatchSize(format!(
            "'{}' must be greater than zero",
            input
        )));
    }
    Ok(bytes)
}

/// One chunk of a batched execution, in bytes relative to object start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchChunk {
    pub index: usize,
    pub byte_offset: usize,
    pub byte_len: usize,
}

impl BatchChunk {
    pub fn element_offset(&self, element_size: usize) -> usize {
        self.byte_offset / element_size
    }

    pub fn elements(&self, element_size: usize) -> usize {
        self.byte_len / element_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfiguration {
    /// Bytes per full chunk, a multiple of `element_size`
    pub batch_bytes: usize,
    pub total_bytes: usize,
    pub element_size: usize,
    pub total_chunks: usize,
    pub remaining_bytes: usize,
}

impl BatchConfiguration {
    pub fn compute(total_bytes: usize, element_size: usize, batch_bytes: usize) -> ForgeResult<Self> {
        if element_size == 0 {
            return Err(TaskForgeError::InternalError(
                "batch element size is zero".to_string(),
            ));
        }
        if batch_bytes < element_size {
            return Err(TaskForgeError::InvalidBatchSize(format!(
                "{} bytes is smaller than one {}-byte element",
                batch_bytes, element_size
            )));
        }

        let batch_bytes = batch_bytes - batch_bytes % element_size;
        Ok(Self {
            batch_bytes,
            total_bytes,
            element_size,
            total_chunks: total_bytes / batch_bytes,
            remaining_bytes: total_bytes % batch_bytes,
        })
    }

    /// Number of chunks including the remainder chunk
    pub fn chunk_count(&self) -> usize {
        let count = self.total_chunks + usize::from(self.remaining_bytes > 0);
        count.max(1)
    }

    /// Device bytes needed per batched object
    pub fn device_bytes(&self) -> usize {
        self.batch_bytes.min(self.total_bytes)
    }

    pub fn chunks(&self) -> Vec<BatchChunk> {
        let mut chunks: Vec<BatchChunk> = (0..self.total_chunks)
            .map(|index| BatchChunk {
                index,
                byte_offset: index * self.batch_bytes,
                byte_len: self.batch_bytes,
            })
            .collect();
        if self.remaining_bytes > 0 || chunks.is_empty() {
            chunks.push(BatchChunk {
                index: self.total_chunks,
                byte_offset: self.total_chunks * self.batch_bytes,
                byte_len: self.remaining_bytes,
            });
        }
        chunks
    }
}
