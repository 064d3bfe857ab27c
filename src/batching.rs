//! Order-preserving partitioning of identifier lists into fixed-size batches.

use serde::Serialize;

use crate::error::{BulkCheckError, Result};

/// A contiguous run of items and where it starts in the original list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Batch<T> {
    /// Position of this batch in the batch sequence (drives token rotation)
    pub index: usize,
    /// Absolute index of `items[0]` in the original list
    pub start: usize,
    pub items: Vec<T>,
}

impl<T> Batch<T> {
    /// Absolute indices covered by this batch.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.start..self.start + self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Split `items` into batches of `size`; batch `k` starts at `k * size`.
///
/// The last batch may be short. Fails only when `size` is zero.
pub fn make_batches<T: Clone>(items: &[T], size: usize) -> Result<Vec<Batch<T>>> {
    if size == 0 {
        return Err(BulkCheckError::ValidationError(
            "batch size must be at least 1".to_string(),
        ));
    }

    Ok(items
        .chunks(size)
        .enumerate()
        .map(|(index, chunk)| Batch {
            index,
            start: index * size,
            items: chunk.to_vec(),
        })
        .collect())
}
