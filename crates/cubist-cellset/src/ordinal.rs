//! Ordinal to axis-index mapping
//!
//! The server enumerates the cross-product of all axis tuples with axis 0
//! (columns) varying fastest, then axis 1 (rows), then any title axes.
//! An ordinal is therefore a mixed-radix number whose digits are the
//! per-axis tuple indices, least significant digit first.

use crate::error::{CellsetError, Result};

/// Converts between linear ordinals and per-axis tuple indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrdinalMapper {
    counts: Vec<u64>,
    cardinality: u64,
}

impl OrdinalMapper {
    /// Build a mapper from per-axis tuple counts, fastest axis first.
    ///
    /// No axes at all describes a single-cell cellset.
    pub fn new(counts: Vec<u64>) -> Result<Self> {
        let cardinality = counts
            .iter()
            .try_fold(1u64, |acc, &c| acc.checked_mul(c))
            .ok_or_else(|| {
                CellsetError::MalformedCellsetMetadata(format!(
                    "axis cardinalities {:?} overflow the ordinal space",
                    counts
                ))
            })?;
        Ok(Self {
            counts,
            cardinality,
        })
    }

    pub fn axis_counts(&self) -> &[u64] {
        &self.counts
    }

    /// Total number of cells: the product of all axis counts.
    pub fn cardinality(&self) -> u64 {
        self.cardinality
    }

    pub fn is_empty(&self) -> bool {
        self.cardinality == 0
    }

    /// Split an ordinal into one tuple index per axis.
    pub fn decompose(&self, ordinal: u64) -> Result<Vec<usize>> {
        if ordinal >= self.cardinality {
            return Err(CellsetError::OrdinalOutOfRange {
                ordinal,
                cardinality: self.cardinality,
            });
        }
        let mut rest = ordinal;
        let mut indices = Vec::with_capacity(self.counts.len());
        for &count in &self.counts {
            indices.push((rest % count) as usize);
            rest /= count;
        }
        Ok(indices)
    }

    /// Inverse of [`decompose`](Self::decompose).
    pub fn compose(&self, indices: &[usize]) -> Result<u64> {
        if indices.len() != self.counts.len() {
            return Err(CellsetError::InvalidArgument(format!(
                "expected {} axis indices, got {}",
                self.counts.len(),
                indices.len()
            )));
        }
        let mut ordinal = 0u64;
        let mut stride = 1u64;
        for (&index, &count) in indices.iter().zip(&self.counts) {
            let index = index as u64;
            if index >= count {
                return Err(CellsetError::OrdinalOutOfRange {
                    ordinal: ordinal + index * stride,
                    cardinality: self.cardinality,
                });
            }
            ordinal += index * stride;
            stride *= count;
        }
        Ok(ordinal)
    }
}
