//! Sparse embedding gradient accumulation.
//!
//! Every timestep and positional lookup that touches the embedding table contributes an
//! `(index, vector)` pair. Contributions are appended as they arrive and reduced once at
//! the end of the call into one summed column per distinct index.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use ndarray::{Array1, Array2, ArrayView1};

use crate::Real;
use crate::errors::{ModelError, Result};

/// Append-only list of embedding gradient contributions
#[derive(Debug, Clone)]
pub struct EmbeddingGradAccumulator {
    dim: usize,
    capacity: Option<usize>,
    indices: Vec<usize>,
    grads: Vec<Array1<Real>>,
}

impl EmbeddingGradAccumulator {
    /// Unbounded accumulator for `dim`-sized gradient vectors
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            capacity: None,
            indices: Vec::new(),
            grads: Vec::new(),
        }
    }

    /// Accumulator sized for exactly `capacity` contributions; pushing more is an error
    pub fn with_capacity(dim: usize, capacity: usize) -> Self {
        Self {
            dim,
            capacity: Some(capacity),
            indices: Vec::with_capacity(capacity),
            grads: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, index: usize, grad: ArrayView1<Real>) -> Result<()> {
        if let Some(capacity) = self.capacity
            && self.indices.len() >= capacity
        {
            return Err(ModelError::AggregationOverflow {
                capacity,
                count: self.indices.len() + 1,
            });
        }
        if grad.len() != self.dim {
            return Err(ModelError::shape(format!(
                "embedding gradient of length {} for index {index}, expected {}",
                grad.len(),
                self.dim
            )));
        }
        self.indices.push(index);
        self.grads.push(grad.to_owned());
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Sum contributions per index. Output indices are ascending.
    pub fn aggregate(self) -> SparseGradient {
        let mut summed: BTreeMap<usize, Array1<Real>> = BTreeMap::new();
        for (index, grad) in self.indices.into_iter().zip(self.grads) {
            match summed.entry(index) {
                Entry::Occupied(mut total) => *total.get_mut() += &grad,
                Entry::Vacant(slot) => {
                    slot.insert(grad);
                }
            }
        }

        let mut values = Array2::zeros((self.dim, summed.len()));
        let mut indices = Vec::with_capacity(summed.len());
        for (slot, (index, total)) in summed.into_iter().enumerate() {
            values.column_mut(slot).assign(&total);
            indices.push(index);
        }
        tracing::trace!(unique = indices.len(), "Aggregated embedding gradients");
        SparseGradient { indices, values }
    }
}

/// Compacted embedding gradient: column `k` of `values` belongs to `indices[k]`
#[derive(Debug, Clone, PartialEq)]
pub struct SparseGradient {
    pub indices: Vec<usize>,
    /// `[dim, indices.len()]`
    pub values: Array2<Real>,
}

impl SparseGradient {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<ArrayView1<'_, Real>> {
        self.indices
            .binary_search(&index)
            .ok()
            .map(|slot| self.values.column(slot))
    }

    /// Scatter into a dense `[dim, vocab_size]` matrix
    pub fn to_dense(&self, vocab_size: usize) -> Result<Array2<Real>> {
        let mut dense = Array2::zeros((self.values.nrows(), vocab_size));
        for (slot, &index) in self.indices.iter().enumerate() {
            if index >= vocab_size {
                return Err(ModelError::shape(format!(
                    "gradient index {index} outside vocabulary of size {vocab_size}"
                )));
            }
            dense.column_mut(index).assign(&self.values.column(slot));
        }
        Ok(dense)
    }

    pub fn squared_norm(&self) -> Real {
        self.values.iter().map(|v| v * v).sum()
    }
}
