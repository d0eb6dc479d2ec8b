use ndarray::{Array2, ArrayView1};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::Real;
use crate::errors::{ModelError, Result};

/// Shared word embedding table, one column per vocabulary entry: `[hidden, vocab]`
#[derive(Clone, Debug)]
pub struct Embeddings {
    pub table: Array2<Real>,
}

impl Embeddings {
    pub fn new(table: Array2<Real>) -> Self {
        Self { table }
    }

    pub fn random<R: Rng + ?Sized>(
        hidden_size: usize,
        vocab_size: usize,
        init_scale: Real,
        rng: &mut R,
    ) -> Result<Self> {
        Ok(Self {
            table: init_matrix((hidden_size, vocab_size), init_scale, rng)?,
        })
    }

    pub fn dim(&self) -> usize {
        self.table.nrows()
    }

    pub fn vocab_size(&self) -> usize {
        self.table.ncols()
    }

    pub fn column(&self, index: usize) -> ArrayView1<'_, Real> {
        self.table.column(index)
    }

    /// Gather one column per token id into a `[hidden, batch]` matrix.
    ///
    /// Ids are validated with the batch before the recurrence starts, so an
    /// out-of-range id here is a caller contract violation.
    pub fn lookup<I>(&self, token_ids: I) -> Result<Array2<Real>>
    where
        I: ExactSizeIterator<Item = usize>,
    {
        let mut gathered = Array2::zeros((self.dim(), token_ids.len()));
        for (row, token_id) in token_ids.enumerate() {
            if token_id >= self.vocab_size() {
                return Err(ModelError::shape(format!(
                    "token id {token_id} outside embedding table of {} entries",
                    self.vocab_size()
                )));
            }
            gathered.column_mut(row).assign(&self.table.column(token_id));
        }
        Ok(gathered)
    }

    pub fn parameters(&self) -> usize {
        self.table.len()
    }
}

/// Gaussian initialization with standard deviation `init_scale`
pub fn init_matrix<R: Rng + ?Sized>(
    shape: (usize, usize),
    init_scale: Real,
    rng: &mut R,
) -> Result<Array2<Real>> {
    let normal = Normal::new(0.0, init_scale)
        .map_err(|e| ModelError::config(format!("invalid init scale {init_scale}: {e}")))?;
    Ok(Array2::from_shape_fn(shape, |_| normal.sample(&mut *rng)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_lookup_gathers_columns() {
        let embeddings = Embeddings::new(array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
        let gathered = embeddings.lookup([2usize, 0, 2].into_iter()).unwrap();
        assert_eq!(gathered, array![[3.0, 1.0, 3.0], [6.0, 4.0, 6.0]]);
    }

    #[test]
    fn test_lookup_out_of_range() {
        let embeddings = Embeddings::new(Array2::zeros((2, 3)));
        assert!(matches!(
            embeddings.lookup([3usize].into_iter()),
            Err(ModelError::Shape { .. })
        ));
    }
}
