use ndarray::{Array2, ArrayView1};

use crate::Real;
use crate::errors::{ModelError, Result};

/// Per-timestep padding mask over the batch.
///
/// `mask[row]` is `true` when the row holds a real token at this timestep. The same
/// mask applies to every layer of the timestep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskInfo {
    pub mask: Vec<bool>,
    pub unmasked_ids: Vec<usize>,
    pub masked_ids: Vec<usize>,
}

impl MaskInfo {
    pub fn from_mask(mask: Vec<bool>) -> Self {
        let (unmasked_ids, masked_ids): (Vec<usize>, Vec<usize>) =
            (0..mask.len()).partition(|&row| mask[row]);
        Self {
            mask,
            unmasked_ids,
            masked_ids,
        }
    }

    /// All rows real
    pub fn all_real(batch_size: usize) -> Self {
        Self::from_mask(vec![true; batch_size])
    }

    /// Rows whose token equals `pad_id` are padding
    pub fn from_tokens(tokens: ArrayView1<usize>, pad_id: usize) -> Self {
        Self::from_mask(tokens.iter().map(|&token| token != pad_id).collect())
    }

    pub fn batch_size(&self) -> usize {
        self.mask.len()
    }

    pub fn num_real(&self) -> usize {
        self.unmasked_ids.len()
    }

    pub fn is_real(&self, row: usize) -> bool {
        self.mask.get(row).copied().unwrap_or(false)
    }

    /// Zero the padded columns of a `[rows, batch]` matrix in place
    pub fn zero_masked(&self, values: &mut Array2<Real>) {
        for &row in &self.masked_ids {
            values.column_mut(row).fill(0.0);
        }
    }

    /// Copy of `values` with padded columns zeroed
    pub fn restrict(&self, values: &Array2<Real>) -> Array2<Real> {
        let mut restricted = values.clone();
        self.zero_masked(&mut restricted);
        restricted
    }

    pub(crate) fn check_batch(&self, timestep: usize, batch_size: usize) -> Result<()> {
        if self.mask.len() != batch_size {
            return Err(ModelError::shape(format!(
                "mask at timestep {timestep} covers {} rows, batch has {batch_size}",
                self.mask.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn require_real(&self, timestep: usize) -> Result<()> {
        if self.unmasked_ids.is_empty() {
            return Err(ModelError::Mask {
                timestep,
                message: "no real tokens in a decoder step of a positional model".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_partition_ids() {
        let info = MaskInfo::from_mask(vec![true, false, true, false]);
        assert_eq!(info.unmasked_ids, vec![0, 2]);
        assert_eq!(info.masked_ids, vec![1, 3]);
        assert_eq!(info.num_real(), 2);
        assert!(info.is_real(2));
        assert!(!info.is_real(3));
        assert!(!info.is_real(9));
    }

    #[test]
    fn test_zero_masked_columns() {
        let info = MaskInfo::from_mask(vec![true, false]);
        let mut values = array![[1.0, 2.0], [3.0, 4.0]];
        info.zero_masked(&mut values);
        assert_eq!(values, array![[1.0, 0.0], [3.0, 0.0]]);
    }

    #[test]
    fn test_from_tokens() {
        let tokens = array![5usize, 0, 7];
        let info = MaskInfo::from_tokens(tokens.view(), 0);
        assert_eq!(info.mask, vec![true, false, true]);
    }

    #[test]
    fn test_require_real_on_empty_mask() {
        let info = MaskInfo::from_mask(vec![false, false]);
        assert!(matches!(
            info.require_real(4),
            Err(ModelError::Mask { timestep: 4, .. })
        ));
    }
}
