use ndarray::{Array2, ArrayView2};

use crate::Real;

/// Logistic sigmoid
///
/// sigmoid(x) = 1 / (1 + e^{-x})
#[inline]
pub fn sigmoid(x: ArrayView2<Real>) -> Array2<Real> {
    x.mapv(|val| 1.0 / (1.0 + (-val).exp()))
}

/// Derivative of sigmoid expressed through its output `s`
///
/// d/dx sigmoid(x) = s * (1 - s)
#[inline]
pub fn sigmoid_derivative(s: &Array2<Real>) -> Array2<Real> {
    s.mapv(|val| val * (1.0 - val))
}

#[inline]
pub fn tanh(x: ArrayView2<Real>) -> Array2<Real> {
    x.mapv(Real::tanh)
}

/// Derivative of tanh expressed through its output `t`
///
/// d/dx tanh(x) = 1 - t^2
#[inline]
pub fn tanh_derivative(t: &Array2<Real>) -> Array2<Real> {
    t.mapv(|val| 1.0 - val * val)
}

/// Column-wise softmax of a `[classes, batch]` matrix
pub fn softmax_columns(logits: &Array2<Real>) -> Array2<Real> {
    let mut probs = logits.clone();
    for mut column in probs.columns_mut() {
        let max_val = column.iter().copied().fold(Real::NEG_INFINITY, Real::max);
        column.mapv_inplace(|x| (x - max_val).exp());
        let sum_exp: Real = column.sum();
        column.mapv_inplace(|x| x / sum_exp);
    }
    probs
}
