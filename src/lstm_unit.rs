use ndarray::{Array2, Axis, concatenate, s};

use crate::Real;
use crate::activations::{sigmoid, sigmoid_derivative, tanh, tanh_derivative};
use crate::errors::{ModelError, Result};
use crate::model_config::{ModelConfig, Precision};

/// Where a unit invocation sits in the unrolled recurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitContext {
    pub layer: usize,
    pub timestep: usize,
    /// First decoder timestep
    pub boundary: usize,
    pub is_test: bool,
}

impl UnitContext {
    pub fn is_decoder(&self) -> bool {
        self.timestep >= self.boundary
    }
}

/// Result of a unit's reverse operation
#[derive(Debug, Clone)]
pub struct UnitGradients {
    /// Gradient with respect to the previous cell state
    pub d_cell: Array2<Real>,
    /// Gradient with respect to `[input; prev_hidden]`; the trailing `hidden` rows
    /// belong to the previous hidden state
    pub d_input: Array2<Real>,
    pub d_weights: Array2<Real>,
}

/// Elementary recurrent unit used at every (layer, timestep) of the recurrence.
///
/// `forward` returns whatever state `backward` needs; the driver keeps it until the
/// mirrored backward step and hands it back by value.
pub trait RecurrentUnit {
    type State;

    fn forward(
        &self,
        weights: &Array2<Real>,
        input: &Array2<Real>,
        prev_hidden: &Array2<Real>,
        prev_cell: &Array2<Real>,
        ctx: &UnitContext,
    ) -> Result<(Self::State, Array2<Real>)>;

    fn backward(
        &self,
        weights: &Array2<Real>,
        state: Self::State,
        d_cell: &Array2<Real>,
        d_hidden: &Array2<Real>,
        ctx: &UnitContext,
    ) -> Result<UnitGradients>;

    fn hidden(state: &Self::State) -> &Array2<Real>;

    fn cell(state: &Self::State) -> &Array2<Real>;
}

/// Activations of one LSTM step kept for the reverse pass
#[derive(Debug, Clone)]
pub struct LstmState {
    /// `[input; prev_hidden]`
    pub stacked_input: Array2<Real>,
    pub prev_cell: Array2<Real>,
    pub input_gate: Array2<Real>,
    pub forget_gate: Array2<Real>,
    pub output_gate: Array2<Real>,
    pub candidate: Array2<Real>,
    pub cell: Array2<Real>,
    pub tanh_cell: Array2<Real>,
    pub hidden: Array2<Real>,
}

/// Bias-free LSTM cell with gate rows ordered input, forget, output, candidate:
///
/// ```text
/// [i; f; o; a] = [σ; σ; σ; tanh](W · [x; h_prev])
/// c = f ⊙ c_prev + i ⊙ a
/// h = o ⊙ tanh(c)
/// ```
///
/// Without a bias, an all-zero input and state yields exactly zero `c` and `h`,
/// which keeps padded rows at zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct LstmUnit {
    pub precision: Precision,
}

impl LstmUnit {
    pub fn new(precision: Precision) -> Self {
        Self { precision }
    }

    pub fn from_config(config: &ModelConfig) -> Self {
        Self::new(config.precision)
    }

    fn check_forward_shapes(
        weights: &Array2<Real>,
        input: &Array2<Real>,
        prev_hidden: &Array2<Real>,
        prev_cell: &Array2<Real>,
        ctx: &UnitContext,
    ) -> Result<()> {
        let hidden = prev_hidden.nrows();
        let batch = prev_hidden.ncols();
        if prev_cell.dim() != (hidden, batch) || input.ncols() != batch {
            return Err(ModelError::shape(format!(
                "layer {} timestep {}: input {:?}, hidden {:?}, cell {:?} disagree",
                ctx.layer,
                ctx.timestep,
                input.dim(),
                prev_hidden.dim(),
                prev_cell.dim()
            )));
        }
        if weights.dim() != (4 * hidden, input.nrows() + hidden) {
            return Err(ModelError::shape(format!(
                "layer {} timestep {}: weights {:?}, expected ({}, {})",
                ctx.layer,
                ctx.timestep,
                weights.dim(),
                4 * hidden,
                input.nrows() + hidden
            )));
        }
        Ok(())
    }
}

impl RecurrentUnit for LstmUnit {
    type State = LstmState;

    fn forward(
        &self,
        weights: &Array2<Real>,
        input: &Array2<Real>,
        prev_hidden: &Array2<Real>,
        prev_cell: &Array2<Real>,
        ctx: &UnitContext,
    ) -> Result<(LstmState, Array2<Real>)> {
        Self::check_forward_shapes(weights, input, prev_hidden, prev_cell, ctx)?;
        let h = prev_hidden.nrows();

        let stacked_input = concatenate(Axis(0), &[input.view(), prev_hidden.view()])?;
        let gates = weights.dot(&stacked_input);

        let input_gate = sigmoid(gates.slice(s![0..h, ..]));
        let forget_gate = sigmoid(gates.slice(s![h..2 * h, ..]));
        let output_gate = sigmoid(gates.slice(s![2 * h..3 * h, ..]));
        let candidate = tanh(gates.slice(s![3 * h.., ..]));

        let mut cell = &forget_gate * prev_cell + &input_gate * &candidate;
        self.precision.quantize(&mut cell);
        let tanh_cell = cell.mapv(Real::tanh);
        let mut hidden = &output_gate * &tanh_cell;
        self.precision.quantize(&mut hidden);

        let state = LstmState {
            stacked_input,
            prev_cell: prev_cell.clone(),
            input_gate,
            forget_gate,
            output_gate,
            candidate,
            cell,
            tanh_cell,
            hidden: hidden.clone(),
        };
        Ok((state, hidden))
    }

    fn backward(
        &self,
        weights: &Array2<Real>,
        state: LstmState,
        d_cell: &Array2<Real>,
        d_hidden: &Array2<Real>,
        ctx: &UnitContext,
    ) -> Result<UnitGradients> {
        let (h, batch) = state.hidden.dim();
        if d_cell.dim() != (h, batch) || d_hidden.dim() != (h, batch) {
            return Err(ModelError::shape(format!(
                "layer {} timestep {}: upstream gradients {:?}/{:?}, state {:?}",
                ctx.layer,
                ctx.timestep,
                d_cell.dim(),
                d_hidden.dim(),
                (h, batch)
            )));
        }

        let LstmState {
            stacked_input,
            prev_cell,
            input_gate,
            forget_gate,
            output_gate,
            candidate,
            tanh_cell,
            ..
        } = state;

        let d_output_gate = d_hidden * &tanh_cell;
        let d_cell_total = d_cell + &(d_hidden * &output_gate * &tanh_derivative(&tanh_cell));

        let d_input_gate = &d_cell_total * &candidate;
        let d_forget_gate = &d_cell_total * &prev_cell;
        let d_candidate = &d_cell_total * &input_gate;
        let d_prev_cell = &d_cell_total * &forget_gate;

        let mut d_gates = Array2::zeros((4 * h, batch));
        d_gates
            .slice_mut(s![0..h, ..])
            .assign(&(d_input_gate * &sigmoid_derivative(&input_gate)));
        d_gates
            .slice_mut(s![h..2 * h, ..])
            .assign(&(d_forget_gate * &sigmoid_derivative(&forget_gate)));
        d_gates
            .slice_mut(s![2 * h..3 * h, ..])
            .assign(&(d_output_gate * &sigmoid_derivative(&output_gate)));
        d_gates
            .slice_mut(s![3 * h.., ..])
            .assign(&(d_candidate * &tanh_derivative(&candidate)));

        Ok(UnitGradients {
            d_cell: d_prev_cell,
            d_input: weights.t().dot(&d_gates),
            d_weights: d_gates.dot(&stacked_input.t()),
        })
    }

    fn hidden(state: &LstmState) -> &Array2<Real> {
        &state.hidden
    }

    fn cell(state: &LstmState) -> &Array2<Real> {
        &state.cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn ctx() -> UnitContext {
        UnitContext {
            layer: 0,
            timestep: 0,
            boundary: 1,
            is_test: false,
        }
    }

    #[test]
    fn test_zero_input_gives_zero_state() {
        let unit = LstmUnit::default();
        let weights = Array2::from_elem((8, 4), 0.3);
        let zeros = Array2::zeros((2, 3));
        let (state, hidden) = unit.forward(&weights, &zeros, &zeros, &zeros, &ctx()).unwrap();
        assert!(hidden.iter().all(|&v| v == 0.0));
        assert!(state.cell.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_weight_shape_mismatch() {
        let unit = LstmUnit::default();
        let weights = Array2::zeros((8, 5));
        let zeros = Array2::zeros((2, 1));
        assert!(matches!(
            unit.forward(&weights, &zeros, &zeros, &zeros, &ctx()),
            Err(ModelError::Shape { .. })
        ));
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let unit = LstmUnit::default();
        let weights = array![
            [0.1, -0.2, 0.3],
            [0.4, 0.1, -0.1],
            [-0.3, 0.2, 0.2],
            [0.5, -0.4, 0.1]
        ];
        let input = array![[0.7, -0.2], [0.1, 0.9]];
        let prev_hidden = array![[0.3, -0.5]];
        let prev_cell = array![[-0.2, 0.4]];

        // Loss = sum(h) + 2 * sum(c)
        let loss = |w: &Array2<Real>| {
            let (state, hidden) = unit
                .forward(w, &input, &prev_hidden, &prev_cell, &ctx())
                .unwrap();
            hidden.sum() + 2.0 * state.cell.sum()
        };

        let (state, _) = unit
            .forward(&weights, &input, &prev_hidden, &prev_cell, &ctx())
            .unwrap();
        let grads = unit
            .backward(
                &weights,
                state,
                &Array2::from_elem((1, 2), 2.0),
                &Array2::ones((1, 2)),
                &ctx(),
            )
            .unwrap();

        let eps = 1e-6;
        for ((r, c), &analytic) in grads.d_weights.indexed_iter() {
            let mut plus = weights.clone();
            plus[[r, c]] += eps;
            let mut minus = weights.clone();
            minus[[r, c]] -= eps;
            let numeric = (loss(&plus) - loss(&minus)) / (2.0 * eps);
            assert_abs_diff_eq!(analytic, numeric, epsilon = 1e-7);
        }
        assert_eq!(grads.d_input.dim(), (3, 2));
        assert_eq!(grads.d_cell.dim(), (1, 2));
    }
}
