//! Central finite-difference check of analytic gradients.

use std::fmt;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{info, warn};

use crate::Real;
use crate::batch::Batch;
use crate::errors::{ModelError, Result};
use crate::gradients::ParamSlot;
use crate::lstm_unit::RecurrentUnit;
use crate::output_layer::SoftmaxOutputLayer;
use crate::seq2seq::Seq2Seq;

#[derive(Debug, Clone, Copy)]
pub struct GradCheckOptions {
    pub epsilon: Real,
    /// Entries checked per slot; `0` checks every entry
    pub samples_per_slot: usize,
    pub seed: u64,
}

impl Default for GradCheckOptions {
    fn default() -> Self {
        Self {
            epsilon: 1e-5,
            samples_per_slot: 10,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlotReport {
    pub slot: ParamSlot,
    pub checked: usize,
    pub max_abs_error: Real,
    pub max_rel_error: Real,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GradCheckReport {
    pub slots: Vec<SlotReport>,
}

impl GradCheckReport {
    pub fn max_abs_error(&self) -> Real {
        self.slots.iter().map(|s| s.max_abs_error).fold(0.0, Real::max)
    }

    pub fn max_rel_error(&self) -> Real {
        self.slots.iter().map(|s| s.max_rel_error).fold(0.0, Real::max)
    }
}

impl fmt::Display for GradCheckReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<12} {:>8} {:>14} {:>14}", "slot", "checked", "max abs err", "max rel err")?;
        for report in &self.slots {
            writeln!(
                f,
                "{:<12} {:>8} {:>14.3e} {:>14.3e}",
                report.slot.to_string(),
                report.checked,
                report.max_abs_error,
                report.max_rel_error
            )?;
        }
        Ok(())
    }
}

fn relative_error(analytic: Real, numeric: Real) -> Real {
    let scale = analytic.abs().max(numeric.abs()).max(1e-8);
    (analytic - numeric).abs() / scale
}

/// Compare analytic gradients against central differences `(J(θ+ε) - J(θ-ε)) / 2ε`.
///
/// Parameters are restored after every perturbation. Embedding entries are drawn from the
/// columns the batch actually reads.
pub fn check_gradients<U: RecurrentUnit>(
    seq2seq: &mut Seq2Seq<U, SoftmaxOutputLayer>,
    batch: &Batch,
    options: &GradCheckOptions,
) -> Result<GradCheckReport> {
    if options.epsilon <= 0.0 {
        return Err(ModelError::config(format!(
            "finite-difference epsilon must be positive, got {}",
            options.epsilon
        )));
    }
    let grads = seq2seq
        .cost_grad(batch, false)?
        .grads
        .ok_or_else(|| ModelError::GradientError {
            message: "cost/gradient call returned no gradients".to_string(),
        })?;
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut slots = Vec::new();

    for slot in grads.slots() {
        let (rows, cols) = seq2seq
            .param(slot)
            .map(|p| p.dim())
            .ok_or_else(|| ModelError::GradientError {
                message: format!("no parameter block for {slot}"),
            })?;
        if rows == 0 || cols == 0 {
            continue;
        }

        let entries: Vec<(usize, usize)> = if options.samples_per_slot == 0 {
            (0..rows).flat_map(|r| (0..cols).map(move |c| (r, c))).collect()
        } else {
            (0..options.samples_per_slot)
                .map(|_| {
                    let col = match slot {
                        ParamSlot::Embedding if !grads.embedding.is_empty() => {
                            grads.embedding.indices[rng.random_range(0..grads.embedding.len())]
                        }
                        _ => rng.random_range(0..cols),
                    };
                    (rng.random_range(0..rows), col)
                })
                .collect()
        };

        let mut report = SlotReport {
            slot,
            checked: 0,
            max_abs_error: 0.0,
            max_rel_error: 0.0,
        };
        for (row, col) in entries {
            let numeric = central_difference(seq2seq, batch, slot, row, col, options.epsilon)?;
            let analytic = grads.entry(slot, row, col);
            report.checked += 1;
            report.max_abs_error = report.max_abs_error.max((analytic - numeric).abs());
            report.max_rel_error = report.max_rel_error.max(relative_error(analytic, numeric));
        }
        info!(
            slot = %slot,
            checked = report.checked,
            max_abs_error = report.max_abs_error,
            "Gradient check"
        );
        if report.max_rel_error > 1e-4 {
            warn!(slot = %slot, max_rel_error = report.max_rel_error, "Gradient mismatch");
        }
        slots.push(report);
    }
    Ok(GradCheckReport { slots })
}

fn central_difference<U: RecurrentUnit>(
    seq2seq: &mut Seq2Seq<U, SoftmaxOutputLayer>,
    batch: &Batch,
    slot: ParamSlot,
    row: usize,
    col: usize,
    epsilon: Real,
) -> Result<Real> {
    let original = swap_entry(seq2seq, slot, row, col, None)?;
    swap_entry(seq2seq, slot, row, col, Some(original + epsilon))?;
    let plus = seq2seq.cost_grad(batch, true);
    swap_entry(seq2seq, slot, row, col, Some(original - epsilon))?;
    let minus = seq2seq.cost_grad(batch, true);
    swap_entry(seq2seq, slot, row, col, Some(original))?;
    Ok((plus?.costs.total - minus?.costs.total) / (2.0 * epsilon))
}

/// Read an entry, optionally overwriting it
fn swap_entry<U>(
    seq2seq: &mut Seq2Seq<U, SoftmaxOutputLayer>,
    slot: ParamSlot,
    row: usize,
    col: usize,
    value: Option<Real>,
) -> Result<Real> {
    let entry = seq2seq
        .param_mut(slot)
        .and_then(|p| p.get_mut((row, col)))
        .ok_or_else(|| ModelError::GradientError {
            message: format!("{slot} has no entry ({row}, {col})"),
        })?;
    let previous = *entry;
    if let Some(value) = value {
        *entry = value;
    }
    Ok(previous)
}
