use ndarray::{Array1, Array2, Array3, ArrayView2, Axis, concatenate, s};
use rand::Rng;
use rayon::prelude::*;

use crate::Real;
use crate::activations::{softmax_columns, tanh, tanh_derivative};
use crate::batch::Alignment;
use crate::embeddings::init_matrix;
use crate::errors::{ModelError, Result};
use crate::gradients::ParamSlot;
use crate::masking::MaskInfo;
use crate::model_config::{ModelConfig, SourceChannel};

/// What the recurrence hands to the output layer after the forward sweep
pub struct OracleInput<'a> {
    /// `[hidden, batch, total_timesteps]`
    pub top_hidden: &'a Array3<Real>,
    /// First decoder timestep
    pub boundary: usize,
    /// `[batch, tgt_len]`
    pub targets: &'a Array2<usize>,
    /// One mask per timestep
    pub masks: &'a [MaskInfo],
    /// `[hidden, batch, num_source_hidden_vecs]`
    pub source_hidden: Option<&'a Array3<Real>>,
    /// `[hidden, batch, tgt_len]`, copy model only
    pub position_vectors: Option<&'a Array3<Real>>,
    /// `[batch, tgt_len]`
    pub alignments: Option<&'a Array2<Alignment>>,
}

impl OracleInput<'_> {
    pub fn tgt_len(&self) -> usize {
        self.targets.ncols()
    }

    pub fn batch_size(&self) -> usize {
        self.targets.nrows()
    }

    pub fn decoder_hidden(&self, offset: usize) -> ArrayView2<'_, Real> {
        self.top_hidden.slice(s![.., .., self.boundary + offset])
    }

    pub fn decoder_mask(&self, offset: usize) -> &MaskInfo {
        &self.masks[self.boundary + offset]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Costs {
    pub total: Real,
    pub word: Option<Real>,
    pub pos: Option<Real>,
}

/// Weight gradients of the output layer
#[derive(Debug, Clone)]
pub struct OutputGradients {
    pub softmax: Array2<Real>,
    pub feed: Option<Array2<Real>>,
}

#[derive(Debug, Clone)]
pub struct OracleGradients {
    pub weights: OutputGradients,
    /// `[hidden, batch, tgt_len]`, indexed by decoder offset
    pub top_hidden: Array3<Real>,
    /// `[hidden, batch, num_source_hidden_vecs]`
    pub source_hidden: Option<Array3<Real>>,
    /// Embedding gradients produced inside the output layer (copy model null/eos rows)
    pub positional_embedding: Vec<(usize, Array1<Real>)>,
}

#[derive(Debug, Clone)]
pub struct OracleOutput {
    pub costs: Costs,
    /// `None` when evaluated with `is_test`
    pub grads: Option<OracleGradients>,
}

/// Output-layer cost and gradient oracle
pub trait OutputLayer {
    fn cost_grad(&self, input: &OracleInput, is_test: bool) -> Result<OracleOutput>;
}

/// Softmax cross-entropy over the vocabulary.
///
/// With attention or the copy model, the top hidden state is first combined with an
/// auxiliary source vector: `h̃ = tanh(W_feed · [aux; h])`, `logits = W_soft · h̃`.
/// Attention uses dot-product scores over the source hidden states; the copy model
/// uses the stored position vectors.
#[derive(Clone, Debug)]
pub struct SoftmaxOutputLayer {
    /// `[vocab, hidden]`
    pub w_soft: Array2<Real>,
    /// `[hidden, 2 * hidden]`
    pub w_feed: Option<Array2<Real>>,
    channel: SourceChannel,
    null_index: usize,
    eos_index: usize,
}

struct StepGradients {
    softmax: Array2<Real>,
    feed: Option<Array2<Real>>,
    top_hidden: Array2<Real>,
    source_hidden: Option<Array3<Real>>,
    positional_embedding: Vec<(usize, Array1<Real>)>,
}

struct StepResult {
    cost: Real,
    grads: Option<StepGradients>,
}

/// Attention weights per row and the resulting context vectors
struct Attention {
    context: Array2<Real>,
    weights: Vec<Array1<Real>>,
}

/// Softmax over the real entries only; padded entries and fully padded inputs get zero weight
fn masked_softmax(scores: &Array1<Real>, real: &[bool]) -> Array1<Real> {
    let max_val = scores
        .iter()
        .zip(real)
        .filter(|&(_, &is_real)| is_real)
        .map(|(&score, _)| score)
        .fold(Real::NEG_INFINITY, Real::max);
    if max_val == Real::NEG_INFINITY {
        return Array1::zeros(scores.len());
    }
    let exp: Array1<Real> = scores
        .iter()
        .zip(real)
        .map(|(&x, &is_real)| if is_real { (x - max_val).exp() } else { 0.0 })
        .collect();
    let sum_exp = exp.sum();
    exp / sum_exp
}

/// Dot-product attention over the source positions that are real for each row.
/// `source_masks[p]` is the mask of source timestep `p`.
fn attend(source_hidden: &Array3<Real>, source_masks: &[MaskInfo], hidden: &Array2<Real>) -> Attention {
    let (dim, batch, positions) = source_hidden.dim();
    let mut context = Array2::zeros((dim, batch));
    let mut weights = Vec::with_capacity(batch);
    for row in 0..batch {
        let real: Vec<bool> = (0..positions)
            .map(|p| source_masks.get(p).is_some_and(|mask| mask.is_real(row)))
            .collect();
        let sources = source_hidden.slice(s![.., row, ..]);
        let scores = sources.t().dot(&hidden.column(row));
        let alpha = masked_softmax(&scores, &real);
        context.column_mut(row).assign(&sources.dot(&alpha));
        weights.push(alpha);
    }
    Attention { context, weights }
}

impl SoftmaxOutputLayer {
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, init_scale: Real, rng: &mut R) -> Result<Self> {
        let channel = config.channel()?;
        let h = config.hidden_size;
        let w_soft = init_matrix((config.vocab_size, h), init_scale, rng)?;
        let w_feed = if channel.uses_feed_layer() {
            Some(init_matrix((h, 2 * h), init_scale, rng)?)
        } else {
            None
        };
        Ok(Self {
            w_soft,
            w_feed,
            channel,
            null_index: config.null_position_index,
            eos_index: config.eos_position_index,
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.w_soft.ncols()
    }

    pub fn vocab_size(&self) -> usize {
        self.w_soft.nrows()
    }

    pub fn param(&self, slot: ParamSlot) -> Option<&Array2<Real>> {
        match slot {
            ParamSlot::Softmax => Some(&self.w_soft),
            ParamSlot::Feed => self.w_feed.as_ref(),
            _ => None,
        }
    }

    pub fn param_mut(&mut self, slot: ParamSlot) -> Option<&mut Array2<Real>> {
        match slot {
            ParamSlot::Softmax => Some(&mut self.w_soft),
            ParamSlot::Feed => self.w_feed.as_mut(),
            _ => None,
        }
    }

    pub fn parameters(&self) -> usize {
        self.w_soft.len() + self.w_feed.as_ref().map_or(0, |w| w.len())
    }

    fn validate(&self, input: &OracleInput) -> Result<()> {
        let h = self.hidden_size();
        let (dim, batch, timesteps) = input.top_hidden.dim();
        if dim != h || batch != input.batch_size() {
            return Err(ModelError::shape(format!(
                "top hidden cache {:?} does not match hidden size {h} and batch {}",
                input.top_hidden.dim(),
                input.batch_size()
            )));
        }
        if input.boundary + input.tgt_len() != timesteps || input.masks.len() != timesteps {
            return Err(ModelError::shape(format!(
                "{timesteps} cached timesteps, {} masks, boundary {} and {} decoder steps",
                input.masks.len(),
                input.boundary,
                input.tgt_len()
            )));
        }
        if let Some(&token) = input.targets.iter().find(|&&t| t >= self.vocab_size()) {
            return Err(ModelError::shape(format!(
                "target {token} outside softmax of size {}",
                self.vocab_size()
            )));
        }
        if self.channel.uses_feed_layer() && self.w_feed.as_ref().map(|w| w.dim()) != Some((h, 2 * h)) {
            return Err(ModelError::shape(format!(
                "{:?} output layer needs a ({h}, {}) feed matrix",
                self.channel,
                2 * h
            )));
        }
        match self.channel {
            SourceChannel::Attention if input.source_hidden.is_none() => Err(ModelError::shape(
                "attention output layer called without source hidden states",
            )),
            SourceChannel::Copy
                if input.position_vectors.is_none()
                    || input.alignments.is_none()
                    || input.source_hidden.is_none() =>
            {
                Err(ModelError::shape(
                    "copy output layer called without position vectors, alignments or source hidden states",
                ))
            }
            _ => Ok(()),
        }
    }

    fn auxiliary(&self, input: &OracleInput, offset: usize, hidden: &Array2<Real>) -> Option<(Array2<Real>, Option<Attention>)> {
        match self.channel {
            SourceChannel::Attention => input.source_hidden.map(|source_hidden| {
                let attention = attend(source_hidden, input.masks, hidden);
                (attention.context.clone(), Some(attention))
            }),
            SourceChannel::Copy => input
                .position_vectors
                .map(|vectors| (vectors.slice(s![.., .., offset]).to_owned(), None)),
            _ => None,
        }
    }

    fn decoder_step(&self, input: &OracleInput, offset: usize, is_test: bool) -> Result<StepResult> {
        let h = self.hidden_size();
        let hidden = input.decoder_hidden(offset).to_owned();
        let mask = input.decoder_mask(offset);

        let aux = self.auxiliary(input, offset, &hidden);
        let (features, stacked) = match (&aux, &self.w_feed) {
            (Some((aux_vectors, _)), Some(w_feed)) => {
                let stacked = concatenate(Axis(0), &[aux_vectors.view(), hidden.view()])?;
                (tanh(w_feed.dot(&stacked).view()), Some(stacked))
            }
            _ => (hidden.clone(), None),
        };

        let probs = softmax_columns(&self.w_soft.dot(&features));
        let mut cost = 0.0;
        for &row in &mask.unmasked_ids {
            let target = input.targets[[row, offset]];
            cost -= probs[[target, row]].max(Real::MIN_POSITIVE).ln();
        }
        if is_test {
            return Ok(StepResult { cost, grads: None });
        }

        // softmax - one_hot(target), zero for padded rows
        let mut d_logits = probs;
        mask.zero_masked(&mut d_logits);
        for &row in &mask.unmasked_ids {
            d_logits[[input.targets[[row, offset]], row]] -= 1.0;
        }
        let d_softmax = d_logits.dot(&features.t());
        let d_features = self.w_soft.t().dot(&d_logits);

        let (Some(stacked), Some(w_feed), Some((_, attention))) = (stacked, &self.w_feed, aux) else {
            return Ok(StepResult {
                cost,
                grads: Some(StepGradients {
                    softmax: d_softmax,
                    feed: None,
                    top_hidden: d_features,
                    source_hidden: None,
                    positional_embedding: Vec::new(),
                }),
            });
        };

        let d_pre = &d_features * &tanh_derivative(&features);
        let d_feed = d_pre.dot(&stacked.t());
        let d_stacked = w_feed.t().dot(&d_pre);
        let d_aux = d_stacked.slice(s![0..h, ..]);
        let mut d_hidden = d_stacked.slice(s![h.., ..]).to_owned();

        let mut d_source = input.source_hidden.map(|source| Array3::zeros(source.dim()));
        let mut positional_embedding = Vec::new();

        match (attention, input.source_hidden, d_source.as_mut()) {
            (Some(attention), Some(source_hidden), Some(d_source)) => {
                for &row in &mask.unmasked_ids {
                    let sources = source_hidden.slice(s![.., row, ..]);
                    let alpha = &attention.weights[row];
                    let d_context = d_aux.column(row);
                    let d_alpha = sources.t().dot(&d_context);
                    let weighted = alpha.dot(&d_alpha);
                    let d_scores = alpha * &d_alpha.mapv(|v| v - weighted);

                    let mut d_hidden_row = d_hidden.column_mut(row);
                    d_hidden_row += &sources.dot(&d_scores);
                    for (p, (&a, &ds)) in alpha.iter().zip(d_scores.iter()).enumerate() {
                        let mut slot = d_source.slice_mut(s![.., row, p]);
                        slot.scaled_add(a, &d_context);
                        slot.scaled_add(ds, &hidden.column(row));
                    }
                }
            }
            (None, _, Some(d_source)) => {
                let alignments = input.alignments.ok_or_else(|| {
                    ModelError::shape("copy output layer called without alignments")
                })?;
                for &row in &mask.unmasked_ids {
                    match alignments[[row, offset]] {
                        Alignment::Source(p) => {
                            let mut slot = d_source.slice_mut(s![.., row, p]);
                            slot += &d_aux.column(row);
                        }
                        Alignment::Null => positional_embedding
                            .push((self.null_index, d_aux.column(row).to_owned())),
                        Alignment::Eos => positional_embedding
                            .push((self.eos_index, d_aux.column(row).to_owned())),
                    }
                }
            }
            _ => {}
        }

        Ok(StepResult {
            cost,
            grads: Some(StepGradients {
                softmax: d_softmax,
                feed: Some(d_feed),
                top_hidden: d_hidden,
                source_hidden: d_source,
                positional_embedding,
            }),
        })
    }
}

impl OutputLayer for SoftmaxOutputLayer {
    fn cost_grad(&self, input: &OracleInput, is_test: bool) -> Result<OracleOutput> {
        self.validate(input)?;
        let tgt_len = input.tgt_len();

        // Decoder steps are independent given the top hidden states; collect keeps
        // step order so the sums below are deterministic.
        let steps = (0..tgt_len)
            .into_par_iter()
            .map(|offset| self.decoder_step(input, offset, is_test))
            .collect::<Result<Vec<_>>>()?;

        let total: Real = steps.iter().map(|step| step.cost).sum();
        let costs = Costs {
            total,
            word: Some(total),
            pos: None,
        };
        tracing::debug!(cost = total, decoder_steps = tgt_len, "Output layer evaluated");

        if is_test {
            return Ok(OracleOutput { costs, grads: None });
        }

        let h = self.hidden_size();
        let mut weights = OutputGradients {
            softmax: Array2::zeros(self.w_soft.dim()),
            feed: self.w_feed.as_ref().map(|w| Array2::zeros(w.dim())),
        };
        let mut top_hidden = Array3::zeros((h, input.batch_size(), tgt_len));
        let mut source_hidden = match self.channel {
            SourceChannel::Attention | SourceChannel::Copy => {
                input.source_hidden.map(|source| Array3::zeros(source.dim()))
            }
            _ => None,
        };
        let mut positional_embedding = Vec::new();

        for (offset, step) in steps.into_iter().enumerate() {
            let Some(grads) = step.grads else {
                continue;
            };
            weights.softmax += &grads.softmax;
            if let (Some(total_feed), Some(feed)) = (weights.feed.as_mut(), grads.feed.as_ref()) {
                *total_feed += feed;
            }
            top_hidden
                .slice_mut(s![.., .., offset])
                .assign(&grads.top_hidden);
            if let (Some(total_source), Some(source)) =
                (source_hidden.as_mut(), grads.source_hidden.as_ref())
            {
                *total_source += source;
            }
            positional_embedding.extend(grads.positional_embedding);
        }

        Ok(OracleOutput {
            costs,
            grads: Some(OracleGradients {
                weights,
                top_hidden,
                source_hidden,
                positional_embedding,
            }),
        })
    }
}
