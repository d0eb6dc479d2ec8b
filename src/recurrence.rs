//! Time-layer recurrence driver.
//!
//! The forward sweep runs every layer of a timestep before moving to the next timestep,
//! switching from encoder to decoder weights at the boundary. The top layer's hidden
//! states are cached time-major for the output layer. The backward sweep visits the same
//! (layer, timestep) pairs in exact reverse order, consuming each cached unit state once.

use ndarray::{Array2, Array3, Axis, concatenate, s};
use tracing::{debug, instrument};

use crate::Real;
use crate::aggregator::EmbeddingGradAccumulator;
use crate::batch::{Batch, BatchDims};
use crate::errors::{ModelError, Result};
use crate::gradients::ModelGradients;
use crate::lstm_unit::{RecurrentUnit, UnitContext};
use crate::model::Seq2SeqModel;
use crate::model_config::{ModelConfig, SourceChannel};
use crate::output_layer::{Costs, OracleGradients, OracleInput, OutputLayer};
use crate::positional::{ExtractQuery, PositionalGradSink, SideData, SourceExtractor, extractor_for};

/// Everything the forward sweep leaves behind for the oracle and the backward sweep
pub struct ForwardCache<S> {
    /// `states[layer][timestep]`, taken by the backward sweep
    pub states: Vec<Vec<Option<S>>>,
    /// `[hidden, batch, total_timesteps]`
    pub top_hidden: Array3<Real>,
    /// `[hidden, batch, num_source_hidden_vecs]` when a source channel is active
    pub source_hidden: Option<Array3<Real>>,
    /// `[hidden, batch, tgt_len]`, copy model only
    pub position_vectors: Option<Array3<Real>>,
    /// Extractor bookkeeping per decoder offset
    pub side_data: Vec<SideData>,
}

impl<S> ForwardCache<S> {
    /// Number of unit states still held
    pub fn num_states(&self) -> usize {
        self.states
            .iter()
            .map(|layer| layer.iter().filter(|state| state.is_some()).count())
            .sum()
    }
}

#[derive(Debug, Clone)]
pub struct CostGradOutput {
    pub costs: Costs,
    /// `None` when evaluated with `is_test`
    pub grads: Option<ModelGradients>,
}

/// One validated cost/gradient call over a batch
pub struct Recurrence<'a, U: RecurrentUnit> {
    config: &'a ModelConfig,
    model: &'a Seq2SeqModel,
    unit: &'a U,
    batch: &'a Batch,
    dims: BatchDims,
    channel: SourceChannel,
    extractor: Box<dyn SourceExtractor>,
}

impl<'a, U: RecurrentUnit> Recurrence<'a, U> {
    /// Validate configuration, batch and parameter shapes before any computation
    pub fn new(
        config: &'a ModelConfig,
        model: &'a Seq2SeqModel,
        unit: &'a U,
        batch: &'a Batch,
    ) -> Result<Self> {
        config.validate()?;
        let channel = config.channel()?;
        let dims = batch.validate(config, channel)?;
        model.validate_shapes(config)?;
        Ok(Self {
            config,
            model,
            unit,
            batch,
            dims,
            channel,
            extractor: extractor_for(channel, config),
        })
    }

    pub fn dims(&self) -> BatchDims {
        self.dims
    }

    pub fn channel(&self) -> SourceChannel {
        self.channel
    }

    fn context(&self, layer: usize, timestep: usize, is_test: bool) -> UnitContext {
        UnitContext {
            layer,
            timestep,
            boundary: self.dims.boundary,
            is_test,
        }
    }

    fn top_layer(&self) -> usize {
        self.config.num_layers - 1
    }

    #[instrument(skip(self), fields(channel = ?self.channel, timesteps = self.dims.total_timesteps))]
    pub fn forward(&self, is_test: bool) -> Result<ForwardCache<U::State>> {
        let h = self.config.hidden_size;
        let num_layers = self.config.num_layers;
        let BatchDims {
            batch_size,
            total_timesteps,
            boundary,
            tgt_len,
            num_source_hidden_vecs,
            ..
        } = self.dims;
        let top = self.top_layer();

        let mut states: Vec<Vec<Option<U::State>>> = (0..num_layers)
            .map(|_| (0..total_timesteps).map(|_| None).collect())
            .collect();
        let mut top_hidden = Array3::zeros((h, batch_size, total_timesteps));
        let mut source_hidden = (self.channel.uses_source_hidden() && num_source_hidden_vecs == 0)
            .then(|| Array3::zeros((h, batch_size, 0)));
        let mut position_vectors = (self.channel == SourceChannel::Copy)
            .then(|| Array3::zeros((h, batch_size, tgt_len)));
        let mut side_data = Vec::with_capacity(tgt_len);

        let zeros = Array2::<Real>::zeros((h, batch_size));

        for t in 0..total_timesteps {
            let mask = &self.batch.masks[t];
            let mut layer_output: Option<Array2<Real>> = None;

            for l in 0..num_layers {
                let ctx = self.context(l, t, is_test);
                let decoder = ctx.is_decoder();

                let (prev_hidden, prev_cell) = match t.checked_sub(1) {
                    None => (zeros.clone(), zeros.clone()),
                    Some(prev_t) => {
                        let prev = states[l][prev_t].as_ref().ok_or_else(|| {
                            ModelError::GradientError {
                                message: format!("missing state at layer {l} timestep {prev_t}"),
                            }
                        })?;
                        let hidden = if l == top {
                            top_hidden.slice(s![.., .., prev_t]).to_owned()
                        } else {
                            U::hidden(prev).clone()
                        };
                        (mask.restrict(&hidden), mask.restrict(U::cell(prev)))
                    }
                };

                let mut input = match layer_output.take() {
                    Some(lower) => lower,
                    None => self
                        .model
                        .embeddings
                        .lookup(self.batch.input.column(t).iter().copied())?,
                };

                if l == 0 && decoder {
                    let offset = t - boundary;
                    let extraction = match self.batch.alignments.as_ref() {
                        Some(alignments) if self.channel.is_positional() => {
                            self.extractor.extract(&ExtractQuery {
                                offset,
                                timestep: t,
                                embeddings: &self.model.embeddings,
                                input: &self.batch.input,
                                source_hidden: source_hidden.as_ref(),
                                alignments: alignments.column(offset),
                                mask,
                            })?
                        }
                        _ => Default::default(),
                    };
                    if let Some(concat) = extraction.concat {
                        input = concatenate(Axis(0), &[input.view(), concat.view()])?;
                    }
                    if let (Some(vectors), Some(copied)) = (position_vectors.as_mut(), extraction.copied) {
                        vectors.slice_mut(s![.., .., offset]).assign(&copied);
                    }
                    side_data.push(extraction.side);
                }

                mask.zero_masked(&mut input);
                let weights = self.model.block(l, decoder);
                let (state, hidden) = self
                    .unit
                    .forward(weights, &input, &prev_hidden, &prev_cell, &ctx)?;
                states[l][t] = Some(state);

                if l == top {
                    top_hidden.slice_mut(s![.., .., t]).assign(&hidden);
                    if self.channel.uses_source_hidden() && t + 1 == num_source_hidden_vecs {
                        source_hidden =
                            Some(top_hidden.slice(s![.., .., 0..num_source_hidden_vecs]).to_owned());
                    }
                } else {
                    layer_output = Some(hidden);
                }
            }
        }

        debug!(
            states = total_timesteps * num_layers,
            source_hidden = source_hidden.is_some(),
            "Forward sweep complete"
        );
        Ok(ForwardCache {
            states,
            top_hidden,
            source_hidden,
            position_vectors,
            side_data,
        })
    }

    /// Embedding gradient vectors the backward sweep will push
    fn embedding_contributions(&self, cache: &ForwardCache<U::State>, oracle: &OracleGradients) -> usize {
        let lookups: usize = self.batch.masks.iter().map(|mask| mask.num_real()).sum();
        let positional: usize = cache
            .side_data
            .iter()
            .map(|side| self.extractor.embedding_contributions(side))
            .sum();
        lookups + positional + oracle.positional_embedding.len()
    }

    #[instrument(skip_all, fields(timesteps = self.dims.total_timesteps))]
    pub fn backward(
        &self,
        mut cache: ForwardCache<U::State>,
        oracle: OracleGradients,
    ) -> Result<ModelGradients> {
        let h = self.config.hidden_size;
        let num_layers = self.config.num_layers;
        let BatchDims {
            batch_size,
            total_timesteps,
            boundary,
            tgt_len,
            num_source_hidden_vecs,
            ..
        } = self.dims;
        let top = self.top_layer();

        let capacity = self.embedding_contributions(&cache, &oracle);
        let mut embedding = EmbeddingGradAccumulator::with_capacity(h, capacity);

        let OracleGradients {
            weights: output,
            top_hidden: d_top,
            source_hidden: oracle_source,
            positional_embedding,
        } = oracle;

        for (index, grad) in &positional_embedding {
            embedding.push(*index, grad.view())?;
        }

        let expected_top = (h, batch_size, tgt_len);
        if d_top.dim() != expected_top {
            return Err(ModelError::shape(format!(
                "output layer returned top hidden gradient {:?}, expected {expected_top:?}",
                d_top.dim()
            )));
        }
        let expected_source = (h, batch_size, num_source_hidden_vecs);
        if let Some(source) = oracle_source.as_ref()
            && source.dim() != expected_source
        {
            return Err(ModelError::shape(format!(
                "output layer returned source hidden gradient {:?}, expected {expected_source:?}",
                source.dim()
            )));
        }

        let mut d_source = if self.channel.uses_source_hidden() {
            Some(oracle_source.unwrap_or_else(|| Array3::zeros(expected_source)))
        } else {
            None
        };

        let mut encoder: Vec<Array2<Real>> = self
            .model
            .encoder
            .iter()
            .map(|block| Array2::zeros(block.dim()))
            .collect();
        let mut decoder: Vec<Array2<Real>> = self
            .model
            .decoder
            .iter()
            .map(|block| Array2::zeros(block.dim()))
            .collect();
        let mut dh: Vec<Array2<Real>> = vec![Array2::zeros((h, batch_size)); num_layers];
        let mut dc: Vec<Array2<Real>> = vec![Array2::zeros((h, batch_size)); num_layers];

        for t in (0..total_timesteps).rev() {
            let mask = &self.batch.masks[t];

            for l in (0..num_layers).rev() {
                let ctx = self.context(l, t, false);
                let decoder_step = ctx.is_decoder();

                if l == top {
                    if decoder_step {
                        dh[l] += &d_top.slice(s![.., .., t - boundary]);
                    }
                    if t < num_source_hidden_vecs
                        && let Some(d_source) = d_source.as_ref()
                    {
                        dh[l] += &d_source.slice(s![.., .., t]);
                    }
                }

                let state = cache.states[l][t].take().ok_or_else(|| ModelError::GradientError {
                    message: format!("state at layer {l} timestep {t} missing or already consumed"),
                })?;
                let weights = self.model.block(l, decoder_step);
                let grads = self.unit.backward(weights, state, &dc[l], &dh[l], &ctx)?;

                let input_rows = self.config.input_rows(l, decoder_step);
                if grads.d_input.dim() != (input_rows + h, batch_size)
                    || grads.d_cell.dim() != (h, batch_size)
                    || grads.d_weights.dim() != weights.dim()
                {
                    return Err(ModelError::shape(format!(
                        "unit gradients at layer {l} timestep {t}: input {:?}, cell {:?}, weights {:?}; expected {:?}, {:?}, {:?}",
                        grads.d_input.dim(),
                        grads.d_cell.dim(),
                        grads.d_weights.dim(),
                        (input_rows + h, batch_size),
                        (h, batch_size),
                        weights.dim()
                    )));
                }

                let mut handoff = grads.d_input.slice(s![input_rows.., ..]).to_owned();
                mask.zero_masked(&mut handoff);
                let mut d_cell = grads.d_cell;
                mask.zero_masked(&mut d_cell);
                dh[l] = handoff;
                dc[l] = d_cell;

                if decoder_step {
                    decoder[l] += &grads.d_weights;
                } else {
                    encoder[l] += &grads.d_weights;
                }

                let lower = grads.d_input.slice(s![0..h, ..]);
                if l == 0 {
                    for &row in &mask.unmasked_ids {
                        embedding.push(self.batch.input[[row, t]], lower.column(row))?;
                    }
                    if decoder_step && input_rows > h {
                        let side = cache.side_data.get(t - boundary).ok_or_else(|| {
                            ModelError::GradientError {
                                message: format!("no positional side data for timestep {t}"),
                            }
                        })?;
                        let mut sink = PositionalGradSink {
                            embedding: &mut embedding,
                            source_hidden: d_source.as_mut(),
                        };
                        self.extractor.scatter(
                            side,
                            grads.d_input.slice(s![h..input_rows, ..]),
                            &mut sink,
                        )?;
                    }
                } else {
                    let below = &mut dh[l - 1];
                    for &row in &mask.unmasked_ids {
                        let mut column = below.column_mut(row);
                        column += &lower.column(row);
                    }
                }
            }
        }

        let embedding = embedding.aggregate();
        debug!(
            embedding_rows = embedding.len(),
            capacity = capacity,
            "Backward sweep complete"
        );
        Ok(ModelGradients {
            encoder,
            decoder,
            embedding,
            output,
        })
    }
}

/// Cost and (unless `is_test`) gradients of all parameters for one batch
#[instrument(skip_all, fields(batch_size = batch.input.nrows(), is_test = is_test))]
pub fn cost_grad<U, O>(
    config: &ModelConfig,
    model: &Seq2SeqModel,
    unit: &U,
    output: &O,
    batch: &Batch,
    is_test: bool,
) -> Result<CostGradOutput>
where
    U: RecurrentUnit,
    O: OutputLayer + ?Sized,
{
    let recurrence = Recurrence::new(config, model, unit, batch)?;
    let dims = recurrence.dims();
    let cache = recurrence.forward(is_test)?;

    let oracle = output.cost_grad(
        &OracleInput {
            top_hidden: &cache.top_hidden,
            boundary: dims.boundary,
            targets: &batch.targets,
            masks: &batch.masks,
            source_hidden: cache.source_hidden.as_ref(),
            position_vectors: cache.position_vectors.as_ref(),
            alignments: batch.alignments.as_ref(),
        },
        is_test,
    )?;

    let grads = match oracle.grads {
        Some(oracle_grads) if !is_test => Some(recurrence.backward(cache, oracle_grads)?),
        _ => None,
    };
    debug!(cost = oracle.costs.total, "Cost evaluated");
    Ok(CostGradOutput {
        costs: oracle.costs,
        grads,
    })
}
