use ndarray::Array2;

use crate::errors::{ModelError, Result};
use crate::masking::MaskInfo;
use crate::model_config::{ModelConfig, SourceChannel};

/// Source alignment of one decoder row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// No aligned source word
    Null,
    /// Aligned past the last source word
    Eos,
    /// Aligned to source timestep `p`
    Source(usize),
}

impl Alignment {
    /// Negative positions are null alignments; positions at or past
    /// `num_positions` point at the end of the source sentence.
    pub fn from_raw(raw: i64, num_positions: usize) -> Self {
        if raw < 0 {
            Alignment::Null
        } else if raw as usize >= num_positions {
            Alignment::Eos
        } else {
            Alignment::Source(raw as usize)
        }
    }
}

/// Per-call dimensions derived from a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchDims {
    pub batch_size: usize,
    pub src_max_len: usize,
    pub tgt_len: usize,
    /// `src_max_len + tgt_len - 1`
    pub total_timesteps: usize,
    /// Number of encoder timesteps; index of the first decoder timestep
    pub boundary: usize,
    pub num_source_hidden_vecs: usize,
}

/// A padded batch of parallel source/target sequences.
///
/// `input` holds the encoder tokens in its first `src_max_len - 1` columns followed by
/// the decoder input tokens; `targets` holds the decoder output tokens.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, total_timesteps]`
    pub input: Array2<usize>,
    /// `[batch, tgt_len]`
    pub targets: Array2<usize>,
    /// One mask per timestep
    pub masks: Vec<MaskInfo>,
    pub src_max_len: usize,
    /// `[batch, tgt_len]`, required by positional models
    pub alignments: Option<Array2<Alignment>>,
    pub num_source_hidden_vecs: usize,
}

impl Batch {
    pub fn new(
        input: Array2<usize>,
        targets: Array2<usize>,
        masks: Vec<MaskInfo>,
        src_max_len: usize,
    ) -> Result<Self> {
        if src_max_len == 0 {
            return Err(ModelError::shape("src_max_len must be at least 1"));
        }
        if targets.ncols() == 0 {
            return Err(ModelError::shape("batch has no decoder timesteps"));
        }
        let batch = Self {
            input,
            targets,
            masks,
            src_max_len,
            alignments: None,
            num_source_hidden_vecs: src_max_len - 1,
        };
        batch.check_shapes()?;
        Ok(batch)
    }

    /// Build a batch whose masks are derived from `pad_id` occurrences in `input`
    pub fn from_padded(
        input: Array2<usize>,
        targets: Array2<usize>,
        src_max_len: usize,
        pad_id: usize,
    ) -> Result<Self> {
        let masks = input
            .columns()
            .into_iter()
            .map(|column| MaskInfo::from_tokens(column, pad_id))
            .collect();
        Self::new(input, targets, masks, src_max_len)
    }

    pub fn with_alignments(mut self, alignments: Array2<Alignment>) -> Result<Self> {
        if alignments.dim() != self.targets.dim() {
            return Err(ModelError::shape(format!(
                "alignments shape {:?} does not match targets {:?}",
                alignments.dim(),
                self.targets.dim()
            )));
        }
        self.alignments = Some(alignments);
        Ok(self)
    }

    pub fn with_num_source_hidden_vecs(mut self, num_source_hidden_vecs: usize) -> Self {
        self.num_source_hidden_vecs = num_source_hidden_vecs;
        self
    }

    /// Last encoder timestep; fails for a batch assembled with `src_max_len == 0`
    fn boundary(&self) -> Result<usize> {
        self.src_max_len
            .checked_sub(1)
            .ok_or_else(|| ModelError::shape("src_max_len must be at least 1"))
    }

    pub fn dims(&self) -> Result<BatchDims> {
        let tgt_len = self.targets.ncols();
        let boundary = self.boundary()?;
        Ok(BatchDims {
            batch_size: self.input.nrows(),
            src_max_len: self.src_max_len,
            tgt_len,
            total_timesteps: boundary + tgt_len,
            boundary,
            num_source_hidden_vecs: self.num_source_hidden_vecs,
        })
    }

    fn check_shapes(&self) -> Result<()> {
        let batch_size = self.input.nrows();
        let expected_timesteps = self.boundary()? + self.targets.ncols();
        if self.input.ncols() != expected_timesteps {
            return Err(ModelError::shape(format!(
                "input has {} timesteps, expected src_max_len - 1 + tgt_len = {expected_timesteps}",
                self.input.ncols()
            )));
        }
        if self.targets.nrows() != batch_size {
            return Err(ModelError::shape(format!(
                "targets have {} rows, input has {batch_size}",
                self.targets.nrows()
            )));
        }
        if self.masks.len() != expected_timesteps {
            return Err(ModelError::shape(format!(
                "{} masks for {expected_timesteps} timesteps",
                self.masks.len()
            )));
        }
        for (timestep, mask) in self.masks.iter().enumerate() {
            mask.check_batch(timestep, batch_size)?;
        }
        Ok(())
    }

    /// Validate everything the recurrence relies on before the forward sweep starts.
    pub(crate) fn validate(&self, config: &ModelConfig, channel: SourceChannel) -> Result<BatchDims> {
        self.check_shapes()?;
        let dims = self.dims()?;

        if dims.batch_size == 0 {
            return Err(ModelError::shape("batch has no rows"));
        }
        if dims.num_source_hidden_vecs > dims.total_timesteps {
            return Err(ModelError::config(format!(
                "num_source_hidden_vecs {} exceeds total timesteps {}",
                dims.num_source_hidden_vecs, dims.total_timesteps
            )));
        }
        if let Some(&token) = self.input.iter().find(|&&token| token >= config.vocab_size) {
            return Err(ModelError::shape(format!(
                "input token {token} outside vocabulary of size {}",
                config.vocab_size
            )));
        }
        if let Some(&token) = self.targets.iter().find(|&&token| token >= config.vocab_size) {
            return Err(ModelError::shape(format!(
                "target token {token} outside vocabulary of size {}",
                config.vocab_size
            )));
        }

        if channel.is_positional() {
            if dims.num_source_hidden_vecs > dims.boundary {
                return Err(ModelError::config(format!(
                    "positional models need num_source_hidden_vecs <= {} encoder steps, got {}",
                    dims.boundary, dims.num_source_hidden_vecs
                )));
            }
            let alignments = self.alignments.as_ref().ok_or_else(|| {
                ModelError::config("positional model requires batch alignments")
            })?;
            if let Some(p) = alignments.iter().find_map(|alignment| match *alignment {
                Alignment::Source(p) if p >= dims.num_source_hidden_vecs => Some(p),
                _ => None,
            }) {
                return Err(ModelError::shape(format!(
                    "alignment position {p} outside {} source positions",
                    dims.num_source_hidden_vecs
                )));
            }
            for timestep in dims.boundary..dims.total_timesteps {
                self.masks[timestep].require_real(timestep)?;
            }
        }

        Ok(dims)
    }
}
