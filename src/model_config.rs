use std::fs;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::Real;
use crate::errors::{ModelError, Result};

/// Positional alignment model injected into the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PositionalMode {
    /// No positional information (mode 0)
    #[default]
    None,

    /// Aligned source embedding concatenated onto the first decoder layer input (mode 1)
    ///
    /// - Adds `hidden_size` rows to the decoder's first-layer input
    /// - Gradient flows back into the embedding rows that were looked up
    EmbeddingConcat,

    /// Aligned source hidden state (or null/eos embedding) concatenated onto the
    /// first decoder layer input (mode 2)
    ///
    /// - Adds `hidden_size` rows to the decoder's first-layer input
    /// - Gradient is split between the null/eos embedding rows and the stored
    ///   source hidden states
    Pointer,

    /// Aligned source hidden state copied into a side buffer consumed by the
    /// output layer (mode 3)
    ///
    /// - Decoder input is unchanged
    /// - Gradient returns through the output layer's own channels
    Copy,
}

impl PositionalMode {
    pub fn is_active(self) -> bool {
        self != PositionalMode::None
    }

    /// Rows concatenated under the first decoder layer's input
    pub fn extra_input_rows(self, hidden_size: usize) -> usize {
        match self {
            PositionalMode::EmbeddingConcat | PositionalMode::Pointer => hidden_size,
            PositionalMode::None | PositionalMode::Copy => 0,
        }
    }
}

impl TryFrom<u8> for PositionalMode {
    type Error = ModelError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PositionalMode::None),
            1 => Ok(PositionalMode::EmbeddingConcat),
            2 => Ok(PositionalMode::Pointer),
            3 => Ok(PositionalMode::Copy),
            other => Err(ModelError::config(format!(
                "positional mode must be in 0..=3, got {other}"
            ))),
        }
    }
}

/// Storage precision for recurrent states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    /// States are rounded through `f32` after every unit step
    Single,
    #[default]
    Double,
}

impl Precision {
    pub fn quantize(self, values: &mut Array2<Real>) {
        if self == Precision::Single {
            values.mapv_inplace(|x| x as f32 as Real);
        }
    }
}

/// The single source-side channel active for a call.
///
/// Resolved once from `positional_mode` and `attention` so the recurrence never
/// re-inspects the raw flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceChannel {
    Plain,
    Attention,
    EmbeddingConcat,
    Pointer,
    Copy,
}

impl SourceChannel {
    /// Whether the top-layer source hidden states are exposed to the output layer
    /// or the extractor (and therefore receive gradient).
    pub fn uses_source_hidden(self) -> bool {
        matches!(
            self,
            SourceChannel::Attention | SourceChannel::Pointer | SourceChannel::Copy
        )
    }

    pub fn is_positional(self) -> bool {
        matches!(
            self,
            SourceChannel::EmbeddingConcat | SourceChannel::Pointer | SourceChannel::Copy
        )
    }

    /// Whether the output layer carries a feed projection over `[aux; h]`
    pub fn uses_feed_layer(self) -> bool {
        matches!(self, SourceChannel::Attention | SourceChannel::Copy)
    }
}

/// Configuration for model architecture
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of stacked LSTM layers (shared by encoder and decoder)
    pub num_layers: usize,

    /// LSTM hidden size; also the embedding dimension
    pub hidden_size: usize,

    /// Rows of the shared embedding table and columns of the softmax
    pub vocab_size: usize,

    /// Positional alignment model
    #[serde(default)]
    pub positional_mode: PositionalMode,

    /// Global attention over the source hidden states in the output layer
    ///
    /// Mutually exclusive with any positional mode.
    #[serde(default)]
    pub attention: bool,

    /// Embedding row used for null alignments
    #[serde(default)]
    pub null_position_index: usize,

    /// Embedding row used for end-of-sequence alignments
    #[serde(default)]
    pub eos_position_index: usize,

    #[serde(default)]
    pub precision: Precision,
}

impl ModelConfig {
    pub fn new(num_layers: usize, hidden_size: usize, vocab_size: usize) -> Self {
        Self {
            num_layers,
            hidden_size,
            vocab_size,
            positional_mode: PositionalMode::None,
            attention: false,
            null_position_index: 0,
            eos_position_index: 0,
            precision: Precision::Double,
        }
    }

    pub fn with_positional_mode(
        mut self,
        mode: PositionalMode,
        null_position_index: usize,
        eos_position_index: usize,
    ) -> Self {
        self.positional_mode = mode;
        self.null_position_index = null_position_index;
        self.eos_position_index = eos_position_index;
        self
    }

    pub fn with_attention(mut self, attention: bool) -> Self {
        self.attention = attention;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    /// Input rows of an encoder or decoder block at `layer`, excluding the
    /// trailing hidden-state rows.
    pub fn input_rows(&self, layer: usize, decoder: bool) -> usize {
        if layer == 0 && decoder {
            self.hidden_size + self.positional_mode.extra_input_rows(self.hidden_size)
        } else {
            self.hidden_size
        }
    }

    /// Expected shape of a recurrent weight block: `[4h, input + h]`
    pub fn block_shape(&self, layer: usize, decoder: bool) -> (usize, usize) {
        (
            4 * self.hidden_size,
            self.input_rows(layer, decoder) + self.hidden_size,
        )
    }

    /// Resolve the source channel, rejecting conflicting flags.
    pub fn channel(&self) -> Result<SourceChannel> {
        match (self.positional_mode, self.attention) {
            (PositionalMode::None, false) => Ok(SourceChannel::Plain),
            (PositionalMode::None, true) => Ok(SourceChannel::Attention),
            (mode, true) => Err(ModelError::config(format!(
                "positional mode {mode:?} cannot be combined with attention"
            ))),
            (PositionalMode::EmbeddingConcat, false) => Ok(SourceChannel::EmbeddingConcat),
            (PositionalMode::Pointer, false) => Ok(SourceChannel::Pointer),
            (PositionalMode::Copy, false) => Ok(SourceChannel::Copy),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_layers == 0 {
            return Err(ModelError::config("num_layers must be at least 1"));
        }
        if self.hidden_size == 0 {
            return Err(ModelError::config("hidden_size must be at least 1"));
        }
        if self.vocab_size == 0 {
            return Err(ModelError::config("vocab_size must be at least 1"));
        }
        let channel = self.channel()?;
        if channel.is_positional() {
            for (name, index) in [
                ("null_position_index", self.null_position_index),
                ("eos_position_index", self.eos_position_index),
            ] {
                if index >= self.vocab_size {
                    return Err(ModelError::config(format!(
                        "{name} {index} outside vocabulary of size {}",
                        self.vocab_size
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: ModelConfig =
            serde_json::from_str(json).map_err(|e| ModelError::Serialization {
                source: Box::new(e),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration from a JSON file
    pub fn load_json(path: &str) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(ModelError::from)?;
        let config = Self::from_json_str(&data)?;
        tracing::info!(
            path = path,
            num_layers = config.num_layers,
            hidden_size = config.hidden_size,
            "Loaded model configuration"
        );
        Ok(config)
    }

    pub fn save_json(&self, path: &str) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| ModelError::Serialization {
            source: Box::new(e),
        })?;
        fs::write(path, json).map_err(ModelError::from)?;
        Ok(())
    }
}
