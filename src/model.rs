use ndarray::Array2;
use rand::Rng;
use tracing::info;

use crate::Real;
use crate::embeddings::{Embeddings, init_matrix};
use crate::errors::{ModelError, Result};
use crate::gradients::ParamSlot;
use crate::model_config::ModelConfig;

/// Recurrent parameters: one weight block per layer for each side, plus the shared
/// embedding table.
#[derive(Clone, Debug)]
pub struct Seq2SeqModel {
    /// `[4h, h + h]` per layer
    pub encoder: Vec<Array2<Real>>,
    /// `[4h, input_rows + h]` per layer; layer 0 grows with the positional model
    pub decoder: Vec<Array2<Real>>,
    pub embeddings: Embeddings,
}

impl Seq2SeqModel {
    /// Gaussian initialization with standard deviation `init_scale`
    pub fn new<R: Rng + ?Sized>(config: &ModelConfig, init_scale: Real, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let mut encoder = Vec::with_capacity(config.num_layers);
        let mut decoder = Vec::with_capacity(config.num_layers);
        for layer in 0..config.num_layers {
            encoder.push(init_matrix(config.block_shape(layer, false), init_scale, rng)?);
        }
        for layer in 0..config.num_layers {
            decoder.push(init_matrix(config.block_shape(layer, true), init_scale, rng)?);
        }
        let embeddings =
            Embeddings::random(config.hidden_size, config.vocab_size, init_scale, rng)?;

        let model = Self {
            encoder,
            decoder,
            embeddings,
        };
        info!(
            num_layers = config.num_layers,
            hidden_size = config.hidden_size,
            parameters = model.parameters(),
            "Initialized recurrent parameters"
        );
        Ok(model)
    }

    pub fn num_layers(&self) -> usize {
        self.encoder.len()
    }

    /// Weight block used at `layer`; `decoder` selects the decoder side
    pub fn block(&self, layer: usize, decoder: bool) -> &Array2<Real> {
        if decoder {
            &self.decoder[layer]
        } else {
            &self.encoder[layer]
        }
    }

    pub fn param(&self, slot: ParamSlot) -> Option<&Array2<Real>> {
        match slot {
            ParamSlot::Encoder(layer) => self.encoder.get(layer),
            ParamSlot::Decoder(layer) => self.decoder.get(layer),
            ParamSlot::Embedding => Some(&self.embeddings.table),
            ParamSlot::Softmax | ParamSlot::Feed => None,
        }
    }

    pub fn param_mut(&mut self, slot: ParamSlot) -> Option<&mut Array2<Real>> {
        match slot {
            ParamSlot::Encoder(layer) => self.encoder.get_mut(layer),
            ParamSlot::Decoder(layer) => self.decoder.get_mut(layer),
            ParamSlot::Embedding => Some(&mut self.embeddings.table),
            ParamSlot::Softmax | ParamSlot::Feed => None,
        }
    }

    pub fn parameters(&self) -> usize {
        self.encoder
            .iter()
            .chain(&self.decoder)
            .map(|block| block.len())
            .sum::<usize>()
            + self.embeddings.parameters()
    }

    /// Check every block and the embedding table against `config`
    pub fn validate_shapes(&self, config: &ModelConfig) -> Result<()> {
        if self.encoder.len() != config.num_layers || self.decoder.len() != config.num_layers {
            return Err(ModelError::shape(format!(
                "{} encoder and {} decoder blocks for {} layers",
                self.encoder.len(),
                self.decoder.len(),
                config.num_layers
            )));
        }
        for layer in 0..config.num_layers {
            for decoder in [false, true] {
                let expected = config.block_shape(layer, decoder);
                let actual = self.block(layer, decoder).dim();
                if actual != expected {
                    let side = if decoder { "decoder" } else { "encoder" };
                    return Err(ModelError::shape(format!(
                        "{side} block {layer} is {actual:?}, expected {expected:?}"
                    )));
                }
            }
        }
        if self.embeddings.table.dim() != (config.hidden_size, config.vocab_size) {
            return Err(ModelError::shape(format!(
                "embedding table is {:?}, expected ({}, {})",
                self.embeddings.table.dim(),
                config.hidden_size,
                config.vocab_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_config::PositionalMode;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_block_shapes_follow_config() {
        let config = ModelConfig::new(2, 3, 7).with_positional_mode(PositionalMode::Pointer, 1, 2);
        let mut rng = StdRng::seed_from_u64(7);
        let model = Seq2SeqModel::new(&config, 0.1, &mut rng).unwrap();
        assert_eq!(model.block(0, false).dim(), (12, 6));
        assert_eq!(model.block(0, true).dim(), (12, 9));
        assert_eq!(model.block(1, true).dim(), (12, 6));
        model.validate_shapes(&config).unwrap();
    }

    #[test]
    fn test_shape_mismatch_detected() {
        let config = ModelConfig::new(1, 2, 5);
        let mut rng = StdRng::seed_from_u64(1);
        let mut model = Seq2SeqModel::new(&config, 0.1, &mut rng).unwrap();
        model.decoder[0] = Array2::zeros((8, 5));
        assert!(matches!(
            model.validate_shapes(&config),
            Err(ModelError::Shape { .. })
        ));
    }

    #[test]
    fn test_seeded_init_is_reproducible() {
        let config = ModelConfig::new(1, 2, 5);
        let a = Seq2SeqModel::new(&config, 0.1, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = Seq2SeqModel::new(&config, 0.1, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a.encoder, b.encoder);
        assert_eq!(a.embeddings.table, b.embeddings.table);
    }
}
