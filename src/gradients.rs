use std::fmt;

use ndarray::Array2;

use crate::Real;
use crate::aggregator::SparseGradient;
use crate::output_layer::OutputGradients;

/// Named parameter block of a sequence-to-sequence model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamSlot {
    Encoder(usize),
    Decoder(usize),
    Embedding,
    Softmax,
    Feed,
}

impl fmt::Display for ParamSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamSlot::Encoder(layer) => write!(f, "encoder[{layer}]"),
            ParamSlot::Decoder(layer) => write!(f, "decoder[{layer}]"),
            ParamSlot::Embedding => write!(f, "embedding"),
            ParamSlot::Softmax => write!(f, "softmax"),
            ParamSlot::Feed => write!(f, "feed"),
        }
    }
}

/// All gradients of one cost/gradient call.
///
/// Recurrent blocks and output weights are dense; the embedding table gradient only
/// covers the vocabulary entries that were read.
#[derive(Debug, Clone)]
pub struct ModelGradients {
    pub encoder: Vec<Array2<Real>>,
    pub decoder: Vec<Array2<Real>>,
    pub embedding: SparseGradient,
    pub output: OutputGradients,
}

impl ModelGradients {
    /// Every slot carrying a gradient, encoder layers first
    pub fn slots(&self) -> Vec<ParamSlot> {
        let mut slots: Vec<ParamSlot> = (0..self.encoder.len()).map(ParamSlot::Encoder).collect();
        slots.extend((0..self.decoder.len()).map(ParamSlot::Decoder));
        slots.push(ParamSlot::Embedding);
        slots.push(ParamSlot::Softmax);
        if self.output.feed.is_some() {
            slots.push(ParamSlot::Feed);
        }
        slots
    }

    /// Dense gradient of a slot; `None` for the sparse embedding slot and absent blocks
    pub fn dense(&self, slot: ParamSlot) -> Option<&Array2<Real>> {
        match slot {
            ParamSlot::Encoder(layer) => self.encoder.get(layer),
            ParamSlot::Decoder(layer) => self.decoder.get(layer),
            ParamSlot::Embedding => None,
            ParamSlot::Softmax => Some(&self.output.softmax),
            ParamSlot::Feed => self.output.feed.as_ref(),
        }
    }

    /// Gradient of a single parameter entry, zero where nothing was accumulated
    pub fn entry(&self, slot: ParamSlot, row: usize, col: usize) -> Real {
        match slot {
            ParamSlot::Embedding => self
                .embedding
                .get(col)
                .and_then(|column| column.get(row).copied())
                .unwrap_or(0.0),
            _ => self
                .dense(slot)
                .and_then(|grad| grad.get((row, col)).copied())
                .unwrap_or(0.0),
        }
    }

    pub fn squared_norm(&self) -> Real {
        let dense: Real = self
            .encoder
            .iter()
            .chain(&self.decoder)
            .chain(std::iter::once(&self.output.softmax))
            .chain(&self.output.feed)
            .map(|grad| grad.iter().map(|v| v * v).sum::<Real>())
            .sum();
        dense + self.embedding.squared_norm()
    }

    pub fn norm(&self) -> Real {
        self.squared_norm().sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::EmbeddingGradAccumulator;
    use ndarray::array;

    fn grads() -> ModelGradients {
        let mut acc = EmbeddingGradAccumulator::new(2);
        acc.push(3, array![1.0, 2.0].view()).unwrap();
        ModelGradients {
            encoder: vec![array![[1.0]]],
            decoder: vec![array![[2.0]]],
            embedding: acc.aggregate(),
            output: OutputGradients {
                softmax: array![[0.0, 2.0]],
                feed: None,
            },
        }
    }

    #[test]
    fn test_slots_and_entries() {
        let grads = grads();
        assert_eq!(
            grads.slots(),
            vec![
                ParamSlot::Encoder(0),
                ParamSlot::Decoder(0),
                ParamSlot::Embedding,
                ParamSlot::Softmax
            ]
        );
        assert_eq!(grads.entry(ParamSlot::Embedding, 1, 3), 2.0);
        assert_eq!(grads.entry(ParamSlot::Embedding, 1, 4), 0.0);
        assert_eq!(grads.entry(ParamSlot::Softmax, 0, 1), 2.0);
        assert_eq!(grads.entry(ParamSlot::Feed, 0, 0), 0.0);
    }

    #[test]
    fn test_squared_norm() {
        assert_eq!(grads().squared_norm(), 1.0 + 4.0 + 1.0 + 4.0 + 4.0);
    }

    #[test]
    fn test_slot_names() {
        assert_eq!(ParamSlot::Decoder(1).to_string(), "decoder[1]");
    }
}
