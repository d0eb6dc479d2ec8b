//! Positional source extraction for decoder timesteps.
//!
//! At the first layer of every decoder timestep the recurrence asks the active
//! extractor for auxiliary source-side information about each batch row's aligned
//! source position. What comes back, and where its gradient goes, depends on the
//! positional model:
//!
//! | model            | forward                                  | backward                         |
//! |------------------|------------------------------------------|----------------------------------|
//! | embedding-concat | aligned source word embedding, concatenated | embedding rows that were read |
//! | pointer          | aligned source hidden state or null/eos embedding, concatenated | source hidden buffer, null/eos rows |
//! | copy             | same vector, stored for the output layer | handled by the output layer      |
//!
//! Plain and attention calls use [`NoExtractor`].

use ndarray::{Array2, Array3, ArrayView1, ArrayView2, s};

use crate::Real;
use crate::aggregator::EmbeddingGradAccumulator;
use crate::batch::Alignment;
use crate::embeddings::Embeddings;
use crate::errors::{ModelError, Result};
use crate::masking::MaskInfo;
use crate::model_config::{ModelConfig, SourceChannel};

/// Bookkeeping recorded at a decoder offset and replayed by the backward sweep
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SideData {
    #[default]
    None,
    /// `(row, embedding index)` per real row
    EmbeddingConcat { lookups: Vec<(usize, usize)> },
    Pointer {
        null_rows: Vec<usize>,
        eos_rows: Vec<usize>,
        /// `(row, source position)`
        source_rows: Vec<(usize, usize)>,
    },
}

/// Everything an extractor may read for one decoder timestep
pub struct ExtractQuery<'a> {
    /// Decoder offset `timestep - boundary`
    pub offset: usize,
    pub timestep: usize,
    pub embeddings: &'a Embeddings,
    /// `[batch, total_timesteps]` token ids
    pub input: &'a Array2<usize>,
    /// `[hidden, batch, num_source_hidden_vecs]`
    pub source_hidden: Option<&'a Array3<Real>>,
    /// Alignment of each row at this decoder offset
    pub alignments: ArrayView1<'a, Alignment>,
    pub mask: &'a MaskInfo,
}

impl ExtractQuery<'_> {
    fn batch_size(&self) -> usize {
        self.mask.batch_size()
    }

    fn source_hidden(&self) -> Result<&Array3<Real>> {
        self.source_hidden.ok_or_else(|| ModelError::GradientError {
            message: format!(
                "source hidden states not materialized before decoder timestep {}",
                self.timestep
            ),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    /// `[hidden, batch]` rows concatenated under the first-layer input
    pub concat: Option<Array2<Real>>,
    /// `[hidden, batch]` vector stored for the output layer
    pub copied: Option<Array2<Real>>,
    pub side: SideData,
}

/// Gradient destinations available to an extractor's backward scatter
pub struct PositionalGradSink<'a> {
    pub embedding: &'a mut EmbeddingGradAccumulator,
    /// `[hidden, batch, num_source_hidden_vecs]`
    pub source_hidden: Option<&'a mut Array3<Real>>,
}

pub trait SourceExtractor {
    fn extract(&self, query: &ExtractQuery) -> Result<Extraction>;

    /// Route the positional rows of the first-layer input gradient
    fn scatter(
        &self,
        side: &SideData,
        d_positional: ArrayView2<Real>,
        sink: &mut PositionalGradSink,
    ) -> Result<()>;

    /// Number of embedding gradient vectors `scatter` will push for `side`
    fn embedding_contributions(&self, side: &SideData) -> usize;
}

/// Build the extractor for a resolved channel
pub fn extractor_for(channel: SourceChannel, config: &ModelConfig) -> Box<dyn SourceExtractor> {
    let special = SpecialRows {
        null_index: config.null_position_index,
        eos_index: config.eos_position_index,
    };
    match channel {
        SourceChannel::Plain | SourceChannel::Attention => Box::new(NoExtractor),
        SourceChannel::EmbeddingConcat => Box::new(EmbeddingConcatExtractor { special }),
        SourceChannel::Pointer => Box::new(PointerExtractor { special }),
        SourceChannel::Copy => Box::new(CopyExtractor { special }),
    }
}

#[derive(Debug, Clone, Copy)]
struct SpecialRows {
    null_index: usize,
    eos_index: usize,
}

/// Fill `row` of `vectors` from the source hidden state at `p`, or from the null/eos
/// embedding.
fn fill_pointer_row(
    query: &ExtractQuery,
    special: SpecialRows,
    vectors: &mut Array2<Real>,
    row: usize,
) -> Result<()> {
    match query.alignments[row] {
        Alignment::Null => {
            vectors
                .column_mut(row)
                .assign(&query.embeddings.column(special.null_index));
        }
        Alignment::Eos => {
            vectors
                .column_mut(row)
                .assign(&query.embeddings.column(special.eos_index));
        }
        Alignment::Source(p) => {
            vectors
                .column_mut(row)
                .assign(&query.source_hidden()?.slice(s![.., row, p]));
        }
    }
    Ok(())
}

/// Plain and attention calls: the decoder input is never augmented
pub struct NoExtractor;

impl SourceExtractor for NoExtractor {
    fn extract(&self, _query: &ExtractQuery) -> Result<Extraction> {
        Ok(Extraction::default())
    }

    fn scatter(
        &self,
        _side: &SideData,
        _d_positional: ArrayView2<Real>,
        _sink: &mut PositionalGradSink,
    ) -> Result<()> {
        Ok(())
    }

    fn embedding_contributions(&self, _side: &SideData) -> usize {
        0
    }
}

pub struct EmbeddingConcatExtractor {
    special: SpecialRows,
}

impl SourceExtractor for EmbeddingConcatExtractor {
    fn extract(&self, query: &ExtractQuery) -> Result<Extraction> {
        let mut vectors = Array2::zeros((query.embeddings.dim(), query.batch_size()));
        let mut lookups = Vec::with_capacity(query.mask.num_real());
        for &row in &query.mask.unmasked_ids {
            let index = match query.alignments[row] {
                Alignment::Null => self.special.null_index,
                Alignment::Eos => self.special.eos_index,
                Alignment::Source(p) => query.input[[row, p]],
            };
            vectors
                .column_mut(row)
                .assign(&query.embeddings.column(index));
            lookups.push((row, index));
        }
        Ok(Extraction {
            concat: Some(vectors),
            copied: None,
            side: SideData::EmbeddingConcat { lookups },
        })
    }

    fn scatter(
        &self,
        side: &SideData,
        d_positional: ArrayView2<Real>,
        sink: &mut PositionalGradSink,
    ) -> Result<()> {
        if let SideData::EmbeddingConcat { lookups } = side {
            for &(row, index) in lookups {
                sink.embedding.push(index, d_positional.column(row))?;
            }
        }
        Ok(())
    }

    fn embedding_contributions(&self, side: &SideData) -> usize {
        match side {
            SideData::EmbeddingConcat { lookups } => lookups.len(),
            _ => 0,
        }
    }
}

pub struct PointerExtractor {
    special: SpecialRows,
}

impl SourceExtractor for PointerExtractor {
    fn extract(&self, query: &ExtractQuery) -> Result<Extraction> {
        let mut vectors = Array2::zeros((query.embeddings.dim(), query.batch_size()));
        let mut null_rows = Vec::new();
        let mut eos_rows = Vec::new();
        let mut source_rows = Vec::new();
        for &row in &query.mask.unmasked_ids {
            fill_pointer_row(query, self.special, &mut vectors, row)?;
            match query.alignments[row] {
                Alignment::Null => null_rows.push(row),
                Alignment::Eos => eos_rows.push(row),
                Alignment::Source(p) => source_rows.push((row, p)),
            }
        }
        Ok(Extraction {
            concat: Some(vectors),
            copied: None,
            side: SideData::Pointer {
                null_rows,
                eos_rows,
                source_rows,
            },
        })
    }

    fn scatter(
        &self,
        side: &SideData,
        d_positional: ArrayView2<Real>,
        sink: &mut PositionalGradSink,
    ) -> Result<()> {
        let SideData::Pointer {
            null_rows,
            eos_rows,
            source_rows,
        } = side
        else {
            return Ok(());
        };

        for &row in null_rows {
            sink.embedding
                .push(self.special.null_index, d_positional.column(row))?;
        }
        for &row in eos_rows {
            sink.embedding
                .push(self.special.eos_index, d_positional.column(row))?;
        }
        if !source_rows.is_empty() {
            let buffer = sink.source_hidden.as_deref_mut().ok_or_else(|| {
                ModelError::GradientError {
                    message: "pointer model without a source hidden gradient buffer".to_string(),
                }
            })?;
            for &(row, p) in source_rows {
                let mut slot = buffer.slice_mut(s![.., row, p]);
                slot += &d_positional.column(row);
            }
        }
        Ok(())
    }

    fn embedding_contributions(&self, side: &SideData) -> usize {
        match side {
            SideData::Pointer {
                null_rows,
                eos_rows,
                ..
            } => null_rows.len() + eos_rows.len(),
            _ => 0,
        }
    }
}

/// Stores the aligned vector for the output layer; its gradient comes back through
/// the output layer's source hidden and positional embedding channels.
pub struct CopyExtractor {
    special: SpecialRows,
}

impl SourceExtractor for CopyExtractor {
    fn extract(&self, query: &ExtractQuery) -> Result<Extraction> {
        let mut vectors = Array2::zeros((query.embeddings.dim(), query.batch_size()));
        for &row in &query.mask.unmasked_ids {
            fill_pointer_row(query, self.special, &mut vectors, row)?;
        }
        Ok(Extraction {
            concat: None,
            copied: Some(vectors),
            side: SideData::None,
        })
    }

    fn scatter(
        &self,
        _side: &SideData,
        _d_positional: ArrayView2<Real>,
        _sink: &mut PositionalGradSink,
    ) -> Result<()> {
        Ok(())
    }

    fn embedding_contributions(&self, _side: &SideData) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array3, array};

    fn embeddings() -> Embeddings {
        // Column k = [k, -k]
        Embeddings::new(array![
            [0.0, 1.0, 2.0, 3.0, 4.0, 5.0],
            [0.0, -1.0, -2.0, -3.0, -4.0, -5.0]
        ])
    }

    fn config() -> ModelConfig {
        ModelConfig::new(1, 2, 6).with_positional_mode(
            crate::model_config::PositionalMode::Pointer,
            1,
            2,
        )
    }

    #[test]
    fn test_embedding_concat_reads_aligned_source_word() {
        let embeddings = embeddings();
        let input = array![[4, 5, 3], [5, 4, 3]];
        let alignments = array![Alignment::Source(1), Alignment::Eos];
        let mask = MaskInfo::all_real(2);
        let query = ExtractQuery {
            offset: 0,
            timestep: 2,
            embeddings: &embeddings,
            input: &input,
            source_hidden: None,
            alignments: alignments.view(),
            mask: &mask,
        };
        let extractor = extractor_for(SourceChannel::EmbeddingConcat, &config());
        let extraction = extractor.extract(&query).unwrap();
        assert_eq!(
            extraction.concat.unwrap(),
            array![[5.0, 2.0], [-5.0, -2.0]]
        );
        assert_eq!(
            extraction.side,
            SideData::EmbeddingConcat {
                lookups: vec![(0, 5), (1, 2)]
            }
        );
    }

    #[test]
    fn test_pointer_classifies_rows() {
        let embeddings = embeddings();
        let input = array![[4, 5, 3, 3], [5, 4, 3, 3], [5, 4, 3, 3]];
        let source_hidden = Array3::from_shape_fn((2, 3, 2), |(h, b, p)| (h + 10 * b + 100 * p) as Real);
        let alignments = array![Alignment::Null, Alignment::Source(1), Alignment::Eos];
        let mask = MaskInfo::all_real(3);
        let query = ExtractQuery {
            offset: 0,
            timestep: 2,
            embeddings: &embeddings,
            input: &input,
            source_hidden: Some(&source_hidden),
            alignments: alignments.view(),
            mask: &mask,
        };
        let extractor = extractor_for(SourceChannel::Pointer, &config());
        let extraction = extractor.extract(&query).unwrap();
        assert_eq!(
            extraction.concat.unwrap(),
            array![[1.0, 110.0, 2.0], [-1.0, 111.0, -2.0]]
        );
        assert_eq!(
            extraction.side,
            SideData::Pointer {
                null_rows: vec![0],
                eos_rows: vec![2],
                source_rows: vec![(1, 1)],
            }
        );
        assert_eq!(extractor.embedding_contributions(&extraction.side), 2);
    }

    #[test]
    fn test_pointer_scatter_routes_gradients() {
        let extractor = extractor_for(SourceChannel::Pointer, &config());
        let side = SideData::Pointer {
            null_rows: vec![],
            eos_rows: vec![0],
            source_rows: vec![(1, 0)],
        };
        let d_positional = array![[1.0, 3.0], [2.0, 4.0]];
        let mut embedding = EmbeddingGradAccumulator::new(2);
        let mut buffer = Array3::zeros((2, 2, 2));
        let mut sink = PositionalGradSink {
            embedding: &mut embedding,
            source_hidden: Some(&mut buffer),
        };
        extractor.scatter(&side, d_positional.view(), &mut sink).unwrap();

        let sparse = embedding.aggregate();
        assert_eq!(sparse.indices, vec![2]);
        assert_eq!(sparse.get(2).unwrap().to_vec(), vec![1.0, 2.0]);
        assert_eq!(buffer[[0, 1, 0]], 3.0);
        assert_eq!(buffer[[1, 1, 0]], 4.0);
        assert_eq!(buffer.slice(s![.., 0, ..]).sum(), 0.0);
    }

    #[test]
    fn test_copy_skips_padded_rows() {
        let embeddings = embeddings();
        let input = array![[4, 5, 3], [5, 4, 3]];
        let source_hidden = Array3::ones((2, 2, 1));
        let alignments = array![Alignment::Source(0), Alignment::Source(0)];
        let mask = MaskInfo::from_mask(vec![true, false]);
        let query = ExtractQuery {
            offset: 0,
            timestep: 1,
            embeddings: &embeddings,
            input: &input,
            source_hidden: Some(&source_hidden),
            alignments: alignments.view(),
            mask: &mask,
        };
        let extractor = extractor_for(SourceChannel::Copy, &config());
        let extraction = extractor.extract(&query).unwrap();
        assert!(extraction.concat.is_none());
        assert_eq!(extraction.copied.unwrap(), array![[1.0, 0.0], [1.0, 0.0]]);
    }
}
