pub mod activations;
pub mod aggregator;
pub mod batch;
pub mod embeddings;
pub mod errors;
pub mod grad_check;
pub mod gradients;
pub mod lstm_unit;
pub mod masking;
pub mod model;
pub mod model_config;
pub mod output_layer;
pub mod positional;
pub mod recurrence;
pub mod seq2seq;
// Re-export key structs for easier access
pub use aggregator::{EmbeddingGradAccumulator, SparseGradient};
pub use batch::{Alignment, Batch, BatchDims};
pub use embeddings::Embeddings;
pub use errors::{ModelError, Result};
pub use grad_check::{GradCheckOptions, GradCheckReport, SlotReport, check_gradients};
pub use gradients::{ModelGradients, ParamSlot};
pub use lstm_unit::{LstmState, LstmUnit, RecurrentUnit, UnitContext, UnitGradients};
pub use masking::MaskInfo;
pub use model::Seq2SeqModel;
pub use model_config::{ModelConfig, PositionalMode, Precision, SourceChannel};
pub use output_layer::{
    Costs, OracleGradients, OracleInput, OracleOutput, OutputGradients, OutputLayer,
    SoftmaxOutputLayer,
};
pub use positional::{SideData, SourceExtractor, extractor_for};
pub use recurrence::{CostGradOutput, ForwardCache, Recurrence, cost_grad};
pub use seq2seq::Seq2Seq;

/// Scalar type of every parameter, state and gradient
pub type Real = f64;
