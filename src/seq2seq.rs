use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::Real;
use crate::batch::Batch;
use crate::errors::Result;
use crate::gradients::ParamSlot;
use crate::lstm_unit::{LstmUnit, RecurrentUnit};
use crate::model::Seq2SeqModel;
use crate::model_config::ModelConfig;
use crate::output_layer::{OutputLayer, SoftmaxOutputLayer};
use crate::recurrence::{CostGradOutput, cost_grad};

/// Configuration, recurrent parameters, unit and output layer of one model
#[derive(Clone, Debug)]
pub struct Seq2Seq<U = LstmUnit, O = SoftmaxOutputLayer> {
    pub config: ModelConfig,
    pub model: Seq2SeqModel,
    pub unit: U,
    pub output: O,
}

impl Seq2Seq<LstmUnit, SoftmaxOutputLayer> {
    /// Seeded Gaussian initialization of every parameter block
    pub fn new(config: ModelConfig, init_scale: Real, seed: u64) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let model = Seq2SeqModel::new(&config, init_scale, &mut rng)?;
        let output = SoftmaxOutputLayer::new(&config, init_scale, &mut rng)?;
        Ok(Self {
            unit: LstmUnit::from_config(&config),
            config,
            model,
            output,
        })
    }
}

impl<U: RecurrentUnit, O: OutputLayer> Seq2Seq<U, O> {
    pub fn from_parts(config: ModelConfig, model: Seq2SeqModel, unit: U, output: O) -> Self {
        Self {
            config,
            model,
            unit,
            output,
        }
    }

    pub fn cost_grad(&self, batch: &Batch, is_test: bool) -> Result<CostGradOutput> {
        cost_grad(
            &self.config,
            &self.model,
            &self.unit,
            &self.output,
            batch,
            is_test,
        )
    }
}

impl<U> Seq2Seq<U, SoftmaxOutputLayer> {
    pub fn param(&self, slot: ParamSlot) -> Option<&Array2<Real>> {
        self.model.param(slot).or_else(|| self.output.param(slot))
    }

    pub fn param_mut(&mut self, slot: ParamSlot) -> Option<&mut Array2<Real>> {
        match slot {
            ParamSlot::Softmax | ParamSlot::Feed => self.output.param_mut(slot),
            _ => self.model.param_mut(slot),
        }
    }

    pub fn parameters(&self) -> usize {
        self.model.parameters() + self.output.parameters()
    }
}
