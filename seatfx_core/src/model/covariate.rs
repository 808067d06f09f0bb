//! Representation of the flat covariate vector as a single node.

use ndarray::{Array3, Axis};

use super::RepresentationStage;
use crate::data::Batch;
use crate::error::{EffectError, EffectResult};
use crate::nn::mlp::MlpTrace;
use crate::nn::{Mlp, ParamMut, Parameterized};

pub struct CovariateStage {
    mlp: Mlp,
    trace: Option<MlpTrace>,
}

impl CovariateStage {
    pub fn new(din: usize, hidden: usize, features: usize, seed: u64) -> Self {
        Self {
            mlp: Mlp::new(din, hidden, features, seed),
            trace: None,
        }
    }
}

impl RepresentationStage for CovariateStage {
    fn nodes(&self) -> usize {
        1
    }

    fn features(&self) -> usize {
        self.mlp.output_dim()
    }

    fn forward(&mut self, batch: &Batch) -> EffectResult<Array3<f32>> {
        let (output, trace) = self.mlp.forward(&batch.covariate)?;
        self.trace = Some(trace);
        Ok(output.insert_axis(Axis(1)))
    }

    fn backward(&mut self, grad: &Array3<f32>) -> EffectResult<()> {
        let trace = self
            .trace
            .take()
            .ok_or_else(|| EffectError::missing_forward("covariate stage"))?;
        let grad = grad.index_axis(Axis(1), 0).to_owned();
        self.mlp.backward(&trace, &grad);
        Ok(())
    }

    fn params_mut(&mut self, prefix: &str) -> Vec<ParamMut<'_>> {
        self.mlp.params_mut(prefix)
    }
}
