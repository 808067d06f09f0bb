//! Treatment-effect models: a representation stage followed by an output head.

pub mod assembler;
pub mod builder;
pub mod covariate;
pub mod repeat;

use ndarray::{Array2, Array3};

use crate::data::Batch;
use crate::error::{EffectError, EffectResult};
use crate::nn::mlp::reshape_error;
use crate::nn::{OutputHead, ParamMut};

pub use assembler::{pad_positions, ZoneAssembler, ZoneLayout, ZonePadding};
pub use builder::{build_model, ModelDims};
pub use covariate::CovariateStage;
pub use repeat::{align_rows, fold_rows, tile_rows, RowAlignment};

/// Turns a batch into a `[N, nodes, features]` representation.
pub trait RepresentationStage: Send {
    fn nodes(&self) -> usize;

    fn features(&self) -> usize;

    fn forward(&mut self, batch: &Batch) -> EffectResult<Array3<f32>>;

    /// Accumulates parameter gradients for the last `forward`.
    fn backward(&mut self, grad: &Array3<f32>) -> EffectResult<()>;

    fn params_mut(&mut self, prefix: &str) -> Vec<ParamMut<'_>>;
}

/// Everything a training step needs from one forward pass.
///
/// All tensors share the same (aligned) row count.
#[derive(Debug, Clone)]
pub struct ForwardPass {
    pub prediction: Array2<f32>,
    /// Flattened `[rows, nodes * features]` representation
    pub representation: Array2<f32>,
    pub treatment: Array2<f32>,
    pub outcome: Array2<f32>,
    pub mean: Array2<f32>,
}

/// A trainable outcome model conditioned on covariates and treatment.
pub trait EffectModel: Send {
    fn name(&self) -> &str;

    fn forward(&mut self, batch: &Batch) -> EffectResult<ForwardPass>;

    /// Backpropagates the prediction gradient plus an optional gradient on
    /// the flattened representation (from the HSIC/MMD penalties).
    fn backward(
        &mut self,
        grad_prediction: &Array2<f32>,
        grad_representation: Option<&Array2<f32>>,
    ) -> EffectResult<()>;

    fn params_mut(&mut self) -> Vec<ParamMut<'_>>;

    fn zero_grad(&mut self) {
        for mut param in self.params_mut() {
            param.grad.fill(0.0);
        }
    }
}

/// Representation stage plus output head with the row-repetition rule between them.
pub struct CausalNet {
    name: String,
    stage: Box<dyn RepresentationStage>,
    head: Box<dyn OutputHead>,
    alignment: Option<RowAlignment>,
}

impl CausalNet {
    pub fn new(
        name: impl Into<String>,
        stage: Box<dyn RepresentationStage>,
        head: Box<dyn OutputHead>,
    ) -> Self {
        Self {
            name: name.into(),
            stage,
            head,
            alignment: None,
        }
    }
}

impl EffectModel for CausalNet {
    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&mut self, batch: &Batch) -> EffectResult<ForwardPass> {
        let representation = self.stage.forward(batch)?;
        let alignment = align_rows(representation.shape()[0], batch.treatment.nrows())?;

        let (representation, treatment, outcome, mean) = match alignment {
            RowAlignment::Same => (
                representation,
                batch.treatment.clone(),
                batch.outcome.clone(),
                batch.mean.clone(),
            ),
            RowAlignment::TileRepresentation { copies, .. } => (
                tile_rows(&representation, copies)?,
                batch.treatment.clone(),
                batch.outcome.clone(),
                batch.mean.clone(),
            ),
            RowAlignment::TileTreatment { copies } => (
                representation,
                tile_rows(&batch.treatment, copies)?,
                tile_rows(&batch.outcome, copies)?,
                tile_rows(&batch.mean, copies)?,
            ),
        };

        let prediction = self.head.forward(&representation, &treatment)?;
        let (rows, nodes, features) = representation.dim();
        let flat = representation
            .as_standard_layout()
            .into_owned()
            .into_shape((rows, nodes * features))
            .map_err(|err| reshape_error(err, "representation flattening"))?;

        self.alignment = Some(alignment);
        Ok(ForwardPass {
            prediction,
            representation: flat,
            treatment,
            outcome,
            mean,
        })
    }

    fn backward(
        &mut self,
        grad_prediction: &Array2<f32>,
        grad_representation: Option<&Array2<f32>>,
    ) -> EffectResult<()> {
        let alignment = self
            .alignment
            .take()
            .ok_or_else(|| EffectError::missing_forward(self.name.clone()))?;
        let mut grad = self.head.backward(grad_prediction)?;

        if let Some(extra) = grad_representation {
            let extra = extra
                .to_owned()
                .into_shape(grad.raw_dim())
                .map_err(|err| reshape_error(err, "representation penalty gradient"))?;
            grad += &extra;
        }

        if let RowAlignment::TileRepresentation { rows, .. } = alignment {
            grad = fold_rows(&grad, rows)?;
        }
        self.stage.backward(&grad)
    }

    fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        let mut params = self.stage.params_mut("stage");
        params.extend(self.head.params_mut("head"));
        params
    }
}
