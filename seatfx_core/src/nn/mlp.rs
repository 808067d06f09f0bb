//! Two-layer perceptrons: a plain one over rows and a pooled per-position one.

use ndarray::{Array2, Array3, Axis};

use super::linear::Linear;
use super::param::{scoped, ParamMut, Parameterized};
use crate::error::{EffectError, EffectResult};

pub(crate) fn reshape_error(err: ndarray::ShapeError, context: &str) -> EffectError {
    EffectError::shape_mismatch("contiguous reshape", err.to_string(), context)
}

pub(crate) fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

pub(crate) fn relu_derivative(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 })
}

/// Activations needed to run [`Mlp::backward`].
#[derive(Debug, Clone)]
pub struct MlpTrace {
    input: Array2<f32>,
    hidden_pre: Array2<f32>,
    hidden: Array2<f32>,
}

/// `Linear → ReLU → Linear`.
#[derive(Debug, Clone)]
pub struct Mlp {
    pub first: Linear,
    pub second: Linear,
}

impl Mlp {
    pub fn new(input: usize, hidden: usize, output: usize, seed: u64) -> Self {
        Self {
            first: Linear::new(input, hidden, seed),
            second: Linear::new(hidden, output, seed.wrapping_add(1)),
        }
    }

    pub fn output_dim(&self) -> usize {
        self.second.output_dim()
    }

    pub fn forward(&self, input: &Array2<f32>) -> EffectResult<(Array2<f32>, MlpTrace)> {
        let hidden_pre = self.first.forward(input)?;
        let hidden = relu(&hidden_pre);
        let output = self.second.forward(&hidden)?;
        Ok((
            output,
            MlpTrace {
                input: input.clone(),
                hidden_pre,
                hidden,
            },
        ))
    }

    pub fn backward(&mut self, trace: &MlpTrace, grad_output: &Array2<f32>) -> Array2<f32> {
        let grad_hidden = self.second.backward(&trace.hidden, grad_output);
        let grad_pre = grad_hidden * relu_derivative(&trace.hidden_pre);
        self.first.backward(&trace.input, &grad_pre)
    }
}

impl Parameterized for Mlp {
    fn params_mut(&mut self, prefix: &str) -> Vec<ParamMut<'_>> {
        let mut params = self.first.params_mut(&scoped(prefix, "first"));
        params.extend(self.second.params_mut(&scoped(prefix, "second")));
        params
    }
}

/// Trace of one [`PooledMlp`] application.
#[derive(Debug, Clone)]
pub struct PooledTrace {
    mlp: MlpTrace,
    samples: usize,
    positions: usize,
    channels: usize,
}

/// Per-position MLP over `[N, positions, channels]` followed by a mean over positions.
///
/// The output is `[N, features]` whatever the number of positions, so one set
/// of weights can encode zones of different lengths.
#[derive(Debug, Clone)]
pub struct PooledMlp {
    pub mlp: Mlp,
}

impl PooledMlp {
    pub fn new(channels: usize, hidden: usize, features: usize, seed: u64) -> Self {
        Self {
            mlp: Mlp::new(channels, hidden, features, seed),
        }
    }

    pub fn features(&self) -> usize {
        self.mlp.output_dim()
    }

    pub fn forward(&self, input: &Array3<f32>) -> EffectResult<(Array2<f32>, PooledTrace)> {
        let (samples, positions, channels) = input.dim();
        if positions == 0 {
            return Err(EffectError::shape_mismatch(
                "at least one position",
                input.dim(),
                "pooled encoder input",
            ));
        }
        let flat = input
            .as_standard_layout()
            .into_owned()
            .into_shape((samples * positions, channels))
            .map_err(|err| reshape_error(err, "pooled encoder reshape"))?;
        let (per_position, mlp) = self.mlp.forward(&flat)?;
        let features = per_position.ncols();
        let stacked = per_position
            .into_shape((samples, positions, features))
            .map_err(|err| reshape_error(err, "pooled encoder output"))?;
        let pooled = stacked.sum_axis(Axis(1)) / positions as f32;
        Ok((
            pooled,
            PooledTrace {
                mlp,
                samples,
                positions,
                channels,
            },
        ))
    }

    /// Returns the gradient for the encoder input.
    pub fn backward(
        &mut self,
        trace: &PooledTrace,
        grad_output: &Array2<f32>,
    ) -> EffectResult<Array3<f32>> {
        let features = grad_output.ncols();
        let share = grad_output / trace.positions as f32;
        let spread = share
            .insert_axis(Axis(1))
            .broadcast((trace.samples, trace.positions, features))
            .ok_or_else(|| {
                EffectError::shape_mismatch(
                    (trace.samples, features),
                    grad_output.dim(),
                    "pooled encoder gradient",
                )
            })?
            .to_owned()
            .into_shape((trace.samples * trace.positions, features))
            .map_err(|err| reshape_error(err, "pooled encoder gradient"))?;
        let grad_input = self.mlp.backward(&trace.mlp, &spread);
        grad_input
            .into_shape((trace.samples, trace.positions, trace.channels))
            .map_err(|err| reshape_error(err, "pooled encoder input gradient"))
    }
}

impl Parameterized for PooledMlp {
    fn params_mut(&mut self, prefix: &str) -> Vec<ParamMut<'_>> {
        self.mlp.params_mut(prefix)
    }
}
