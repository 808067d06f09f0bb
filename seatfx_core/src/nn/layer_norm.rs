//! Layer normalization over the `(nodes, features)` plane of each sample.

use ndarray::{Array1, Array2, Array3, Axis, Zip};

use super::param::{scoped, ParamMut, Parameterized};
use crate::error::{EffectError, EffectResult};

const EPSILON: f32 = 1e-5;

#[derive(Debug, Clone)]
pub struct LayerNormTrace {
    normalized: Array3<f32>,
    inv_std: Array1<f32>,
}

/// Learned elementwise affine over a per-sample normalized `[nodes, features]` block.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    pub gamma: Array2<f32>,
    pub beta: Array2<f32>,
    grad_gamma: Array2<f32>,
    grad_beta: Array2<f32>,
}

impl LayerNorm {
    pub fn new(nodes: usize, features: usize) -> Self {
        Self {
            gamma: Array2::ones((nodes, features)),
            beta: Array2::zeros((nodes, features)),
            grad_gamma: Array2::zeros((nodes, features)),
            grad_beta: Array2::zeros((nodes, features)),
        }
    }

    pub fn forward(&self, input: &Array3<f32>) -> EffectResult<(Array3<f32>, LayerNormTrace)> {
        let (samples, nodes, features) = input.dim();
        if (nodes, features) != self.gamma.dim() {
            return Err(EffectError::shape_mismatch(
                self.gamma.dim(),
                (nodes, features),
                "layer norm plane",
            ));
        }

        let mut normalized = Array3::zeros(input.raw_dim());
        let mut inv_std = Array1::zeros(samples);
        for ((sample, mut out), inv) in input
            .outer_iter()
            .zip(normalized.outer_iter_mut())
            .zip(inv_std.iter_mut())
        {
            let mean = sample.mean().unwrap_or(0.0);
            let var = sample.mapv(|v| (v - mean) * (v - mean)).mean().unwrap_or(0.0);
            *inv = 1.0 / (var + EPSILON).sqrt();
            let scale = *inv;
            out.assign(&sample.mapv(|v| (v - mean) * scale));
        }

        let output = &normalized * &self.gamma + &self.beta;
        Ok((
            output,
            LayerNormTrace {
                normalized,
                inv_std,
            },
        ))
    }

    pub fn backward(&mut self, trace: &LayerNormTrace, grad_output: &Array3<f32>) -> Array3<f32> {
        self.grad_gamma += &(grad_output * &trace.normalized).sum_axis(Axis(0));
        self.grad_beta += &grad_output.sum_axis(Axis(0));

        let grad_norm = grad_output * &self.gamma;
        let plane = (self.gamma.len()) as f32;
        let mut grad_input = Array3::zeros(grad_output.raw_dim());
        for (((g, xhat), mut out), &inv) in grad_norm
            .outer_iter()
            .zip(trace.normalized.outer_iter())
            .zip(grad_input.outer_iter_mut())
            .zip(trace.inv_std.iter())
        {
            let sum_g = g.sum();
            let sum_gx = (&g * &xhat).sum();
            Zip::from(&mut out)
                .and(&g)
                .and(&xhat)
                .for_each(|o, &gi, &xi| {
                    *o = inv / plane * (plane * gi - sum_g - xi * sum_gx);
                });
        }
        grad_input
    }
}

impl Parameterized for LayerNorm {
    fn params_mut(&mut self, prefix: &str) -> Vec<ParamMut<'_>> {
        vec![
            ParamMut {
                name: scoped(prefix, "gamma"),
                value: self.gamma.view_mut().into_dyn(),
                grad: self.grad_gamma.view_mut().into_dyn(),
            },
            ParamMut {
                name: scoped(prefix, "beta"),
                value: self.beta.view_mut().into_dyn(),
                grad: self.grad_beta.view_mut().into_dyn(),
            },
        ]
    }
}
