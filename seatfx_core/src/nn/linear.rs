//! Fully connected layer with explicit gradients.

use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::param::{scoped, ParamMut, Parameterized};
use crate::error::{EffectError, EffectResult};

/// `y = x · Wᵀ + b` over rows of `x`.
///
/// `backward` accumulates into the parameter gradients, so a layer shared by
/// several inputs collects the sum of their contributions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Linear {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
    #[serde(skip)]
    grad_weight: Array2<f32>,
    #[serde(skip)]
    grad_bias: Array1<f32>,
}

impl Linear {
    /// Uniform initialization scaled by `sqrt(2 / input)`.
    pub fn new(input: usize, output: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let scale = (2.0 / input.max(1) as f32).sqrt();
        let weight = Array2::from_shape_fn((output, input), |_| {
            (rng.gen::<f32>() - 0.5) * 2.0 * scale
        });
        Self {
            weight,
            bias: Array1::zeros(output),
            grad_weight: Array2::zeros((output, input)),
            grad_bias: Array1::zeros(output),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.weight.ncols()
    }

    pub fn output_dim(&self) -> usize {
        self.weight.nrows()
    }

    pub fn grad_weight(&self) -> &Array2<f32> {
        &self.grad_weight
    }

    pub fn forward(&self, input: &Array2<f32>) -> EffectResult<Array2<f32>> {
        if input.ncols() != self.input_dim() {
            return Err(EffectError::shape_mismatch(
                self.input_dim(),
                input.ncols(),
                "linear layer input width",
            ));
        }
        Ok(input.dot(&self.weight.t()) + &self.bias)
    }

    /// Accumulates parameter gradients and returns the gradient for `input`.
    pub fn backward(&mut self, input: &Array2<f32>, grad_output: &Array2<f32>) -> Array2<f32> {
        if self.grad_weight.dim() != self.weight.dim() {
            self.grad_weight = Array2::zeros(self.weight.dim());
            self.grad_bias = Array1::zeros(self.bias.len());
        }
        self.grad_weight += &grad_output.t().dot(input);
        self.grad_bias += &grad_output.sum_axis(Axis(0));
        grad_output.dot(&self.weight)
    }
}

impl Parameterized for Linear {
    fn params_mut(&mut self, prefix: &str) -> Vec<ParamMut<'_>> {
        if self.grad_weight.dim() != self.weight.dim() {
            self.grad_weight = Array2::zeros(self.weight.dim());
            self.grad_bias = Array1::zeros(self.bias.len());
        }
        vec![
            ParamMut {
                name: scoped(prefix, "weight"),
                value: self.weight.view_mut().into_dyn(),
                grad: self.grad_weight.view_mut().into_dyn(),
            },
            ParamMut {
                name: scoped(prefix, "bias"),
                value: self.bias.view_mut().into_dyn(),
                grad: self.grad_bias.view_mut().into_dyn(),
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn forward_applies_weight_and_bias() {
        let mut layer = Linear::new(2, 1, 0);
        layer.weight = array![[2.0, -1.0]];
        layer.bias = array![0.5];
        let out = layer.forward(&array![[1.0, 1.0], [3.0, 0.0]]).unwrap();
        assert_eq!(out, array![[1.5], [6.5]]);
    }

    #[test]
    fn rejects_wrong_width() {
        let layer = Linear::new(3, 2, 0);
        assert!(matches!(
            layer.forward(&Array2::zeros((1, 4))),
            Err(EffectError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn backward_accumulates_across_calls() {
        let mut layer = Linear::new(2, 1, 0);
        let x = array![[1.0, 2.0]];
        let g = array![[1.0]];
        layer.backward(&x, &g);
        layer.backward(&x, &g);
        let params = layer.params_mut("lin");
        assert_eq!(params[0].name, "lin.weight");
        assert_eq!(params[0].grad.as_slice().unwrap(), &[2.0, 4.0]);
        assert_eq!(params[1].grad.as_slice().unwrap(), &[2.0]);
    }

    #[test]
    fn zero_grad_clears() {
        let mut layer = Linear::new(2, 1, 0);
        layer.backward(&array![[1.0, 2.0]], &array![[1.0]]);
        layer.zero_grad();
        assert!(layer.params_mut("").iter().all(|p| p.grad.iter().all(|&g| g == 0.0)));
    }
}
