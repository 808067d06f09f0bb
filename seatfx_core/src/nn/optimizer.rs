//! Adam with weight decay, a step learning-rate schedule and gradient clipping.

use std::collections::HashMap;

use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

use super::param::ParamMut;

/// Adam optimizer (Adaptive Moment Estimation).
///
/// Moment estimates are keyed by parameter name. Weight decay is added to the
/// gradient before the moment updates (L2 regularization).
#[derive(Clone, Serialize, Deserialize)]
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    first_moments: HashMap<String, ArrayD<f32>>,
    second_moments: HashMap<String, ArrayD<f32>>,
    t: usize,
}

impl Adam {
    pub fn new(learning_rate: f32, weight_decay: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay,
            first_moments: HashMap::new(),
            second_moments: HashMap::new(),
            t: 0,
        }
    }

    pub fn steps_taken(&self) -> usize {
        self.t
    }

    /// Applies one update to every parameter.
    pub fn step(&mut self, params: &mut [ParamMut<'_>]) {
        self.t += 1;
        let correction1 = 1.0 - self.beta1.powi(self.t as i32);
        let correction2 = 1.0 - self.beta2.powi(self.t as i32);
        let (beta1, beta2) = (self.beta1, self.beta2);
        let (lr, eps, decay) = (self.learning_rate, self.epsilon, self.weight_decay);

        for param in params.iter_mut() {
            let shape = param.value.raw_dim();
            let m = self
                .first_moments
                .entry(param.name.clone())
                .or_insert_with(|| ArrayD::zeros(shape.clone()));
            if m.raw_dim() != shape {
                *m = ArrayD::zeros(shape.clone());
            }
            let v = self
                .second_moments
                .entry(param.name.clone())
                .or_insert_with(|| ArrayD::zeros(shape.clone()));
            if v.raw_dim() != shape {
                *v = ArrayD::zeros(shape.clone());
            }

            Zip::from(&mut param.value)
                .and(&param.grad)
                .and(m)
                .and(v)
                .for_each(|value, &grad, m, v| {
                    let g = grad + decay * *value;
                    *m = beta1 * *m + (1.0 - beta1) * g;
                    *v = beta2 * *v + (1.0 - beta2) * g * g;
                    let m_hat = *m / correction1;
                    let v_hat = *v / correction2;
                    *value -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }
    }
}

/// Multiplies the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLr {
    pub base_lr: f32,
    pub step_size: usize,
    pub gamma: f32,
    epoch: usize,
}

impl StepLr {
    pub fn new(base_lr: f32, step_size: usize) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma: 0.1,
            epoch: 0,
        }
    }

    /// Advances one epoch and writes the new rate into `optimizer`.
    pub fn step(&mut self, optimizer: &mut Adam) {
        self.epoch += 1;
        optimizer.learning_rate = self.current_lr();
    }

    pub fn current_lr(&self) -> f32 {
        self.base_lr * self.gamma.powi((self.epoch / self.step_size) as i32)
    }
}

/// Rescales all gradients so their joint L2 norm is at most `max_norm`.
///
/// Returns the norm measured before clipping.
pub fn clip_grad_norm(params: &mut [ParamMut<'_>], max_norm: f32) -> f32 {
    let total = params
        .iter()
        .map(|p| p.grad.iter().map(|g| g * g).sum::<f32>())
        .sum::<f32>()
        .sqrt();
    if total > max_norm {
        let scale = max_norm / (total + 1e-6);
        for param in params.iter_mut() {
            param.grad.mapv_inplace(|g| g * scale);
        }
    }
    total
}
