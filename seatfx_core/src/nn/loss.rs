//! Regression losses with gradients.

use ndarray::Array2;

use crate::error::{EffectError, EffectResult};

fn check_shapes(predicted: &Array2<f32>, target: &Array2<f32>) -> EffectResult<()> {
    if predicted.dim() != target.dim() {
        return Err(EffectError::shape_mismatch(
            target.dim(),
            predicted.dim(),
            "loss prediction",
        ));
    }
    if predicted.is_empty() {
        return Err(EffectError::degenerate("loss over an empty prediction"));
    }
    Ok(())
}

/// Mean squared error and its gradient with respect to `predicted`.
pub fn mse_loss(predicted: &Array2<f32>, target: &Array2<f32>) -> EffectResult<(f32, Array2<f32>)> {
    check_shapes(predicted, target)?;
    let diff = predicted - target;
    let n = diff.len() as f32;
    let loss = diff.mapv(|x| x * x).sum() / n;
    Ok((loss, diff * (2.0 / n)))
}

/// Smooth maximum of squared errors, `1/α · ln(mean(exp(α·e²)))`.
///
/// Large `alpha` approaches the worst-case squared error; the gradient is
/// `softmax(α·e²) · 2e`.
pub fn smooth_max_loss(
    predicted: &Array2<f32>,
    target: &Array2<f32>,
    alpha: f32,
) -> EffectResult<(f32, Array2<f32>)> {
    check_shapes(predicted, target)?;
    let diff = predicted - target;
    let scores = diff.mapv(|e| alpha * e * e);
    let max = scores.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let exp = scores.mapv(|s| (s - max).exp());
    let total = exp.sum();
    let n = diff.len() as f32;
    let loss = (max + total.ln() - n.ln()) / alpha;
    let grad = exp / total * &diff * 2.0;
    Ok((loss, grad))
}

/// Training loss: MSE when `alpha` is zero, smooth-max otherwise.
pub fn regression_loss(
    predicted: &Array2<f32>,
    target: &Array2<f32>,
    alpha: f32,
) -> EffectResult<(f32, Array2<f32>)> {
    if alpha == 0.0 {
        mse_loss(predicted, target)
    } else {
        smooth_max_loss(predicted, target, alpha)
    }
}
