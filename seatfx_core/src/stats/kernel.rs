//! Gaussian kernels and the Hilbert-Schmidt Independence Criterion.
//!
//! HSIC is used as a training penalty: it measures the statistical dependence
//! between the learned representation and the treatment matrix, so the
//! gradient with respect to the representation is provided alongside the
//! value.

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::error::{EffectError, EffectResult};

/// Gram matrix `exp(-‖a−b‖² / (2·sigma))` over the rows of `x`.
///
/// Squared distances come from `‖a‖² + ‖b‖² − 2a·b`, so the diagonal is
/// exactly one and no bias correction is applied.
pub fn gaussian_kernel(x: ArrayView2<f32>, sigma: f32) -> Array2<f32> {
    let gram = x.dot(&x.t());
    let sq_norms: Array1<f32> = gram.diag().to_owned();
    let gamma = 1.0 / (2.0 * sigma);
    Array2::from_shape_fn(gram.dim(), |(i, j)| {
        let dist = sq_norms[i] + sq_norms[j] - 2.0 * gram[[i, j]];
        (-gamma * dist).exp()
    })
}

/// Subtracts the column mean from every entry.
fn center_columns(k: &Array2<f32>) -> EffectResult<Array2<f32>> {
    let mean = k
        .mean_axis(Axis(0))
        .ok_or_else(|| EffectError::degenerate("kernel centering on an empty batch"))?;
    Ok(k - &mean.insert_axis(Axis(0)))
}

fn check_pair(a: &ArrayView2<f32>, b: &ArrayView2<f32>) -> EffectResult<usize> {
    if a.nrows() != b.nrows() {
        return Err(EffectError::shape_mismatch(
            a.nrows(),
            b.nrows(),
            "HSIC sample count",
        ));
    }
    let n = a.nrows();
    if n < 2 {
        return Err(EffectError::degenerate(format!(
            "HSIC needs at least two samples, got {}",
            n
        )));
    }
    Ok(n)
}

/// Biased HSIC estimate `trace(KH · LH) / (N − 1)²`.
pub fn hsic(a: ArrayView2<f32>, b: ArrayView2<f32>, sigma: f32) -> EffectResult<f32> {
    let n = check_pair(&a, &b)?;
    let kh = center_columns(&gaussian_kernel(a, sigma))?;
    let lh = center_columns(&gaussian_kernel(b, sigma))?;
    let scale = ((n - 1) * (n - 1)) as f32;
    Ok((&kh * &lh.t()).sum() / scale)
}

/// HSIC together with its gradient with respect to `a`.
///
/// `b` is treated as data (the treatment matrix) and receives no gradient.
pub fn hsic_with_grad(
    a: ArrayView2<f32>,
    b: ArrayView2<f32>,
    sigma: f32,
) -> EffectResult<(f32, Array2<f32>)> {
    let n = check_pair(&a, &b)?;
    let k = gaussian_kernel(a, sigma);
    let kh = center_columns(&k)?;
    let lh = center_columns(&gaussian_kernel(b, sigma))?;
    let scale = ((n - 1) * (n - 1)) as f32;
    let value = (&kh * &lh.t()).sum() / scale;

    // d/dK[p][q] = (LH[q][p] - mean_i LH[q][i]) / scale
    let row_mean = lh
        .mean_axis(Axis(1))
        .ok_or_else(|| EffectError::degenerate("HSIC gradient on an empty batch"))?;
    let d_kernel = (&lh.t() - &row_mean.insert_axis(Axis(0))) / scale;

    // chain through K = exp(-gamma * D)
    let gamma = 1.0 / (2.0 * sigma);
    let d_dist = &d_kernel * &k * (-gamma);
    let sym = &d_dist + &d_dist.t();
    let row_sum = sym.sum_axis(Axis(1)).insert_axis(Axis(1));
    let grad = (&a * &row_sum - sym.dot(&a)) * 2.0;

    Ok((value, grad))
}
