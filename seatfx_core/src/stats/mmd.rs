//! Maximum Mean Discrepancy between the treated and control parts of a batch.

use std::cmp::Ordering;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{EffectError, EffectResult};

/// Sign applied to the cross-group term of [`mmd_rbf`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrossTerm {
    /// Adds the cross term. Matches the historical results in existing ledgers.
    #[default]
    Literal,
    /// Subtracts the cross term (the usual MMD² estimator).
    Standard,
}

impl CrossTerm {
    fn sign(self) -> f32 {
        match self {
            CrossTerm::Literal => 1.0,
            CrossTerm::Standard => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MmdKernel {
    #[default]
    Rbf,
    Linear,
}

/// How distinct treatment values are divided into the two MMD arms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    /// Half of the distinct values go to each arm, reshuffled on every call.
    #[default]
    Random,
    /// The most frequent value is the control arm, everything else is treated.
    MostCommon,
}

/// Parameters of a balanced MMD evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MmdSettings {
    pub kernel: MmdKernel,
    pub split: Split,
    pub propensity: f32,
    pub bandwidth: f32,
    pub cross_term: CrossTerm,
}

impl Default for MmdSettings {
    fn default() -> Self {
        Self {
            kernel: MmdKernel::Rbf,
            split: Split::Random,
            propensity: 0.5,
            bandwidth: 0.1,
            cross_term: CrossTerm::Literal,
        }
    }
}

/// A value of an MMD statistic with the gradients for both groups.
#[derive(Debug, Clone)]
pub struct MmdGrad {
    pub value: f32,
    pub treated: Array2<f32>,
    pub control: Array2<f32>,
}

fn check_groups(treated: &ArrayView2<f32>, control: &ArrayView2<f32>) -> EffectResult<()> {
    if treated.nrows() == 0 || control.nrows() == 0 {
        return Err(EffectError::degenerate(format!(
            "MMD needs both groups non-empty (treated {}, control {})",
            treated.nrows(),
            control.nrows()
        )));
    }
    if treated.ncols() != control.ncols() {
        return Err(EffectError::shape_mismatch(
            treated.ncols(),
            control.ncols(),
            "MMD feature width",
        ));
    }
    Ok(())
}

fn column_mean(x: &ArrayView2<f32>) -> EffectResult<Array1<f32>> {
    x.mean_axis(Axis(0))
        .ok_or_else(|| EffectError::degenerate("mean over an empty group"))
}

/// `‖2p·mean(treated) − 2(1−p)·mean(control)‖²`
pub fn mmd_linear(treated: ArrayView2<f32>, control: ArrayView2<f32>, p: f32) -> EffectResult<f32> {
    Ok(mmd_linear_with_grad(treated, control, p)?.value)
}

pub fn mmd_linear_with_grad(
    treated: ArrayView2<f32>,
    control: ArrayView2<f32>,
    p: f32,
) -> EffectResult<MmdGrad> {
    check_groups(&treated, &control)?;
    let diff = column_mean(&treated)? * (2.0 * p) - column_mean(&control)? * (2.0 * (1.0 - p));
    let value = diff.mapv(|v| v * v).sum();

    let n = treated.nrows() as f32;
    let m = control.nrows() as f32;
    let row = diff.insert_axis(Axis(0));
    let grad_t = &row * (2.0 * 2.0 * p / n);
    let grad_c = &row * (-2.0 * 2.0 * (1.0 - p) / m);

    Ok(MmdGrad {
        value,
        treated: grad_t
            .broadcast(treated.raw_dim())
            .map(|v| v.to_owned())
            .unwrap_or_else(|| Array2::zeros(treated.raw_dim())),
        control: grad_c
            .broadcast(control.raw_dim())
            .map(|v| v.to_owned())
            .unwrap_or_else(|| Array2::zeros(control.raw_dim())),
    })
}

/// Euclidean distances between every row of `x` and every row of `y`.
fn pairwise_distances(x: &ArrayView2<f32>, y: &ArrayView2<f32>) -> Array2<f32> {
    let rows: Vec<Vec<f32>> = (0..x.nrows())
        .into_par_iter()
        .map(|i| {
            let xi = x.row(i);
            (0..y.nrows())
                .map(|j| {
                    xi.iter()
                        .zip(y.row(j).iter())
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f32>()
                        .sqrt()
                })
                .collect()
        })
        .collect();
    let cols = y.nrows();
    Array2::from_shape_fn((x.nrows(), cols), |(i, j)| rows[i][j])
}

/// Kernel matrix and `dK/dd` weights (`-K / (s·d)`, zero where `d == 0`).
fn rbf_block(x: &ArrayView2<f32>, y: &ArrayView2<f32>, scale: f32) -> (Array2<f32>, Array2<f32>) {
    let dist = pairwise_distances(x, y);
    let kernel = dist.mapv(|d| (-d / scale).exp());
    let mut weights = Array2::zeros(dist.raw_dim());
    ndarray::Zip::from(&mut weights)
        .and(&dist)
        .and(&kernel)
        .for_each(|w, &d, &k| {
            if d > 0.0 {
                *w = -k / (scale * d);
            }
        });
    (kernel, weights)
}

/// `Σ_j W[i][j] · (x_i − y_j)` for every row `i` of `x`.
fn weighted_offsets(weights: &Array2<f32>, x: &ArrayView2<f32>, y: &ArrayView2<f32>) -> Array2<f32> {
    let row_sum = weights.sum_axis(Axis(1)).insert_axis(Axis(1));
    x * &row_sum - weights.dot(y)
}

/// RBF-kernel MMD with `K = exp(−d / sqrt(bandwidth))` on Euclidean distances.
pub fn mmd_rbf(
    treated: ArrayView2<f32>,
    control: ArrayView2<f32>,
    p: f32,
    bandwidth: f32,
    cross_term: CrossTerm,
) -> EffectResult<f32> {
    check_groups(&treated, &control)?;
    let scale = bandwidth.sqrt();
    let k_cc = pairwise_distances(&control, &control).mapv(|d| (-d / scale).exp());
    let k_tt = pairwise_distances(&treated, &treated).mapv(|d| (-d / scale).exp());
    let k_ct = pairwise_distances(&control, &treated).mapv(|d| (-d / scale).exp());
    let (c_cc, c_tt, c_ct) = rbf_coefficients(treated.nrows(), control.nrows(), p, cross_term);

    let m = control.nrows() as f32;
    let n = treated.nrows() as f32;
    Ok(c_cc * (k_cc.sum() - m) + c_tt * (k_tt.sum() - n) + c_ct * k_ct.sum())
}

fn rbf_coefficients(n: usize, m: usize, p: f32, cross_term: CrossTerm) -> (f32, f32, f32) {
    let n = n as f32;
    let m = m as f32;
    let q = 1.0 - p;
    (
        4.0 * q * q / (m * m),
        4.0 * p * p / (n * n),
        4.0 * cross_term.sign() * 2.0 * p * q / (m * n),
    )
}

pub fn mmd_rbf_with_grad(
    treated: ArrayView2<f32>,
    control: ArrayView2<f32>,
    p: f32,
    bandwidth: f32,
    cross_term: CrossTerm,
) -> EffectResult<MmdGrad> {
    check_groups(&treated, &control)?;
    let scale = bandwidth.sqrt();
    let (k_cc, w_cc) = rbf_block(&control, &control, scale);
    let (k_tt, w_tt) = rbf_block(&treated, &treated, scale);
    let (k_ct, w_ct) = rbf_block(&control, &treated, scale);
    let (c_cc, c_tt, c_ct) = rbf_coefficients(treated.nrows(), control.nrows(), p, cross_term);

    let m = control.nrows() as f32;
    let n = treated.nrows() as f32;
    let value = c_cc * (k_cc.sum() - m) + c_tt * (k_tt.sum() - n) + c_ct * k_ct.sum();

    // within-group sums see each row twice (as i and as j)
    let grad_c = weighted_offsets(&w_cc, &control, &control) * (2.0 * c_cc)
        + weighted_offsets(&w_ct, &control, &treated) * c_ct;
    let w_tc = w_ct.t().to_owned();
    let grad_t = weighted_offsets(&w_tt, &treated, &treated) * (2.0 * c_tt)
        + weighted_offsets(&w_tc, &treated, &control) * c_ct;

    Ok(MmdGrad {
        value,
        treated: grad_t,
        control: grad_c,
    })
}

/// Row indices of the two arms chosen by a [`Split`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub treated: Vec<usize>,
    pub control: Vec<usize>,
}

fn cmp_rows(a: &[f32], b: &[f32]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match x.total_cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Groups samples by exact treatment row and assigns the distinct values to arms.
///
/// Distinct values are ordered lexicographically. Label 0 becomes the treated
/// arm and label 1 the control arm.
pub fn partition_by_treatment<R: Rng + ?Sized>(
    treatment: ArrayView2<f32>,
    split: Split,
    rng: &mut R,
) -> EffectResult<Partition> {
    let rows: Vec<Vec<f32>> = treatment.outer_iter().map(|r| r.to_vec()).collect();
    let mut values = rows.clone();
    values.sort_by(|a, b| cmp_rows(a, b));
    values.dedup();

    let value_of: Vec<usize> = rows
        .iter()
        .map(|row| values.iter().position(|v| v == row).unwrap_or(0))
        .collect();

    let labels: Vec<u8> = match split {
        Split::Random => {
            let half = values.len() / 2;
            let mut labels = vec![0u8; half];
            labels.resize(values.len(), 1);
            labels.shuffle(rng);
            labels
        }
        Split::MostCommon => {
            let mut counts = vec![0usize; values.len()];
            for &v in &value_of {
                counts[v] += 1;
            }
            let mut best = 0;
            for (idx, &count) in counts.iter().enumerate() {
                if count > counts[best] {
                    best = idx;
                }
            }
            let mut labels = vec![0u8; values.len()];
            if !labels.is_empty() {
                labels[best] = 1;
            }
            labels
        }
    };

    let mut partition = Partition {
        treated: Vec::new(),
        control: Vec::new(),
    };
    for (sample, &v) in value_of.iter().enumerate() {
        if labels[v] == 0 {
            partition.treated.push(sample);
        } else {
            partition.control.push(sample);
        }
    }

    if partition.treated.is_empty() || partition.control.is_empty() {
        return Err(EffectError::degenerate(format!(
            "{} distinct treatment value(s) left one MMD arm empty",
            values.len()
        )));
    }
    Ok(partition)
}

/// Balanced MMD value only.
pub fn balanced_mmd<R: Rng + ?Sized>(
    representation: ArrayView2<f32>,
    treatment: ArrayView2<f32>,
    settings: &MmdSettings,
    rng: &mut R,
) -> EffectResult<f32> {
    Ok(balanced_mmd_with_grad(representation, treatment, settings, rng)?.0)
}

/// Balanced MMD and its gradient scattered back onto the representation rows.
pub fn balanced_mmd_with_grad<R: Rng + ?Sized>(
    representation: ArrayView2<f32>,
    treatment: ArrayView2<f32>,
    settings: &MmdSettings,
    rng: &mut R,
) -> EffectResult<(f32, Array2<f32>)> {
    if representation.nrows() != treatment.nrows() {
        return Err(EffectError::shape_mismatch(
            representation.nrows(),
            treatment.nrows(),
            "balanced MMD rows",
        ));
    }
    let partition = partition_by_treatment(treatment, settings.split, rng)?;
    let treated = representation.select(Axis(0), &partition.treated);
    let control = representation.select(Axis(0), &partition.control);

    let result = match settings.kernel {
        MmdKernel::Rbf => mmd_rbf_with_grad(
            treated.view(),
            control.view(),
            settings.propensity,
            settings.bandwidth,
            settings.cross_term,
        )?,
        MmdKernel::Linear => {
            mmd_linear_with_grad(treated.view(), control.view(), settings.propensity)?
        }
    };

    let mut grad = Array2::zeros(representation.raw_dim());
    for (k, &row) in partition.treated.iter().enumerate() {
        grad.row_mut(row).assign(&result.treated.row(k));
    }
    for (k, &row) in partition.control.iter().enumerate() {
        grad.row_mut(row).assign(&result.control.row(k));
    }
    Ok((result.value, grad))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn standard_rbf_of_identical_groups_is_minus_two_over_m() {
        let mut rng = StdRng::seed_from_u64(5);
        let x = random_matrix(&mut rng, 4, 3);
        let value = mmd_rbf(x.view(), x.view(), 0.5, 0.1, CrossTerm::Standard).unwrap();
        assert!((value - (-0.5)).abs() < 1e-4, "got {}", value);
    }

    #[test]
    fn literal_cross_term_adds_where_standard_subtracts() {
        let mut rng = StdRng::seed_from_u64(6);
        let t = random_matrix(&mut rng, 3, 2);
        let c = random_matrix(&mut rng, 5, 2);
        let literal = mmd_rbf(t.view(), c.view(), 0.5, 0.1, CrossTerm::Literal).unwrap();
        let standard = mmd_rbf(t.view(), c.view(), 0.5, 0.1, CrossTerm::Standard).unwrap();
        assert!(literal > standard);
    }

    #[test]
    fn linear_mmd_matches_hand_computation() {
        let t = array![[1.0f32, 0.0], [3.0, 2.0]];
        let c = array![[0.0f32, 1.0]];
        // 2·0.5·[2, 1] − 2·0.5·[0, 1] = [2, 0]
        let value = mmd_linear(t.view(), c.view(), 0.5).unwrap();
        assert!((value - 4.0).abs() < 1e-6);
    }

    #[test]
    fn empty_group_is_degenerate() {
        let t = Array2::<f32>::zeros((0, 2));
        let c = Array2::<f32>::zeros((3, 2));
        assert!(matches!(
            mmd_linear(t.view(), c.view(), 0.5),
            Err(EffectError::DegenerateBatch { .. })
        ));
    }

    #[test]
    fn rbf_gradients_match_central_differences() {
        let mut rng = StdRng::seed_from_u64(9);
        let t = random_matrix(&mut rng, 3, 2);
        let c = random_matrix(&mut rng, 4, 2);
        for cross in [CrossTerm::Literal, CrossTerm::Standard] {
            let grad = mmd_rbf_with_grad(t.view(), c.view(), 0.3, 0.5, cross).unwrap();
            let h = 1e-3f32;

            let mut plus = t.clone();
            plus[[1, 0]] += h;
            let mut minus = t.clone();
            minus[[1, 0]] -= h;
            let numeric = (mmd_rbf(plus.view(), c.view(), 0.3, 0.5, cross).unwrap()
                - mmd_rbf(minus.view(), c.view(), 0.3, 0.5, cross).unwrap())
                / (2.0 * h);
            assert!((numeric - grad.treated[[1, 0]]).abs() < 1e-2);

            let mut plus = c.clone();
            plus[[2, 1]] += h;
            let mut minus = c.clone();
            minus[[2, 1]] -= h;
            let numeric = (mmd_rbf(t.view(), plus.view(), 0.3, 0.5, cross).unwrap()
                - mmd_rbf(t.view(), minus.view(), 0.3, 0.5, cross).unwrap())
                / (2.0 * h);
            assert!((numeric - grad.control[[2, 1]]).abs() < 1e-2);
        }
    }

    #[test]
    fn linear_gradient_matches_central_differences() {
        let mut rng = StdRng::seed_from_u64(10);
        let t = random_matrix(&mut rng, 3, 2);
        let c = random_matrix(&mut rng, 2, 2);
        let grad = mmd_linear_with_grad(t.view(), c.view(), 0.4).unwrap();
        let h = 1e-2f32;
        let mut plus = c.clone();
        plus[[0, 1]] += h;
        let mut minus = c.clone();
        minus[[0, 1]] -= h;
        let numeric = (mmd_linear(t.view(), plus.view(), 0.4).unwrap()
            - mmd_linear(t.view(), minus.view(), 0.4).unwrap())
            / (2.0 * h);
        assert!((numeric - grad.control[[0, 1]]).abs() < 1e-3);
    }

    #[test]
    fn most_common_value_becomes_control() {
        let treatment = array![[0.0f32, 1.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]];
        let mut rng = StdRng::seed_from_u64(1);
        let partition = partition_by_treatment(treatment.view(), Split::MostCommon, &mut rng).unwrap();
        assert_eq!(partition.control, vec![0, 2, 3]);
        assert_eq!(partition.treated, vec![1]);
    }

    #[test]
    fn most_common_ties_pick_first_sorted_value() {
        let treatment = array![[1.0f32, 0.0], [0.0, 1.0]];
        let mut rng = StdRng::seed_from_u64(1);
        let partition = partition_by_treatment(treatment.view(), Split::MostCommon, &mut rng).unwrap();
        // [0, 1] sorts before [1, 0]
        assert_eq!(partition.control, vec![1]);
    }

    #[test]
    fn random_split_keeps_groups_intact() {
        let treatment = array![[0.0f32], [1.0], [2.0], [0.0], [1.0], [2.0], [3.0]];
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..10 {
            let partition = partition_by_treatment(treatment.view(), Split::Random, &mut rng).unwrap();
            // four values: two per arm
            let treated_values: std::collections::BTreeSet<i32> = partition
                .treated
                .iter()
                .map(|&i| treatment[[i, 0]] as i32)
                .collect();
            let control_values: std::collections::BTreeSet<i32> = partition
                .control
                .iter()
                .map(|&i| treatment[[i, 0]] as i32)
                .collect();
            assert_eq!(treated_values.len(), 2);
            assert_eq!(control_values.len(), 2);
            assert!(treated_values.is_disjoint(&control_values));
        }
    }

    #[test]
    fn single_treatment_value_is_degenerate() {
        let treatment = array![[1.0f32, 0.0], [1.0, 0.0], [1.0, 0.0]];
        let rep = Array2::<f32>::ones((3, 4));
        let mut rng = StdRng::seed_from_u64(0);
        for split in [Split::Random, Split::MostCommon] {
            let settings = MmdSettings {
                split,
                ..MmdSettings::default()
            };
            assert!(matches!(
                balanced_mmd(rep.view(), treatment.view(), &settings, &mut rng),
                Err(EffectError::DegenerateBatch { .. })
            ));
        }
    }

    #[test]
    fn balanced_gradient_lands_on_partition_rows() {
        let treatment = array![[1.0f32, 0.0], [0.0, 1.0], [0.0, 1.0]];
        let mut rng = StdRng::seed_from_u64(2);
        let rep = random_matrix(&mut rng, 3, 2);
        let settings = MmdSettings {
            kernel: MmdKernel::Linear,
            split: Split::MostCommon,
            ..MmdSettings::default()
        };
        let (value, grad) =
            balanced_mmd_with_grad(rep.view(), treatment.view(), &settings, &mut rng).unwrap();
        assert!(value >= 0.0);
        // two control rows share the control-mean gradient
        assert_eq!(grad.row(1), grad.row(2));
    }
}
