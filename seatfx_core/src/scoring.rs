//! Scoring engine: factual error plus pairwise treatment-effect metrics.
//!
//! Evaluation loaders hold one unit under several treatments per batch, so
//! every pair of rows `(i, j)` is a counterfactual comparison. Pair
//! accumulators are positional across batches.

use ndarray::{Array2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::archive::PredictionPair;
use crate::data::BatchLoader;
use crate::error::{ensure_finite, EffectError, EffectResult};
use crate::model::EffectModel;

/// Threshold below which a step of a predicted curve counts as a decrease.
const VIOLATION_TOLERANCE: f32 = -1e-20;

#[derive(Debug, Clone, Copy, Default)]
pub struct ScoreOptions {
    pub keep_predictions: bool,
    /// Maximum number of batches to score
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectMetrics {
    pub rmse: f64,
    pub pehe: f64,
    pub ate: f64,
    pub ks: f64,
    pub violation: f64,
}

impl EffectMetrics {
    pub fn ensure_finite(&self, context: &str) -> EffectResult<()> {
        ensure_finite(self.rmse, &format!("{} rmse", context))?;
        ensure_finite(self.pehe, &format!("{} pehe", context))?;
        ensure_finite(self.ate, &format!("{} ate", context))?;
        ensure_finite(self.ks, &format!("{} ks", context))?;
        ensure_finite(self.violation, &format!("{} violation", context))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScoreReport {
    pub metrics: EffectMetrics,
    pub batches: usize,
    pub predictions: Vec<PredictionPair>,
}

/// In-sample and out-of-sample metrics of one evaluation.
#[derive(Debug, Clone, Default)]
pub struct Evaluation {
    pub within: EffectMetrics,
    pub without: EffectMetrics,
    /// Predictions of the out-of-sample loader, when requested
    pub predictions: Vec<PredictionPair>,
}

/// Per-batch factual statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchErrors {
    pub mse: f64,
    pub ks: f64,
    pub violation: f64,
}

pub fn batch_errors(prediction: &Array2<f32>, truth: &Array2<f32>) -> EffectResult<BatchErrors> {
    if prediction.dim() != truth.dim() {
        return Err(EffectError::shape_mismatch(
            truth.dim(),
            prediction.dim(),
            "scored prediction",
        ));
    }
    if prediction.is_empty() {
        return Err(EffectError::degenerate("empty prediction"));
    }
    let diff = prediction - truth;
    let mse = diff.mapv(|d| (d as f64) * (d as f64)).mean().unwrap_or(0.0);
    let ks = diff
        .axis_iter(Axis(0))
        .map(|row| row.iter().fold(0.0f64, |acc, &d| acc.max(d.abs() as f64)))
        .sum::<f64>()
        / diff.nrows() as f64;
    Ok(BatchErrors {
        mse,
        ks,
        violation: violation_fraction(prediction),
    })
}

/// Fraction of entries whose next step along the last axis decreases.
pub fn violation_fraction(prediction: &Array2<f32>) -> f64 {
    if prediction.is_empty() {
        return 0.0;
    }
    let decreases = prediction
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .zip(row.iter().skip(1))
                .filter(|(a, b)| *b - *a < VIOLATION_TOLERANCE)
                .count()
        })
        .sum::<usize>();
    decreases as f64 / prediction.len() as f64
}

/// Mean of `a`, `b` and `(a − b)²` over the outcome axis for every row pair `i < j`.
pub fn pair_effects(prediction: &Array2<f32>, reference: &Array2<f32>) -> Vec<(f64, f64, f64)> {
    let rows = prediction.nrows();
    let pairs: Vec<(usize, usize)> = (0..rows)
        .flat_map(|i| (i + 1..rows).map(move |j| (i, j)))
        .collect();
    let width = prediction.ncols().max(1) as f64;
    pairs
        .par_iter()
        .map(|&(i, j)| {
            let mut sum_a = 0.0f64;
            let mut sum_b = 0.0f64;
            let mut sum_sq = 0.0f64;
            for k in 0..prediction.ncols() {
                let a = (prediction[[i, k]] - prediction[[j, k]]) as f64;
                let b = (reference[[i, k]] - reference[[j, k]]) as f64;
                sum_a += a;
                sum_b += b;
                sum_sq += (a - b) * (a - b);
            }
            (sum_a / width, sum_b / width, sum_sq / width)
        })
        .collect()
}

/// Scores `model` over `loader`.
pub fn score(
    model: &mut dyn EffectModel,
    loader: &dyn BatchLoader,
    options: &ScoreOptions,
) -> EffectResult<ScoreReport> {
    let total = loader.num_batches();
    if total == 0 {
        return Err(EffectError::EmptyLoader {
            context: format!("scoring {}", model.name()),
        });
    }
    let batches = options.limit.map_or(total, |limit| limit.min(total));

    let mut mse = 0.0f64;
    let mut ks = 0.0f64;
    let mut violation = 0.0f64;
    let mut accumulators: Option<Vec<(f64, f64, f64)>> = None;
    let mut predictions = Vec::new();

    for index in 0..batches {
        let batch = loader.load(index)?;
        let pass = model.forward(&batch)?;
        let errors = batch_errors(&pass.prediction, &pass.outcome)?;
        mse += errors.mse;
        ks += errors.ks;
        violation += errors.violation;

        let effects = pair_effects(&pass.prediction, &pass.mean);
        match accumulators.as_mut() {
            None => accumulators = Some(effects),
            Some(acc) => {
                if acc.len() != effects.len() {
                    return Err(EffectError::shape_mismatch(
                        acc.len(),
                        effects.len(),
                        format!("treatment pairs in batch {}", index),
                    ));
                }
                for (slot, value) in acc.iter_mut().zip(effects) {
                    slot.0 += value.0;
                    slot.1 += value.1;
                    slot.2 += value.2;
                }
            }
        }

        if options.keep_predictions {
            predictions.push(PredictionPair {
                y: pass.outcome,
                ypred: pass.prediction,
            });
        }

        let seen = (index + 1) as f64;
        tracing::debug!(
            model = model.name(),
            batch = index,
            rmse = (mse / seen).sqrt(),
            ks = ks / seen,
            violation = violation / seen,
            "scored batch"
        );
    }

    let n = batches as f64;
    let acc = accumulators.unwrap_or_default();
    let (ate, pehe) = if acc.is_empty() {
        (0.0, 0.0)
    } else {
        let pairs = acc.len() as f64;
        let mean_a = acc.iter().map(|p| p.0 / n).sum::<f64>() / pairs;
        let mean_b = acc.iter().map(|p| p.1 / n).sum::<f64>() / pairs;
        let pehe = acc.iter().map(|p| (p.2 / n).sqrt()).sum::<f64>() / pairs;
        (mean_a - mean_b, pehe)
    };

    Ok(ScoreReport {
        metrics: EffectMetrics {
            rmse: (mse / n).sqrt(),
            pehe,
            ate,
            ks: ks / n,
            violation: violation / n,
        },
        batches,
        predictions,
    })
}

/// Scores the in-sample and out-of-sample loaders.
///
/// Predictions are kept for `without` only.
pub fn get_score(
    model: &mut dyn EffectModel,
    within: &dyn BatchLoader,
    without: &dyn BatchLoader,
    keep_predictions: bool,
    limit: Option<usize>,
) -> EffectResult<Evaluation> {
    let within_report = score(
        model,
        within,
        &ScoreOptions {
            keep_predictions: false,
            limit,
        },
    )?;
    let without_report = score(
        model,
        without,
        &ScoreOptions {
            keep_predictions,
            limit,
        },
    )?;
    Ok(Evaluation {
        within: within_report.metrics,
        without: without_report.metrics,
        predictions: without_report.predictions,
    })
}
