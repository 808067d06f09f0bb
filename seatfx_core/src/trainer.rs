//! Epoch loop: penalized training, validation and periodic evaluation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::ExperimentConfig;
use crate::data::{Batch, BatchLoader, LoaderSet};
use crate::error::{ensure_finite, EffectError, EffectResult};
use crate::logging::ScalarSink;
use crate::model::EffectModel;
use crate::nn::{clip_grad_norm, regression_loss, Adam, StepLr};
use crate::scoring::{batch_errors, get_score, EffectMetrics, Evaluation};
use crate::stats::{balanced_mmd_with_grad, hsic_with_grad};

/// Shared flag polled between batches.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Loss terms of one training batch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepStats {
    pub loss: f64,
    pub hsic: f64,
    pub mmd: f64,
    pub mse: f64,
    pub rows: usize,
    pub grad_norm: f32,
}

/// Outcome of a full fit.
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    pub epochs: usize,
    pub train_rmse: f64,
    pub valid_rmse: f64,
    pub evaluation: Evaluation,
}

/// Trains one [`EffectModel`] with Adam, a step schedule and optional
/// HSIC/MMD representation penalties.
pub struct Trainer {
    model: Box<dyn EffectModel>,
    optimizer: Adam,
    scheduler: StepLr,
    config: ExperimentConfig,
    rng: StdRng,
    cancel: CancelToken,
}

impl Trainer {
    pub fn new(model: Box<dyn EffectModel>, config: &ExperimentConfig) -> Self {
        let lr = config.lr as f32;
        Self {
            model,
            optimizer: Adam::new(lr, config.wd as f32),
            scheduler: StepLr::new(lr, config.step),
            config: config.clone(),
            rng: StdRng::seed_from_u64(config.seed),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn model_mut(&mut self) -> &mut dyn EffectModel {
        self.model.as_mut()
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate
    }

    fn check_cancelled(&self) -> EffectResult<()> {
        if self.cancel.is_cancelled() {
            Err(EffectError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// One optimizer step on `batch`.
    pub fn train_step(&mut self, batch: &Batch) -> EffectResult<StepStats> {
        self.model.zero_grad();
        let pass = self.model.forward(batch)?;
        let (base, grad_prediction) =
            regression_loss(&pass.prediction, &pass.outcome, self.config.alpha as f32)?;

        let mut stats = StepStats {
            loss: base as f64,
            mse: batch_errors(&pass.prediction, &pass.outcome)?.mse,
            rows: pass.prediction.nrows(),
            ..StepStats::default()
        };
        let mut grad_representation: Option<Array2<f32>> = None;

        if self.config.hsic != 0.0 {
            let weight = self.config.hsic;
            let (value, grad) = hsic_with_grad(
                pass.representation.view(),
                pass.treatment.view(),
                self.config.sigma as f32,
            )?;
            stats.hsic = value as f64;
            stats.loss += weight * stats.hsic;
            grad_representation = Some(grad * weight as f32);
        }

        if self.config.mmd != 0.0 {
            let weight = self.config.mmd;
            let (value, grad) = balanced_mmd_with_grad(
                pass.representation.view(),
                pass.treatment.view(),
                &self.config.mmd_settings(),
                &mut self.rng,
            )?;
            stats.mmd = value as f64;
            stats.loss += weight * stats.mmd;
            let grad = grad * weight as f32;
            grad_representation = Some(match grad_representation {
                Some(existing) => existing + grad,
                None => grad,
            });
        }

        ensure_finite(stats.loss, "training loss")?;
        self.model
            .backward(&grad_prediction, grad_representation.as_ref())?;

        let mut params = self.model.params_mut();
        stats.grad_norm = clip_grad_norm(&mut params, self.config.clip_norm as f32);
        self.optimizer.step(&mut params);
        Ok(stats)
    }

    /// Trains over every batch of `loader`; returns the running RMSE.
    pub fn train_epoch(&mut self, loader: &dyn BatchLoader) -> EffectResult<f64> {
        if loader.is_empty() {
            return Err(EffectError::EmptyLoader {
                context: "training".into(),
            });
        }
        let mut weighted = 0.0f64;
        let mut rows = 0usize;
        for index in 0..loader.num_batches() {
            self.check_cancelled()?;
            let batch = loader.load(index)?;
            let stats = self.train_step(&batch)?;
            weighted += stats.mse * stats.rows as f64;
            rows += stats.rows;
            tracing::trace!(
                batch = index,
                loss = stats.loss,
                hsic = stats.hsic,
                mmd = stats.mmd,
                grad_norm = stats.grad_norm,
                "train step"
            );
        }
        ensure_finite((weighted / rows as f64).sqrt(), "Train RMSE")
    }

    /// Forward-only pass over `loader`; returns the running RMSE.
    pub fn validate(&mut self, loader: &dyn BatchLoader) -> EffectResult<f64> {
        if loader.is_empty() {
            return Err(EffectError::EmptyLoader {
                context: "validation".into(),
            });
        }
        let mut weighted = 0.0f64;
        let mut rows = 0usize;
        for index in 0..loader.num_batches() {
            self.check_cancelled()?;
            let batch = loader.load(index)?;
            let pass = self.model.forward(&batch)?;
            let errors = batch_errors(&pass.prediction, &pass.outcome)?;
            weighted += errors.mse * pass.prediction.nrows() as f64;
            rows += pass.prediction.nrows();
        }
        ensure_finite((weighted / rows as f64).sqrt(), "Valid RMSE")
    }

    fn evaluate(
        &mut self,
        loaders: &LoaderSet,
        keep_predictions: bool,
        limit: Option<usize>,
    ) -> EffectResult<Evaluation> {
        self.check_cancelled()?;
        let evaluation = get_score(
            self.model.as_mut(),
            loaders.within.as_ref(),
            loaders.without.as_ref(),
            keep_predictions,
            limit,
        )?;
        evaluation.within.ensure_finite("In")?;
        evaluation.without.ensure_finite("Out")?;
        Ok(evaluation)
    }

    /// Runs every configured epoch followed by the final evaluation.
    pub fn fit(
        &mut self,
        loaders: &LoaderSet,
        sink: &mut dyn ScalarSink,
    ) -> EffectResult<TrainingReport> {
        let epochs = self.config.epoch;
        let interval = self.config.eval_interval.max(1);
        let mut report = TrainingReport {
            epochs,
            ..TrainingReport::default()
        };

        for epoch in 0..epochs {
            report.train_rmse = self.train_epoch(loaders.train.as_ref())?;
            report.valid_rmse = self.validate(loaders.valid.as_ref())?;
            sink.add_scalar("Train RMSE", report.train_rmse, epoch)?;
            sink.add_scalar("Valid RMSE", report.valid_rmse, epoch)?;
            tracing::debug!(
                model = self.model.name(),
                epoch,
                train_rmse = report.train_rmse,
                valid_rmse = report.valid_rmse,
                lr = self.optimizer.learning_rate,
                "epoch finished"
            );

            let last = epoch + 1 == epochs;
            if !last && epoch % interval == interval - 1 {
                let evaluation =
                    self.evaluate(loaders, false, Some(self.config.eval_limit_batches))?;
                tracing::info!(
                    epoch,
                    in_rmse = evaluation.within.rmse,
                    out_rmse = evaluation.without.rmse,
                    out_pehe = evaluation.without.pehe,
                    "periodic evaluation"
                );
            }
            self.scheduler.step(&mut self.optimizer);
        }

        let evaluation = self.evaluate(loaders, true, None)?;
        let step = epochs.saturating_sub(1);
        log_metrics(sink, "In", &evaluation.within, step)?;
        log_metrics(sink, "Out", &evaluation.without, step)?;
        report.evaluation = evaluation;
        Ok(report)
    }
}

fn log_metrics(
    sink: &mut dyn ScalarSink,
    prefix: &str,
    metrics: &EffectMetrics,
    step: usize,
) -> EffectResult<()> {
    let values = [
        ("RMSE", metrics.rmse),
        ("PEHE", metrics.pehe),
        ("ATE", metrics.ate),
        ("KS", metrics.ks),
        ("VIO", metrics.violation),
    ];
    for (name, value) in values {
        sink.add_scalar(&format!("{} {}", prefix, name), value, step)?;
    }
    Ok(())
}
