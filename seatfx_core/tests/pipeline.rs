use std::collections::BTreeMap;
use std::fs;

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use seatfx_core::nn::ParamMut;
use seatfx_core::stats::{hsic, mmd_rbf, CrossTerm};
use seatfx_core::{
    build_model, get_score, read_predictions, score, Architecture, Batch, BatchLoader,
    CancelToken, EffectError, EffectModel, EffectResult, Experiment, ExperimentConfig,
    ForwardPass, InMemoryLoader, LoaderSet, MemorySink, ModelDims, RunOutcome, ScoreOptions,
    SeatingDataset, SyntheticConfig, Trainer, ZoneLayout,
};
use uuid::Uuid;

/// Predicts the observed outcome exactly.
struct Oracle;

impl EffectModel for Oracle {
    fn name(&self) -> &str {
        "oracle"
    }

    fn forward(&mut self, batch: &Batch) -> EffectResult<ForwardPass> {
        Ok(ForwardPass {
            prediction: batch.outcome.clone(),
            representation: batch.covariate.clone(),
            treatment: batch.treatment.clone(),
            outcome: batch.outcome.clone(),
            mean: batch.mean.clone(),
        })
    }

    fn backward(&mut self, _: &Array2<f32>, _: Option<&Array2<f32>>) -> EffectResult<()> {
        Ok(())
    }

    fn params_mut(&mut self) -> Vec<ParamMut<'_>> {
        Vec::new()
    }
}

fn curve_batch(curves: Array2<f32>) -> Batch {
    let rows = curves.nrows();
    Batch {
        covariate: Array2::zeros((rows, 2)),
        zones: BTreeMap::new(),
        treatment: Array2::eye(rows),
        outcome: curves.clone(),
        mean: curves,
    }
}

fn dataset() -> SeatingDataset {
    SeatingDataset::generate(SyntheticConfig {
        units: 40,
        batch_size: 8,
        ..SyntheticConfig::default()
    })
}

fn dims(data: &SeatingDataset) -> ModelDims {
    let (din, dtreat, dout) = data.dims();
    ModelDims {
        din,
        dtreat,
        dout,
        channels: 3,
    }
}

fn small(model: Architecture) -> ExperimentConfig {
    ExperimentConfig {
        model,
        epoch: 4,
        eval_interval: 2,
        out_rep: 6,
        hidden_rep: 12,
        hidden_gcn: 6,
        lr: 1e-2,
        ..ExperimentConfig::default()
    }
}

#[test]
fn hsic_is_non_negative_on_random_inputs() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..20 {
        let n = rng.gen_range(2..12);
        let a = Array2::from_shape_fn((n, 3), |_| rng.gen_range(-2.0f32..2.0));
        let b = Array2::from_shape_fn((n, 2), |_| rng.gen_range(0.0f32..1.0));
        let value = hsic(a.view(), b.view(), 1.0).unwrap();
        assert!(value >= -1e-6, "hsic {} < 0", value);
    }
}

#[test]
fn standard_mmd_of_identical_groups() {
    let x = Array2::from_shape_fn((5, 3), |(i, j)| (i * 3 + j) as f32 * 0.7);
    let value = mmd_rbf(x.view(), x.view(), 0.5, 0.1, CrossTerm::Standard).unwrap();
    assert!((value - (-2.0 / 5.0)).abs() < 1e-5, "{}", value);
}

#[test]
fn perfect_predictions_score_zero() {
    let curves = ndarray::array![[0.0, 0.3, 0.9], [0.1, 0.5, 0.7], [0.0, 0.0, 0.2]];
    let loader = InMemoryLoader::new(vec![curve_batch(curves.clone()), curve_batch(curves)]);
    let report = score(&mut Oracle, &loader, &ScoreOptions::default()).unwrap();
    let m = report.metrics;
    assert_eq!(m.rmse, 0.0);
    assert_eq!(m.ks, 0.0);
    assert_eq!(m.pehe, 0.0);
    assert!(m.ate.abs() < 1e-12);
    assert_eq!(m.violation, 0.0);
    assert_eq!(report.batches, 2);
}

#[test]
fn violation_tracks_prediction_monotonicity_only() {
    let rising = ndarray::array![[0.0, 0.5, 1.0], [0.0, 0.2, 0.4]];
    let falling = ndarray::array![[1.0, 0.5, 0.0], [0.4, 0.2, 0.0]];
    let rising_report = score(
        &mut Oracle,
        &InMemoryLoader::new(vec![curve_batch(rising)]),
        &ScoreOptions::default(),
    )
    .unwrap();
    let falling_report = score(
        &mut Oracle,
        &InMemoryLoader::new(vec![curve_batch(falling)]),
        &ScoreOptions::default(),
    )
    .unwrap();
    assert_eq!(rising_report.metrics.violation, 0.0);
    assert!((falling_report.metrics.violation - 4.0 / 6.0).abs() < 1e-12);
}

#[test]
fn changing_pair_count_is_rejected() {
    let three = curve_batch(Array2::zeros((3, 2)));
    let two = curve_batch(Array2::zeros((2, 2)));
    let loader = InMemoryLoader::new(vec![three, two]);
    assert!(matches!(
        score(&mut Oracle, &loader, &ScoreOptions::default()),
        Err(EffectError::ShapeMismatch { .. })
    ));
}

#[test]
fn empty_loader_is_an_error() {
    assert!(matches!(
        score(&mut Oracle, &InMemoryLoader::default(), &ScoreOptions::default()),
        Err(EffectError::EmptyLoader { .. })
    ));
}

#[test]
fn limited_scoring_keeps_without_predictions() {
    let data = dataset();
    let loaders = data.loaders();
    let mut model = build_model(
        &small(Architecture::ZoneGcn),
        &dims(&data),
        ZoneLayout::default(),
        None,
    )
    .unwrap();
    let evaluation = get_score(
        model.as_mut(),
        loaders.within.as_ref(),
        loaders.without.as_ref(),
        true,
        Some(3),
    )
    .unwrap();
    assert_eq!(evaluation.predictions.len(), 3);
    assert!(evaluation.without.pehe >= 0.0);
    assert!(evaluation.within.rmse.is_finite());
}

fn single_arm_loader() -> Box<dyn BatchLoader> {
    let mut treatment = Array2::zeros((4, 2));
    treatment.column_mut(0).fill(1.0);
    let outcome = Array2::from_shape_fn((4, 2), |(i, j)| (i + j) as f32 * 0.25);
    Box::new(InMemoryLoader::new(vec![Batch {
        covariate: Array2::from_shape_fn((4, 2), |(i, j)| (i * 2 + j) as f32 * 0.1),
        zones: BTreeMap::new(),
        treatment,
        outcome: outcome.clone(),
        mean: outcome,
    }]))
}

#[test]
fn single_treatment_loader_is_degenerate_for_mmd() {
    let loaders = LoaderSet {
        train: single_arm_loader(),
        valid: single_arm_loader(),
        within: single_arm_loader(),
        without: single_arm_loader(),
    };
    let config = ExperimentConfig {
        mmd: 1.0,
        ..small(Architecture::Tarnet)
    };
    let dims = ModelDims {
        din: 2,
        dtreat: 2,
        dout: 2,
        channels: 3,
    };
    let model = build_model(&config, &dims, ZoneLayout::default(), None).unwrap();
    let mut trainer = Trainer::new(model, &config);
    assert!(matches!(
        trainer.fit(&loaders, &mut MemorySink::new()),
        Err(EffectError::DegenerateBatch { .. })
    ));
}

#[test]
fn training_reduces_the_loss() {
    let data = dataset();
    let loaders = data.loaders();
    let config = ExperimentConfig {
        epoch: 30,
        eval_interval: 100,
        hsic: 0.1,
        ..small(Architecture::Tarnet)
    };
    let model = build_model(&config, &dims(&data), ZoneLayout::default(), None).unwrap();
    let mut trainer = Trainer::new(model, &config);
    let mut sink = MemorySink::new();
    trainer.fit(&loaders, &mut sink).unwrap();

    let train = sink.values("Train RMSE");
    assert_eq!(train.len(), 30);
    assert!(
        train[29] < train[0],
        "train RMSE did not improve: {} -> {}",
        train[0],
        train[29]
    );
}

#[test]
fn cancellation_between_batches() {
    let data = dataset();
    let loaders = data.loaders();
    let config = small(Architecture::ZoneMlp);
    let model = build_model(&config, &dims(&data), ZoneLayout::default(), None).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut trainer = Trainer::new(model, &config).with_cancel_token(cancel);
    assert!(matches!(
        trainer.train_epoch(loaders.train.as_ref()),
        Err(EffectError::Cancelled)
    ));
}

#[test]
fn experiment_writes_archive_and_skips_duplicates() {
    let root = std::env::temp_dir().join(format!("seatfx_experiment_{}", Uuid::new_v4()));
    let data = dataset();
    let loaders = data.loaders();
    let (din, dtreat, dout) = data.dims();
    let config = ExperimentConfig {
        epoch: 2,
        din: Some(din),
        dtreat: Some(dtreat),
        dout: Some(dout),
        log_dir: root.join("runs"),
        savepath: root.join("results"),
        ..small(Architecture::TarnetMost)
    };

    let experiment = Experiment::new(config.clone()).unwrap();
    let model = build_model(&config, &dims(&data), ZoneLayout::default(), None).unwrap();
    let outcome = experiment
        .run(model, &loaders, &mut MemorySink::new(), CancelToken::new())
        .unwrap();
    let summary = match outcome {
        RunOutcome::Completed(summary) => summary,
        RunOutcome::Skipped(dup) => panic!("unexpected skip of {:?}", dup),
    };
    assert_eq!(summary.ledger_index, 0);

    let archived = read_predictions(&summary.archive_path).unwrap();
    assert_eq!(archived.len(), loaders.without.num_batches());
    assert_eq!(archived[0].ypred.len_of(Axis(1)), dout);

    let (json, csv) = config.ledger_paths();
    assert!(json.exists());
    assert!(csv.exists());

    let again = Experiment::new(ExperimentConfig {
        log_dir: root.join("elsewhere"),
        ..config.clone()
    })
    .unwrap();
    let model = build_model(&config, &dims(&data), ZoneLayout::default(), None).unwrap();
    match again
        .run(model, &loaders, &mut MemorySink::new(), CancelToken::new())
        .unwrap()
    {
        RunOutcome::Skipped(dup) => {
            assert_eq!(dup.index, 0);
            assert_eq!(dup.run_id, summary.run_id.to_string());
        }
        RunOutcome::Completed(_) => panic!("duplicate configuration was trained again"),
    }

    fs::remove_dir_all(root).ok();
}
