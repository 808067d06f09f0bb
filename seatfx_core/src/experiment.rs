//! One experiment run: duplicate check, training, archive and ledger update.

use std::path::PathBuf;

use uuid::Uuid;

use crate::archive::write_predictions;
use crate::config::ExperimentConfig;
use crate::data::LoaderSet;
use crate::error::EffectResult;
use crate::ledger::{result_record, DuplicateOf, Ledger};
use crate::logging::ScalarSink;
use crate::model::EffectModel;
use crate::trainer::{CancelToken, Trainer, TrainingReport};

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub report: TrainingReport,
    /// Position of the new record in the ledger
    pub ledger_index: usize,
    pub archive_path: PathBuf,
}

/// A run whose hyperparameters were already recorded is skipped, not failed.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Skipped(DuplicateOf),
    Completed(RunSummary),
}

pub struct Experiment {
    config: ExperimentConfig,
}

impl Experiment {
    pub fn new(config: ExperimentConfig) -> EffectResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn run(
        &self,
        model: Box<dyn EffectModel>,
        loaders: &LoaderSet,
        sink: &mut dyn ScalarSink,
        cancel: CancelToken,
    ) -> EffectResult<RunOutcome> {
        let (json_path, csv_path) = self.config.ledger_paths();
        let mut ledger = Ledger::open(&json_path, &csv_path)?;
        if let Some(duplicate) = ledger.find_duplicate(&self.config) {
            tracing::info!(
                model = %self.config.model,
                run_id = %duplicate.run_id,
                index = duplicate.index,
                "configuration already recorded; skipping"
            );
            return Ok(RunOutcome::Skipped(duplicate));
        }

        let run_id = Uuid::new_v4();
        tracing::info!(
            model = %self.config.model,
            %run_id,
            epochs = self.config.epoch,
            "starting run"
        );

        let mut trainer = Trainer::new(model, &self.config).with_cancel_token(cancel);
        let report = trainer.fit(loaders, sink)?;

        let archive_path = self.config.archive_path();
        write_predictions(&archive_path, &report.evaluation.predictions)?;

        let ledger_index = ledger.append(result_record(&self.config, &run_id, &report))?;
        ledger.save()?;

        tracing::info!(
            %run_id,
            valid_rmse = report.valid_rmse,
            out_pehe = report.evaluation.without.pehe,
            ledger_index,
            "run finished"
        );
        Ok(RunOutcome::Completed(RunSummary {
            run_id,
            report,
            ledger_index,
            archive_path,
        }))
    }
}
