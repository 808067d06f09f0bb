use seatfx_core::config::ConfigError;
use seatfx_core::{
    build_model, CancelToken, Experiment, ExperimentConfig, JsonlScalarSink, ModelDims,
    RunOutcome, SeatingDataset, SyntheticConfig, ZoneLayout,
};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = load_config()?;
    let data = SeatingDataset::generate(SyntheticConfig {
        batch_size: config.batch_size,
        seed: config.seed,
        ..SyntheticConfig::default()
    });
    let (din, dtreat, dout) = data.dims();
    config.din = Some(din);
    config.dtreat = Some(dtreat);
    config.dout = Some(dout);
    println!(
        "Loaded config: model={} epochs={} units={} din={} dtreat={} dout={}",
        config.model,
        config.epoch,
        data.len(),
        din,
        dtreat,
        dout
    );

    let dims = ModelDims {
        din,
        dtreat,
        dout,
        channels: SyntheticConfig::default().channels,
    };
    let model = build_model(&config, &dims, ZoneLayout::default(), None)?;
    let mut sink = JsonlScalarSink::create(config.scalar_log_path())?;
    let experiment = Experiment::new(config)?;

    match experiment.run(model, &data.loaders(), &mut sink, CancelToken::new())? {
        RunOutcome::Skipped(dup) => {
            println!("Already recorded as run {} (ledger row {})", dup.run_id, dup.index);
        }
        RunOutcome::Completed(summary) => {
            let out = summary.report.evaluation.without;
            println!(
                "Run {} complete. Valid RMSE {:.4}, out-of-sample PEHE {:.4}, ATE {:.4}",
                summary.run_id, summary.report.valid_rmse, out.pehe, out.ate
            );
            println!("Predictions archived to {}", summary.archive_path.display());
        }
    }
    Ok(())
}

fn load_config() -> Result<ExperimentConfig, ConfigError> {
    ExperimentConfig::load_from_file("config/experiment.toml").or_else(|err| {
        eprintln!("Falling back to default config: {err}");
        Ok(ExperimentConfig::default())
    })
}
