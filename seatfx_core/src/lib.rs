//! # seatfx core
//!
//! Treatment-effect training for evacuation-seating experiments. A model maps
//! the zone tensors of a seating arrangement (or a flat covariate vector) and
//! a treatment to a cumulative-evacuation curve. Training can penalize the
//! dependence between representation and treatment with HSIC or a balanced
//! MMD, and every finished run lands in a per-model result ledger.
//!
//! ## Quick Start
//!
//! ```rust
//! use seatfx_core::stats::{gaussian_kernel, hsic};
//! use ndarray::array;
//!
//! let rep = array![[0.0f32, 1.0], [1.0, 0.0], [0.5, 0.5]];
//! let treatment = array![[1.0f32, 0.0], [0.0, 1.0], [1.0, 0.0]];
//!
//! let k = gaussian_kernel(rep.view(), 1.0);
//! assert_eq!(k[[0, 0]], 1.0);
//! assert!(hsic(rep.view(), treatment.view(), 1.0).unwrap() >= 0.0);
//! ```
//!
//! ## Core Modules
//!
//! - [`stats`] - Gaussian kernel, HSIC and MMD with gradients
//! - [`model`] - Zone assembler, covariate stage and the configured architectures
//! - [`scoring`] - RMSE, PEHE, ATE, KS and monotonicity violation
//! - [`trainer`] - Epoch loop with penalties, clipping and step decay
//! - [`ledger`] - JSON/CSV result ledger with duplicate detection
//! - [`experiment`] - A full run from configuration to ledger record

pub mod archive;
pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod ledger;
pub mod logging;
pub mod model;
pub mod nn;
pub mod scoring;
pub mod stats;
pub mod trainer;

pub use archive::{read_predictions, write_predictions, ArchiveError, PredictionPair};
pub use config::{Architecture, ConfigError, ExperimentConfig};
pub use data::{Batch, BatchLoader, InMemoryLoader, LoaderSet, SeatingDataset, SyntheticConfig, ZoneKey};
pub use error::{EffectError, EffectResult};
pub use experiment::{Experiment, RunOutcome, RunSummary};
pub use ledger::{DuplicateOf, Ledger};
pub use logging::{JsonlScalarSink, MemorySink, ScalarSink};
pub use model::{build_model, EffectModel, ForwardPass, ModelDims, ZoneLayout};
pub use scoring::{get_score, score, EffectMetrics, Evaluation, ScoreOptions, ScoreReport};
pub use trainer::{CancelToken, Trainer, TrainingReport};
