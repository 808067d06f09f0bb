//! Experiment configuration loaded from TOML files.
//!
//! A configuration file holds a single `[experiment]` table. Every key is
//! optional and falls back to the defaults below; validation runs after
//! parsing so that nonsensical values never reach the trainer.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::stats::{CrossTerm, MmdKernel, MmdSettings, Split};

/// Fields that describe the environment of a run rather than the experiment.
///
/// They are stripped from ledger records and ignored by duplicate detection.
pub const VOLATILE_FIELDS: [&str; 9] = [
    "din",
    "dtreat",
    "dout",
    "device",
    "disable_cuda",
    "dirpath",
    "log_dir",
    "savepath",
    "run_id",
];

/// Model families that can be trained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// Covariate MLP representation with a concat head.
    Tarnet,
    /// [`Architecture::Tarnet`] with the most-common MMD split.
    TarnetMost,
    /// Zone encoder with a concat MLP head.
    ZoneMlp,
    /// Zone encoder with a graph-convolution head.
    ZoneGcn,
}

impl Architecture {
    pub fn name(&self) -> &'static str {
        match self {
            Architecture::Tarnet => "tarnet",
            Architecture::TarnetMost => "tarnet_most",
            Architecture::ZoneMlp => "zone_mlp",
            Architecture::ZoneGcn => "zone_gcn",
        }
    }

    pub fn uses_zones(&self) -> bool {
        matches!(self, Architecture::ZoneMlp | Architecture::ZoneGcn)
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Full description of one training run.
///
/// # Examples
///
/// ```
/// use seatfx_core::ExperimentConfig;
///
/// let config: ExperimentConfig = "[experiment]\nmodel = \"zone_gcn\"\nepoch = 20"
///     .parse()
///     .unwrap();
/// assert_eq!(config.epoch, 20);
/// assert_eq!(config.eval_interval, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub model: Architecture,
    pub expid: u32,
    pub epoch: usize,
    pub batch_size: usize,
    pub lr: f64,
    /// Weight decay (L2) applied by the optimizer
    pub wd: f64,
    /// Epochs between learning-rate decays
    pub step: usize,
    /// Smooth-max temperature; zero selects plain MSE
    pub alpha: f64,
    /// HSIC penalty weight
    pub hsic: f64,
    /// MMD penalty weight
    pub mmd: f64,
    /// Kernel width of the HSIC Gram matrices
    pub sigma: f64,
    /// MMD treated-arm weight; falls back to `sigma` when unset
    pub propensity: Option<f64>,
    pub mmd_bandwidth: f64,
    pub mmd_kernel: MmdKernel,
    pub mmd_split: Split,
    pub mmd_cross_term: CrossTerm,
    pub out_rep: usize,
    pub hidden_rep: usize,
    pub hidden_gcn: usize,
    pub eval_interval: usize,
    pub eval_limit_batches: usize,
    pub clip_norm: f64,
    pub seed: u64,

    pub din: Option<usize>,
    pub dtreat: Option<usize>,
    pub dout: Option<usize>,
    pub device: String,
    pub disable_cuda: bool,
    pub dirpath: Option<PathBuf>,
    pub log_dir: PathBuf,
    pub savepath: PathBuf,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            model: Architecture::ZoneGcn,
            expid: 0,
            epoch: 300,
            batch_size: 32,
            lr: 1e-3,
            wd: 1e-4,
            step: 100,
            alpha: 0.0,
            hsic: 0.0,
            mmd: 0.0,
            sigma: 1.0,
            propensity: None,
            mmd_bandwidth: 0.1,
            mmd_kernel: MmdKernel::Rbf,
            mmd_split: Split::Random,
            mmd_cross_term: CrossTerm::Literal,
            out_rep: 32,
            hidden_rep: 64,
            hidden_gcn: 32,
            eval_interval: 100,
            eval_limit_batches: 12,
            clip_norm: 1.0,
            seed: 42,
            din: None,
            dtreat: None,
            dout: None,
            device: "cpu".to_string(),
            disable_cuda: false,
            dirpath: None,
            log_dir: PathBuf::from("runs/default"),
            savepath: PathBuf::from("results"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawExperimentFile {
    #[serde(default)]
    experiment: ExperimentConfig,
}

impl FromStr for ExperimentConfig {
    type Err = ConfigError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let raw: RawExperimentFile =
            toml::from_str(toml_str).map_err(|err| ConfigError::Parse(err.to_string()))?;
        raw.experiment.validate()?;
        Ok(raw.experiment)
    }
}

impl ExperimentConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        contents.parse()
    }

    /// Rejects values the trainer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive_counts = [
            ("epoch", self.epoch),
            ("batch_size", self.batch_size),
            ("step", self.step),
            ("out_rep", self.out_rep),
            ("hidden_rep", self.hidden_rep),
            ("hidden_gcn", self.hidden_gcn),
            ("eval_interval", self.eval_interval),
            ("eval_limit_batches", self.eval_limit_batches),
        ];
        for (name, value) in positive_counts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }

        let positive_reals = [
            ("lr", self.lr),
            ("sigma", self.sigma),
            ("mmd_bandwidth", self.mmd_bandwidth),
            ("clip_norm", self.clip_norm),
        ];
        for (name, value) in positive_reals {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }

        let weights = [
            ("wd", self.wd),
            ("alpha", self.alpha),
            ("hsic", self.hsic),
            ("mmd", self.mmd),
        ];
        for (name, value) in weights {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "{} must be non-negative, got {}",
                    name, value
                )));
            }
        }

        if let Some(p) = self.propensity {
            if !(p > 0.0 && p < 1.0) {
                return Err(ConfigError::Invalid(format!(
                    "propensity must lie in (0, 1), got {}",
                    p
                )));
            }
        }
        Ok(())
    }

    /// Non-volatile fields as a JSON object, the identity of a run in the ledger.
    pub fn hyperparameters(&self) -> Map<String, Value> {
        let mut map = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        for field in VOLATILE_FIELDS {
            map.remove(field);
        }
        map
    }

    /// Split actually used for MMD; `tarnet_most` always uses the most common value.
    pub fn effective_split(&self) -> Split {
        match self.model {
            Architecture::TarnetMost => Split::MostCommon,
            _ => self.mmd_split,
        }
    }

    /// Weight `p` of the MMD treated arm: `propensity` if set, else `sigma`.
    pub fn effective_propensity(&self) -> f64 {
        self.propensity.unwrap_or(self.sigma)
    }

    pub fn mmd_settings(&self) -> MmdSettings {
        MmdSettings {
            kernel: self.mmd_kernel,
            split: self.effective_split(),
            propensity: self.effective_propensity() as f32,
            bandwidth: self.mmd_bandwidth as f32,
            cross_term: self.mmd_cross_term,
        }
    }

    /// Ledger JSON and CSV paths for this model family.
    pub fn ledger_paths(&self) -> (PathBuf, PathBuf) {
        let dir = self.savepath.join("each_result");
        let name = self.model.name();
        (
            dir.join(format!("{}.json", name)),
            dir.join(format!("{}.csv", name)),
        )
    }

    pub fn archive_path(&self) -> PathBuf {
        self.log_dir.join("y.bin.gz")
    }

    pub fn scalar_log_path(&self) -> PathBuf {
        self.log_dir.join("scalars.jsonl")
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(String),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(msg) => write!(f, "Parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}
